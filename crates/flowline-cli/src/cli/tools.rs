use anyhow::Result;
use comfy_table::{Cell, Color};

use crate::cli::new_table;
use crate::state::AppState;
use flowline_core::tool::ToolRegistry;

pub fn list_tools(state: &AppState, json: bool) -> Result<()> {
    let tools = state.tool_registry()?.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec![
        Cell::new("Name").fg(Color::Cyan),
        Cell::new("Version"),
        Cell::new("Description"),
    ]);
    for tool in &tools {
        table.add_row(vec![
            Cell::new(&tool.name),
            Cell::new(&tool.version),
            Cell::new(&tool.description),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
