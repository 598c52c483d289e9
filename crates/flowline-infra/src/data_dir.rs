//! Data directory resolution.

use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FLOWLINE_DATA_DIR";

/// Resolve the Flowline data directory.
///
/// Priority:
/// 1. `FLOWLINE_DATA_DIR` environment variable
/// 2. `~/.flowline`
/// 3. `./.flowline`
pub fn resolve_data_dir() -> PathBuf {
    resolve_from(std::env::var(DATA_DIR_ENV).ok(), dirs::home_dir())
}

fn resolve_from(env_value: Option<String>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = env_value.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    if let Some(home) = home {
        return home.join(".flowline");
    }

    // Last resort: current directory
    PathBuf::from(".flowline")
}
