//! Template resolution for step input mappings.
//!
//! Input mappings are arbitrary JSON values whose strings may contain
//! `{{ path }}` tokens. A path starts with a namespace (`input`, `steps`,
//! `env`) followed by dot-separated segments, each either a plain key or a
//! `key[idx]` array access.
//!
//! A string that is exactly one token yields the typed value it points at;
//! any other string has each token substituted by its string form.
//! Resolution is total: a path that cannot be followed is undefined, never
//! an error.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static FULL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*([^}]+)\s*\}\}$").expect("valid full-token pattern"));

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+)\s*\}\}").expect("valid token pattern"));

static INDEXED_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\[(\d+)\]$").expect("valid index pattern"));

// ---------------------------------------------------------------------------
// ResolverContext
// ---------------------------------------------------------------------------

/// Data a template may reference.
#[derive(Debug, Clone, Default)]
pub struct ResolverContext {
    /// The run's trigger input.
    pub input: Value,
    /// Outputs of completed steps keyed by step name.
    pub steps: Map<String, Value>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
}

impl ResolverContext {
    pub fn new(input: Value, steps: Map<String, Value>, env: BTreeMap<String, String>) -> Self {
        Self { input, steps, env }
    }

    /// Context with a snapshot of the current process environment.
    pub fn with_process_env(input: Value, steps: Map<String, Value>) -> Self {
        let env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::new(input, steps, env)
    }
}

// ---------------------------------------------------------------------------
// VariableResolver trait
// ---------------------------------------------------------------------------

/// Resolves a template value against a context.
pub trait VariableResolver: Send + Sync {
    /// Resolve `template`. Undefined at the top level materializes as `null`.
    fn resolve(&self, template: &Value, ctx: &ResolverContext) -> Value;
}

// ---------------------------------------------------------------------------
// TemplateResolver
// ---------------------------------------------------------------------------

/// The `{{ namespace.path }}` resolver.
///
/// Undefined (`None` internally) materializes as follows: at the top level
/// it becomes `null`, an object member is dropped, an array element becomes
/// `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver;

impl TemplateResolver {
    pub fn new() -> Self {
        Self
    }

    fn resolve_value(&self, template: &Value, ctx: &ResolverContext) -> Option<Value> {
        match template {
            Value::String(s) => self.resolve_string(s, ctx),
            Value::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, ctx).unwrap_or(Value::Null))
                    .collect(),
            )),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    if let Some(resolved) = self.resolve_value(value, ctx) {
                        out.insert(key.clone(), resolved);
                    }
                }
                Some(Value::Object(out))
            }
            other => Some(other.clone()),
        }
    }

    fn resolve_string(&self, template: &str, ctx: &ResolverContext) -> Option<Value> {
        if let Some(caps) = FULL_TOKEN.captures(template) {
            return evaluate(&caps[1], ctx);
        }

        let replaced = TOKEN.replace_all(template, |caps: &Captures<'_>| {
            evaluate(&caps[1], ctx)
                .map(|v| stringify(&v))
                .unwrap_or_default()
        });
        Some(Value::String(replaced.into_owned()))
    }
}

impl VariableResolver for TemplateResolver {
    fn resolve(&self, template: &Value, ctx: &ResolverContext) -> Value {
        self.resolve_value(template, ctx).unwrap_or(Value::Null)
    }
}

/// Follow a dotted path from its namespace root.
///
/// Walks borrowed values and clones only what the path ends on.
fn evaluate(expression: &str, ctx: &ResolverContext) -> Option<Value> {
    let mut parts = expression.trim().split('.');
    let root = parts.next().filter(|r| !r.is_empty())?;

    let current: &Value = match root {
        "input" => &ctx.input,
        "steps" => match parts.next() {
            Some(name) => follow(|key| ctx.steps.get(key), name)?,
            None => return Some(Value::Object(ctx.steps.clone())),
        },
        "env" => return evaluate_env(parts, ctx),
        _ => return None,
    };

    walk(current, parts).cloned()
}

/// Follow a dotted path such as `body.items[0].id` into `value`.
///
/// Returns `None` when any segment is missing or the walk passes through
/// `null`. An empty path is the value itself.
pub fn follow_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value);
    }
    walk(value, path.split('.'))
}

fn walk<'a, 'p>(start: &'a Value, parts: impl IntoIterator<Item = &'p str>) -> Option<&'a Value> {
    parts.into_iter().try_fold(start, |current, part| {
        if current.is_null() {
            return None;
        }
        follow(move |key| lookup(current, key), part)
    })
}

/// Environment values are flat strings, so only `env` and `env.NAME` resolve.
fn evaluate_env<'a>(
    mut parts: impl Iterator<Item = &'a str>,
    ctx: &ResolverContext,
) -> Option<Value> {
    let Some(name) = parts.next() else {
        return Some(Value::Object(
            ctx.env
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ));
    };
    if parts.next().is_some() || INDEXED_SEGMENT.is_match(name) {
        return None;
    }
    ctx.env.get(name).map(|v| Value::String(v.clone()))
}

/// Apply one segment (`key` or `key[idx]`) through `get`.
fn follow<'a>(get: impl Fn(&str) -> Option<&'a Value>, part: &str) -> Option<&'a Value> {
    match INDEXED_SEGMENT.captures(part) {
        Some(caps) => {
            let idx: usize = caps[2].parse().ok()?;
            match get(&caps[1])? {
                Value::Array(items) => items.get(idx),
                _ => None,
            }
        }
        None => get(part),
    }
}

/// Member lookup; on arrays a numeric segment indexes.
fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// String form of a value substituted into a larger string.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
