use std::path::Path;

use anyhow::Context;
use serde_json::{Map, Value};

/// Reads `a.b.c` from a JSON object; any missing or non-object hop yields `None`.
pub fn get_dot_path<'a>(root: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let first = parts.next()?;
    let mut current = root.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Writes `a.b.c`, creating intermediate objects as needed.
///
/// A non-object intermediate is replaced by an object.
pub fn set_dot_path(root: &mut Map<String, Value>, field: &str, value: Value) {
    let parts: Vec<&str> = field.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = root;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Timeline `config.json` contents; unreadable or non-object files read as empty.
pub fn read_config_json(path: &Path) -> Map<String, Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

pub fn write_config_value(path: &Path, field: &str, value: Value) -> anyhow::Result<()> {
    let mut config = read_config_json(path);
    set_dot_path(&mut config, field, value);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(config))?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
