use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};

/// One hop of a field id: object key or array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A field id. Plain fields have one key; batch children are composite,
/// e.g. `["images", 2, "value"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn single(id: impl Into<String>) -> Self {
        Self(vec![PathSegment::Key(id.into())])
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }

    pub fn push_key(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.into()));
        Self(segments)
    }

    pub fn push_index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    /// Rewrites the index segment at `position`; used when batch items move.
    pub fn with_index_at(&self, position: usize, index: usize) -> Self {
        let mut segments = self.0.clone();
        if let Some(segment) = segments.get_mut(position) {
            *segment = PathSegment::Index(index);
        }
        Self(segments)
    }

    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The top-level field this path belongs to.
    pub fn root(&self) -> Option<&str> {
        match self.0.first()? {
            PathSegment::Key(key) => Some(key),
            PathSegment::Index(_) => None,
        }
    }

    pub fn last_key(&self) -> Option<&str> {
        match self.0.last()? {
            PathSegment::Key(key) => Some(key),
            PathSegment::Index(_) => None,
        }
    }

    pub fn with_last_key(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.pop();
        segments.push(PathSegment::Key(key.into()));
        Self(segments)
    }

    /// Key used in the `WORKFLOW_OPERATION` expose map.
    pub fn wire_key(&self) -> String {
        match self.0.as_slice() {
            [PathSegment::Key(key)] => key.clone(),
            _ => self.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self.0.as_slice() {
            [PathSegment::Key(key)] => Value::String(key.clone()),
            segments => Value::Array(
                segments
                    .iter()
                    .map(|segment| match segment {
                        PathSegment::Key(key) => Value::String(key.clone()),
                        PathSegment::Index(index) => Value::from(*index),
                    })
                    .collect(),
            ),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(key) => Some(Self::single(key.clone())),
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| match item {
                    Value::String(key) => Some(PathSegment::Key(key.clone())),
                    Value::Number(number) => number
                        .as_u64()
                        .and_then(|index| usize::try_from(index).ok())
                        .map(PathSegment::Index),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self),
            _ => None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|segment| match segment {
                PathSegment::Key(key) => key.clone(),
                PathSegment::Index(index) => index.to_string(),
            })
            .collect();
        write!(f, "{}", parts.join("."))
    }
}

/// `saved.json`: remembered field values keyed by context, workflow and field.
///
/// Every write re-reads the file and merges, so two handles on the same file
/// never drop each other's keys.
#[derive(Debug, Clone)]
pub struct SavedValueStore {
    path: PathBuf,
}

impl SavedValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, context: &str, workflow_id: &str, field: &FieldPath) -> Option<Value> {
        let payload = read_json_object(&self.path)?;
        let mut current = payload.get(context)?.get(workflow_id)?;
        for segment in field.segments() {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(obj)) => obj.get(key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    pub fn get_str(&self, context: &str, workflow_id: &str, key: &str) -> Option<String> {
        self.get(context, workflow_id, &FieldPath::single(key))
            .and_then(|value| value.as_str().map(str::to_string))
    }

    /// Writes one value. Returns `Ok(false)` when a composite path runs
    /// through a missing intermediate; such writes are dropped.
    pub fn set(
        &self,
        context: &str,
        workflow_id: &str,
        field: &FieldPath,
        value: Value,
    ) -> anyhow::Result<bool> {
        let mut payload = read_json_object(&self.path).unwrap_or_default();
        let Some(context_entry) = ensure_object(payload.entry(context.to_string())) else {
            return Ok(false);
        };
        let workflow_entry = context_entry
            .entry(workflow_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !workflow_entry.is_object() {
            *workflow_entry = Value::Object(Map::new());
        }

        let Some((last, parents)) = field.segments().split_last() else {
            return Ok(false);
        };
        let mut current: &mut Value = workflow_entry;
        for segment in parents {
            let next = match (segment, current) {
                (PathSegment::Key(key), Value::Object(obj)) => obj.get_mut(key),
                (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
                _ => None,
            };
            let Some(next) = next else {
                return Ok(false);
            };
            current = next;
        }

        match (last, current) {
            (PathSegment::Key(key), Value::Object(obj)) => {
                obj.insert(key.clone(), value);
            }
            (PathSegment::Index(index), Value::Array(items)) => {
                while items.len() <= *index {
                    items.push(Value::Null);
                }
                items[*index] = value;
            }
            _ => return Ok(false),
        }

        write_json_object(&self.path, &payload)?;
        Ok(true)
    }

    pub fn set_str(
        &self,
        context: &str,
        workflow_id: &str,
        key: &str,
        value: Option<&str>,
    ) -> anyhow::Result<()> {
        let value = value.map_or(Value::Null, |text| Value::String(text.to_string()));
        self.set(context, workflow_id, &FieldPath::single(key), value)?;
        Ok(())
    }

    /// Checks the file exists and holds a JSON object.
    pub fn validate(&self) -> Result<(), String> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|err| format!("{} is not readable: {err}", self.path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|err| format!("{} is not valid JSON: {err}", self.path.display()))?;
        if !parsed.is_object() {
            return Err(format!("{} is not a JSON object", self.path.display()));
        }
        Ok(())
    }
}

fn ensure_object(entry: serde_json::map::Entry<'_>) -> Option<&mut Map<String, Value>> {
    let value = entry.or_insert_with(|| Value::Object(Map::new()));
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )
    .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
