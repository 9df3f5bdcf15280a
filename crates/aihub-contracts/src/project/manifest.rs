use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ProjectError;

pub const MANIFEST_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub initial: bool,
}

/// The `.aihubproj` file: project identity plus the timeline forest.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectManifest {
    pub path: PathBuf,
    pub version: u64,
    pub project_name: String,
    pub project_type: String,
    pub current_timeline: Option<String>,
    pub timelines: IndexMap<String, Timeline>,
}

impl ProjectManifest {
    pub fn new(path: impl Into<PathBuf>, project_name: &str, project_type: &str) -> Self {
        Self {
            path: path.into(),
            version: MANIFEST_VERSION,
            project_name: project_name.to_string(),
            project_type: project_type.to_string(),
            current_timeline: None,
            timelines: IndexMap::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ProjectError> {
        let path = path.into();
        if !path.is_file() {
            return Err(ProjectError::MissingManifest(path));
        }
        let raw = std::fs::read_to_string(&path)?;
        let payload: Value = serde_json::from_str(&raw)
            .map_err(|err| ProjectError::InvalidManifest(err.to_string()))?;
        let Some(obj) = payload.as_object() else {
            return Err(ProjectError::InvalidManifest(
                "Invalid project file format.".to_string(),
            ));
        };

        let mut manifest = Self::new(
            path.clone(),
            obj.get("project_name").and_then(Value::as_str).unwrap_or("Unknown"),
            obj.get("project_type").and_then(Value::as_str).unwrap_or("Unknown"),
        );
        manifest.version = obj
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(MANIFEST_VERSION);
        manifest.current_timeline = obj
            .get("current_timeline")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        if let Some(timelines) = obj.get("timelines").and_then(Value::as_object) {
            for (key, item) in timelines {
                match serde_json::from_value::<Timeline>(item.clone()) {
                    Ok(timeline) => {
                        manifest.timelines.insert(key.clone(), timeline);
                    }
                    Err(err) => {
                        tracing::warn!(timeline_id = %key, "ignoring unreadable timeline record: {err}");
                    }
                }
            }
        }
        Ok(manifest)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert("version".to_string(), Value::from(self.version));
        payload.insert(
            "timelines".to_string(),
            serde_json::to_value(&self.timelines)?,
        );
        payload.insert(
            "current_timeline".to_string(),
            self.current_timeline
                .clone()
                .map_or(Value::Null, Value::String),
        );
        payload.insert(
            "project_type".to_string(),
            Value::String(self.project_type.clone()),
        );
        payload.insert(
            "project_name".to_string(),
            Value::String(self.project_name.clone()),
        );
        write_json(&self.path, Value::Object(payload))
    }

    pub fn current(&self) -> Option<&Timeline> {
        self.timelines.get(self.current_timeline.as_deref()?)
    }

    pub fn roots(&self) -> Vec<&Timeline> {
        self.timelines
            .values()
            .filter(|timeline| timeline.parent_id.is_none())
            .collect()
    }

    pub fn children_of(&self, id: &str) -> Vec<&Timeline> {
        self.timelines
            .values()
            .filter(|timeline| timeline.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// Timelines whose parent is missing from the map. They stay as they
    /// are; nothing re-parents them.
    pub fn skipped(&self) -> Vec<&Timeline> {
        self.timelines
            .values()
            .filter(|timeline| {
                timeline
                    .parent_id
                    .as_deref()
                    .is_some_and(|parent| !self.timelines.contains_key(parent))
            })
            .collect()
    }

    /// Path from the root down to `id`, inclusive. Stops at a dangling
    /// parent or a cycle.
    pub fn ancestry(&self, id: &str) -> Vec<&Timeline> {
        let mut chain = Vec::new();
        let mut cursor = self.timelines.get(id);
        while let Some(timeline) = cursor {
            if chain.iter().any(|seen: &&Timeline| seen.id == timeline.id) {
                break;
            }
            chain.push(timeline);
            cursor = timeline
                .parent_id
                .as_deref()
                .and_then(|parent| self.timelines.get(parent));
        }
        chain.reverse();
        chain
    }

    /// `id` and every timeline below it, parents before children.
    pub fn subtree(&self, id: &str) -> Vec<String> {
        let mut collected = Vec::new();
        if !self.timelines.contains_key(id) {
            return collected;
        }
        let mut queue = vec![id.to_string()];
        while let Some(next) = queue.pop() {
            if collected.contains(&next) {
                continue;
            }
            for child in self.children_of(&next) {
                queue.push(child.id.clone());
            }
            collected.push(next);
        }
        collected
    }
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ProjectManifest, Timeline};
    use crate::project::ProjectError;

    fn timeline(id: &str, parent: Option<&str>, initial: bool) -> Timeline {
        Timeline {
            id: id.to_string(),
            name: id.to_uppercase(),
            parent_id: parent.map(str::to_string),
            initial,
        }
    }

    fn forest() -> ProjectManifest {
        let mut manifest = ProjectManifest::new("p.aihubproj", "p", "comic");
        for item in [
            timeline("root", None, true),
            timeline("a", Some("root"), false),
            timeline("b", Some("a"), false),
            timeline("c", Some("root"), false),
            timeline("orphan", Some("gone"), false),
        ] {
            manifest.timelines.insert(item.id.clone(), item);
        }
        manifest.current_timeline = Some("b".to_string());
        manifest
    }

    #[test]
    fn manifest_roundtrips_through_disk() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut manifest = forest();
        manifest.path = tmp.path().join("p.aihubproj");
        manifest.save()?;

        let loaded = ProjectManifest::load(&manifest.path)?;
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.timelines.keys().next().map(String::as_str), Some("root"));
        Ok(())
    }

    #[test]
    fn forest_queries() {
        let manifest = forest();
        let roots: Vec<&str> = manifest.roots().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(roots, vec!["root"]);
        let children: Vec<&str> = manifest.children_of("root").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(children, vec!["a", "c"]);
        let ancestry: Vec<&str> = manifest.ancestry("b").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ancestry, vec!["root", "a", "b"]);
        let skipped: Vec<&str> = manifest.skipped().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(skipped, vec!["orphan"]);
        assert_eq!(manifest.current().map(|t| t.id.as_str()), Some("b"));

        let mut subtree = manifest.subtree("a");
        subtree.sort();
        assert_eq!(subtree, vec!["a", "b"]);
        assert!(manifest.subtree("gone").is_empty());
    }

    #[test]
    fn load_reports_missing_and_invalid_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("x.aihubproj");
        assert!(matches!(
            ProjectManifest::load(&path),
            Err(ProjectError::MissingManifest(_))
        ));
        std::fs::write(&path, "[]")?;
        assert!(matches!(
            ProjectManifest::load(&path),
            Err(ProjectError::InvalidManifest(_))
        ));
        Ok(())
    }
}
