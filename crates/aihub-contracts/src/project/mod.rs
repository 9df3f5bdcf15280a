//! Projects: a manifest plus a `<name>_files` folder holding one directory
//! per timeline and the project's own `saved.json`.

pub mod files;
pub mod manifest;
pub mod session;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use walkdir::WalkDir;

pub use files::{
    clear_batch, numbered_files, parse_index, select_indices, split_name, store_project_file,
};
pub use manifest::{ProjectManifest, Timeline};
pub use session::ProjectSession;

use crate::store::{SavedValueStore, CONFIG_FILE_NAME, SAVED_FILE_NAME};

pub const PROJECT_EXTENSION: &str = "aihubproj";
pub const TIMELINES_DIR: &str = "timelines";

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Project file {} does not exist.", .0.display())]
    MissingManifest(PathBuf),
    #[error("Project folder {} does not exist.", .0.display())]
    MissingFolder(PathBuf),
    #[error("Invalid project file format: current timeline folder {} does not exist.", .0.display())]
    MissingTimeline(PathBuf),
    #[error("Invalid saved.json file: {0}")]
    CorruptSaved(String),
    #[error("Invalid project file: {0}")]
    InvalidManifest(String),
    #[error("Timeline {0} does not exist in this project.")]
    UnknownTimeline(String),
    #[error("No project is currently opened.")]
    NoProject,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn new_timeline_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Copies the contents of `src` into `dst`, creating directories as needed.
fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// An open project and its timeline state machine.
#[derive(Debug, Clone)]
pub struct Project {
    manifest: ProjectManifest,
    files_dir: PathBuf,
}

impl Project {
    /// `<dir>/story.aihubproj` keeps its data in `<dir>/story_files`.
    pub fn files_dir_for(manifest_path: &Path) -> PathBuf {
        with_suffix(&manifest_path.with_extension(""), "_files")
    }

    /// Creates `<project_path>.aihubproj` with one initial root timeline.
    ///
    /// The new project's `saved.json` starts as a copy of `global_saved`, or
    /// `{}` when there is none.
    pub fn create_empty(
        project_type: &str,
        project_path: &Path,
        initial_timeline_name: &str,
        global_saved: &Path,
    ) -> Result<Self, ProjectError> {
        let manifest_path = with_suffix(project_path, &format!(".{PROJECT_EXTENSION}"));
        let files_dir = with_suffix(project_path, "_files");
        let project_name = project_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());

        let timeline_id = new_timeline_id();
        let mut manifest = ProjectManifest::new(manifest_path, &project_name, project_type);
        manifest.timelines.insert(
            timeline_id.clone(),
            Timeline {
                id: timeline_id.clone(),
                name: initial_timeline_name.to_string(),
                parent_id: None,
                initial: true,
            },
        );
        manifest.current_timeline = Some(timeline_id.clone());
        manifest.save()?;

        std::fs::create_dir_all(&files_dir)?;
        let saved = files_dir.join(SAVED_FILE_NAME);
        if !saved.is_file() {
            if global_saved.is_file() {
                std::fs::copy(global_saved, &saved)?;
            } else {
                std::fs::write(&saved, "{}")?;
            }
        }

        let project = Self {
            manifest,
            files_dir,
        };
        std::fs::create_dir_all(project.timeline_dir(&timeline_id))?;
        tracing::info!(
            project = %project_name,
            timeline_id = %timeline_id,
            "created empty project"
        );
        Ok(project)
    }

    pub fn open(manifest_path: &Path) -> Result<Self, ProjectError> {
        if !manifest_path.is_file() {
            return Err(ProjectError::MissingManifest(manifest_path.to_path_buf()));
        }
        let files_dir = Self::files_dir_for(manifest_path);
        if !files_dir.is_dir() {
            return Err(ProjectError::MissingFolder(files_dir));
        }
        let manifest = ProjectManifest::load(manifest_path)?;
        let project = Self {
            manifest,
            files_dir,
        };

        if let Some(dir) = project.current_timeline_dir() {
            if !dir.is_dir() {
                return Err(ProjectError::MissingTimeline(dir));
            }
        }
        project
            .saved_store()
            .validate()
            .map_err(ProjectError::CorruptSaved)?;
        Ok(project)
    }

    pub fn manifest(&self) -> &ProjectManifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest.path
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn name(&self) -> &str {
        &self.manifest.project_name
    }

    pub fn project_type(&self) -> &str {
        &self.manifest.project_type
    }

    pub fn current_timeline(&self) -> Option<&Timeline> {
        self.manifest.current()
    }

    pub fn timeline_dir(&self, id: &str) -> PathBuf {
        self.files_dir.join(TIMELINES_DIR).join(id)
    }

    pub fn current_timeline_dir(&self) -> Option<PathBuf> {
        self.current_timeline().map(|timeline| self.timeline_dir(&timeline.id))
    }

    pub fn current_config_path(&self) -> Option<PathBuf> {
        self.current_timeline_dir()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
    }

    pub fn saved_store(&self) -> SavedValueStore {
        SavedValueStore::new(self.files_dir.join(SAVED_FILE_NAME))
    }

    /// Forks the current timeline into a new one and makes it current.
    ///
    /// The whole directory of the current timeline is copied, so the new
    /// timeline is independent from its source from the first moment.
    pub fn branch_timeline(&mut self, name: &str, as_new_root: bool) -> Result<String, ProjectError> {
        let source = self.current_timeline().map(|timeline| timeline.id.clone());
        let new_id = new_timeline_id();
        let new_dir = self.timeline_dir(&new_id);
        std::fs::create_dir_all(&new_dir)?;

        if let Some(source_id) = source.as_deref() {
            let source_dir = self.timeline_dir(source_id);
            if source_dir.is_dir() {
                if let Err(err) = copy_tree(&source_dir, &new_dir) {
                    let _ = std::fs::remove_dir_all(&new_dir);
                    return Err(ProjectError::Other(
                        err.context("Failed to copy timeline data"),
                    ));
                }
            }
        }

        self.manifest.timelines.insert(
            new_id.clone(),
            Timeline {
                id: new_id.clone(),
                name: name.to_string(),
                parent_id: if as_new_root { None } else { source.clone() },
                initial: as_new_root,
            },
        );
        self.manifest.current_timeline = Some(new_id.clone());
        self.manifest.save()?;
        tracing::info!(
            timeline_id = %new_id,
            source = ?source,
            as_new_root,
            "branched timeline"
        );
        Ok(new_id)
    }

    pub fn switch_timeline(&mut self, id: &str) -> Result<(), ProjectError> {
        if !self.manifest.timelines.contains_key(id) {
            return Err(ProjectError::UnknownTimeline(id.to_string()));
        }
        self.manifest.current_timeline = Some(id.to_string());
        self.manifest.save()?;
        std::fs::create_dir_all(self.timeline_dir(id))?;
        Ok(())
    }

    /// Deletes `id`, either with its whole subtree or re-parenting its
    /// children onto its own parent. Returns the removed timeline ids.
    pub fn delete_timeline(&mut self, id: &str, keep_children: bool) -> Result<Vec<String>, ProjectError> {
        let Some(target) = self.manifest.timelines.get(id).cloned() else {
            return Err(ProjectError::UnknownTimeline(id.to_string()));
        };

        let removed = if keep_children {
            for timeline in self.manifest.timelines.values_mut() {
                if timeline.parent_id.as_deref() == Some(id) {
                    timeline.parent_id = target.parent_id.clone();
                    if timeline.parent_id.is_none() {
                        timeline.initial = true;
                    }
                }
            }
            vec![id.to_string()]
        } else {
            self.manifest.subtree(id)
        };

        for removed_id in &removed {
            self.manifest.timelines.shift_remove(removed_id);
            let dir = self.timeline_dir(removed_id);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
            }
        }

        let current_removed = self
            .manifest
            .current_timeline
            .as_ref()
            .is_some_and(|current| removed.contains(current));
        if current_removed {
            let parent = target
                .parent_id
                .filter(|parent| !keep_children && self.manifest.timelines.contains_key(parent));
            self.manifest.current_timeline = parent.or_else(|| self.first_initial());
        }
        let dangling = self
            .manifest
            .current_timeline
            .as_ref()
            .is_some_and(|current| !self.manifest.timelines.contains_key(current));
        if dangling {
            tracing::warn!("current timeline vanished after delete, falling back");
            self.manifest.current_timeline = self.first_initial();
        }

        self.manifest.save()?;
        tracing::info!(timeline_id = %id, keep_children, removed = removed.len(), "deleted timeline");
        Ok(removed)
    }

    fn first_initial(&self) -> Option<String> {
        self.manifest
            .timelines
            .values()
            .find(|timeline| timeline.initial)
            .map(|timeline| timeline.id.clone())
    }
}
