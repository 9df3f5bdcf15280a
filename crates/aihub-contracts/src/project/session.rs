use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;

use super::{Project, ProjectError};
use crate::catalogue::ProjectView;
use crate::store::SavedValueStore;

pub const SCRATCH_PREFIX: &str = "ai_hub_temp_project_";

/// The project currently open in a client, if any, plus the scratch folder
/// generated files fall back to when there is none.
#[derive(Debug)]
pub struct ProjectSession {
    project: Option<Project>,
    scratch: TempDir,
}

impl ProjectSession {
    pub fn new() -> anyhow::Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir()
            .context("create scratch project folder")?;
        Ok(Self {
            project: None,
            scratch,
        })
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    pub fn project_mut(&mut self) -> Result<&mut Project, ProjectError> {
        self.project.as_mut().ok_or(ProjectError::NoProject)
    }

    /// True when a project manifest backs this session.
    pub fn is_real(&self) -> bool {
        self.project.is_some()
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn create_empty(
        &mut self,
        project_type: &str,
        project_path: &Path,
        initial_timeline_name: &str,
        global_saved: &Path,
    ) -> Result<&Project, ProjectError> {
        let project = Project::create_empty(
            project_type,
            project_path,
            initial_timeline_name,
            global_saved,
        )?;
        Ok(self.project.insert(project))
    }

    /// Opens a project. On any structural failure the session is left with
    /// no project open.
    pub fn open(&mut self, manifest_path: &Path) -> Result<&Project, ProjectError> {
        match Project::open(manifest_path) {
            Ok(project) => {
                tracing::info!(path = %manifest_path.display(), "opened project");
                Ok(self.project.insert(project))
            }
            Err(err) => {
                tracing::warn!(path = %manifest_path.display(), "failed to open project: {err}");
                self.project = None;
                Err(err)
            }
        }
    }

    pub fn close(&mut self) -> Option<Project> {
        self.project.take()
    }

    /// Where server-pushed files land: the current timeline folder, or the
    /// scratch folder outside a project or with no current timeline.
    pub fn routing_dir(&self) -> PathBuf {
        self.project
            .as_ref()
            .and_then(Project::current_timeline_dir)
            .unwrap_or_else(|| self.scratch.path().to_path_buf())
    }

    /// The current timeline's `config.json`. Only real projects have one.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.project.as_ref()?.current_config_path()
    }

    /// The project's saved-value store when a project is open, else `global`.
    pub fn saved_store(&self, global: &SavedValueStore) -> SavedValueStore {
        self.project
            .as_ref()
            .map(Project::saved_store)
            .unwrap_or_else(|| global.clone())
    }

    pub fn view(&self) -> Option<ProjectView<'_>> {
        let project = self.project.as_ref()?;
        Some(ProjectView {
            project_type: Some(project.project_type()),
            current_timeline_initial: project
                .current_timeline()
                .is_some_and(|timeline| timeline.initial),
        })
    }
}
