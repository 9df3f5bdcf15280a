//! The workflow session as the plugin window sees it.
//!
//! [`Controller`] owns the catalogue, the context/category/workflow
//! selection, the [`ExposeTree`] of the selected workflow, the outstanding
//! run and the open project. Everything here runs on the UI thread: the
//! receive loop and upload workers only reach it through [`UiEvent`]s that
//! [`Controller::pump`] applies in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aihub_contracts::catalogue::{
    pick_context, pick_default, workflow_options, WorkflowCatalogue, WorkflowOption,
};
use aihub_contracts::events::{EventWriter, SessionEvent};
use aihub_contracts::project::{clear_batch, store_project_file, ProjectError, ProjectSession};
use aihub_contracts::protocol::{
    display_number, run_id_label, ClientMessage, FileAction, FilePlacement, PlacementKind,
    ServerMessage,
};
use aihub_contracts::store::{
    memory, read_config_json, write_config_value, FieldPath, HubConfig, SavedValueStore,
    SAVED_FILE_NAME,
};
use anyhow::Result;
use image::RgbaImage;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::debounce::DEFAULT_DEBOUNCE;
use crate::dispatch::{ui_channel, Dispatcher, UiEvent, UiQueue};
use crate::exposes::tree::Blocker;
use crate::exposes::{ExposeTree, FieldEnv};
use crate::host::ImageHost;
use crate::preview::fetch_workflow_preview;
use crate::relegator::Relegator;
use crate::router::Router;
use crate::thumbnails::ThumbnailCache;
use crate::transport::{FrameSink, WsTransport};
use crate::upload::{PendingUpload, UploadError, UploadOutcome, Uploader, UPLOAD_TIMEOUT};

pub const EVENTS_FILE_NAME: &str = "events.jsonl";
pub const ALTERNATIVE_TIMELINE_NAME: &str = "Alternative timeline";

/// Status lines shown under the form.
pub mod status {
    use aihub_contracts::store::HubConfig;

    pub const CONNECTING: &str = "Status: Connecting to server...";
    pub const CONNECTED: &str = "Status: Connected to server, waiting for workflows information";
    pub const READY: &str = "Status: Ready";
    pub const RUNNING: &str = "Status: Running workflow...";
    pub const FINISHED: &str = "Status: Workflow finished successfully; ready for another run.";
    pub const NO_WORKFLOWS: &str = "Status: No valid workflows or categories found.";
    pub const INVALID_MESSAGE: &str = "Status: Received invalid message from server.";
    pub const DISCONNECTED: &str = "Error: Disconnected from server";
    pub const CLOSED_PROJECT: &str = "Status: Closed project";

    pub fn upload_failed(err: impl std::fmt::Display) -> String {
        format!("Error: Failed to upload binary data: {err}")
    }

    /// Running line once the inputs are on the server; reused content is
    /// counted apart from fresh uploads.
    pub fn running_after_uploads(uploaded: usize, skipped: usize) -> String {
        format!("{RUNNING} ({uploaded} uploaded, {skipped} already on server)")
    }

    pub fn could_not_connect(config: &HubConfig) -> String {
        format!("Error: Could not connect to server {}", config.server_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    AwaitingCatalogue,
    Ready,
    Running,
    /// Terminal: the client must be reopened.
    Errored,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("the session has errored; reopen the client")]
    Errored,
    #[error("the workflow catalogue has not been received yet")]
    NotReady,
    #[error("a workflow is already running")]
    Busy,
    #[error("no workflow is selected")]
    NoWorkflow,
    #[error("{0} is not offered")]
    UnknownSelection(String),
    #[error("workflow {0} starts a new project; a project path is required")]
    NeedsProjectPath(String),
    #[error("{message}")]
    Blocked { label: String, message: String },
    #[error("Failed to upload binary data: {0}")]
    Upload(String),
    #[error("{0}")]
    Field(String),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The ends of one server connection.
pub struct Connection {
    sink: Arc<dyn FrameSink>,
    relegator: Arc<Relegator>,
    dispatcher: Dispatcher,
    queue: UiQueue,
    transport: Option<WsTransport>,
}

impl Connection {
    pub fn from_parts(
        sink: Arc<dyn FrameSink>,
        relegator: Arc<Relegator>,
        dispatcher: Dispatcher,
        queue: UiQueue,
    ) -> Self {
        Self {
            sink,
            relegator,
            dispatcher,
            queue,
            transport: None,
        }
    }

    /// A connection whose frames are fed in by the caller through
    /// [`Connection::router`].
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        let (dispatcher, queue) = ui_channel();
        Self::from_parts(sink, Arc::new(Relegator::new()), dispatcher, queue)
    }

    /// Connects the websocket and starts its receive loop.
    pub fn websocket(config: &HubConfig) -> Result<Self> {
        let transport = WsTransport::connect(config)?;
        let mut connection = Self::new(Arc::new(transport.clone()));
        transport.spawn_receive_loop(Arc::new(connection.router()));
        connection.transport = Some(transport);
        Ok(connection)
    }

    pub fn router(&self) -> Router {
        Router::new(Arc::clone(&self.relegator), self.dispatcher.clone())
    }

    pub fn close(&self) {
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub base_dir: PathBuf,
    pub config: HubConfig,
    pub events_path: PathBuf,
    /// Quiet period before an edited field is written to `saved.json`.
    pub write_delay: Duration,
    pub upload_timeout: Duration,
    pub half_size: bool,
    pub half_size_coords: bool,
}

impl ControllerOptions {
    pub fn new(base_dir: impl Into<PathBuf>, config: HubConfig) -> Self {
        let base_dir = base_dir.into();
        Self {
            events_path: base_dir.join(EVENTS_FILE_NAME),
            base_dir,
            config,
            write_delay: DEFAULT_DEBOUNCE,
            upload_timeout: UPLOAD_TIMEOUT,
            half_size: false,
            half_size_coords: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Uploading,
    Submitted,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    token: u64,
    workflow_id: String,
    phase: RunPhase,
    run_id: Option<Value>,
    created_project: bool,
}

/// Owned inputs of a [`FieldEnv`].
struct EnvData {
    routing_dir: PathBuf,
    config: Map<String, Value>,
    project_real: bool,
    half_size: bool,
    half_size_coords: bool,
}

impl EnvData {
    fn env(&self) -> FieldEnv<'_> {
        FieldEnv {
            routing_dir: &self.routing_dir,
            config: &self.config,
            project_real: self.project_real,
            half_size: self.half_size,
            half_size_coords: self.half_size_coords,
        }
    }
}

fn blocker_message(blocker: &Blocker) -> String {
    match blocker {
        Blocker::Invalid { label } => {
            format!("Please check the value for \"{label}\" and try again.")
        }
        Blocker::Condition { message, .. } => message.clone(),
    }
}

pub struct Controller<H: ImageHost> {
    options: ControllerOptions,
    connection: Connection,
    host: H,
    state: SessionState,
    status: String,
    events: EventWriter,
    global_saved: SavedValueStore,
    session: ProjectSession,
    catalogue: Option<WorkflowCatalogue>,
    context: Option<String>,
    category: Option<String>,
    tree: Option<ExposeTree>,
    run: Option<ActiveRun>,
    next_token: u64,
    thumbnails: ThumbnailCache,
}

impl<H: ImageHost> Controller<H> {
    pub fn new(options: ControllerOptions, connection: Connection, host: H) -> Result<Self> {
        std::fs::create_dir_all(&options.base_dir)?;
        let events = EventWriter::new(&options.events_path, Uuid::new_v4().simple().to_string());
        let global_saved = SavedValueStore::new(options.base_dir.join(SAVED_FILE_NAME));
        let mut controller = Self {
            options,
            connection,
            host,
            state: SessionState::Disconnected,
            status: String::new(),
            events,
            global_saved,
            session: ProjectSession::new()?,
            catalogue: None,
            context: None,
            category: None,
            tree: None,
            run: None,
            next_token: 0,
            thumbnails: ThumbnailCache::default(),
        };
        controller.set_status(status::CONNECTING);
        Ok(controller)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Server-assigned id of the outstanding run, once known.
    pub fn run_id(&self) -> Option<&Value> {
        self.run.as_ref()?.run_id.as_ref()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn session(&self) -> &ProjectSession {
        &self.session
    }

    pub fn catalogue(&self) -> Option<&WorkflowCatalogue> {
        self.catalogue.as_ref()
    }

    pub fn tree(&self) -> Option<&ExposeTree> {
        self.tree.as_ref()
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn config(&self) -> &HubConfig {
        &self.options.config
    }

    fn emit(&self, event: SessionEvent, payload: Value) {
        self.events.emit_quiet(event, payload);
    }

    fn set_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(status = %text, "status");
        self.emit(SessionEvent::Status, json!({ "message": text }));
        self.status = text;
    }

    /// Fail-stop: nothing but reading state works after this.
    fn fail(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.run = None;
        self.state = SessionState::Errored;
        self.emit(SessionEvent::Errored, json!({ "message": text }));
        self.set_status(text);
    }

    /// Ends the outstanding run, if any, with `text` as the status.
    fn end_run_with(&mut self, text: impl Into<String>) {
        if self.run.take().is_some() {
            self.state = SessionState::Ready;
        }
        self.set_status(text);
    }

    fn ensure_not_busy(&self) -> Result<(), ControllerError> {
        match self.state {
            SessionState::Errored => Err(ControllerError::Errored),
            SessionState::Running => Err(ControllerError::Busy),
            _ => Ok(()),
        }
    }

    fn ensure_ready(&self) -> Result<(), ControllerError> {
        self.ensure_not_busy()?;
        if self.state != SessionState::Ready {
            return Err(ControllerError::NotReady);
        }
        Ok(())
    }

    fn env_data(&self) -> EnvData {
        EnvData {
            routing_dir: self.session.routing_dir(),
            config: self
                .session
                .config_path()
                .map(|path| read_config_json(&path))
                .unwrap_or_default(),
            project_real: self.session.is_real(),
            half_size: self.options.half_size,
            half_size_coords: self.options.half_size_coords,
        }
    }

    fn flush_tree(&mut self) {
        if let Some(tree) = self.tree.as_mut() {
            if let Err(err) = tree.flush_writes() {
                tracing::warn!(workflow_id = %tree.workflow_id(), "failed to save field values: {err:#}");
            }
        }
    }

    /// Applies everything background threads posted so far, then writes
    /// saved values whose quiet period has passed. Returns the number of
    /// events applied.
    pub fn pump(&mut self, now: Instant) -> Result<usize> {
        let events = self.connection.queue.drain();
        let count = events.len();
        for event in events {
            self.handle_event(event);
        }
        if let Some(tree) = self.tree.as_mut() {
            tree.poll_writes(now)?;
        }
        Ok(count)
    }

    /// Like [`Controller::pump`], but first waits up to `timeout` for an event.
    pub fn wait_and_pump(&mut self, timeout: Duration) -> Result<usize> {
        let mut handled = 0;
        if let Some(event) = self.connection.queue.next_timeout(timeout) {
            self.handle_event(event);
            handled += 1;
        }
        Ok(handled + self.pump(Instant::now())?)
    }

    fn handle_event(&mut self, event: UiEvent) {
        if self.state == SessionState::Errored {
            tracing::debug!(?event, "session errored, ignoring event");
            return;
        }
        match event {
            UiEvent::Connected => {
                self.state = SessionState::AwaitingCatalogue;
                self.set_status(status::CONNECTED);
            }
            UiEvent::Message(message) => self.handle_message(message),
            UiEvent::UnknownMessage(kind) => {
                self.end_run_with(format!("Status: Unknown message type received: {kind}"));
            }
            UiEvent::ProjectFile { placement, bytes } => {
                self.handle_project_file(&placement, &bytes);
            }
            UiEvent::Malformed(detail) => {
                tracing::warn!(detail = %detail, "closing session on malformed frame");
                self.fail(status::INVALID_MESSAGE);
            }
            UiEvent::Closed { reason } => {
                tracing::warn!(reason = ?reason, "connection closed");
                self.fail(status::DISCONNECTED);
            }
            UiEvent::UploadsFinished {
                token,
                uploaded,
                failure,
            } => self.finish_uploads(token, uploaded, failure),
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::InfoList(info) => match WorkflowCatalogue::from_info_list(info) {
                Ok(catalogue) => {
                    self.emit(
                        SessionEvent::CatalogueReceived,
                        json!({
                            "workflows": catalogue.workflows.len(),
                            "rejected": catalogue.rejected.len(),
                            "contexts": catalogue.contexts,
                            "models": catalogue.models.len(),
                            "loras": catalogue.loras.len(),
                        }),
                    );
                    self.catalogue = Some(catalogue);
                    // a run in flight keeps its tree until it finishes
                    if self.run.is_none() {
                        self.state = SessionState::Ready;
                        self.set_status(status::READY);
                        self.reselect();
                    }
                }
                Err(err) => {
                    tracing::warn!("rejecting catalogue: {err}");
                    self.fail(status::NO_WORKFLOWS);
                }
            },
            ServerMessage::Error { message } => {
                let message = message.unwrap_or_else(|| "Unknown error".to_string());
                self.end_run_with(format!("Status: Error received from server \"{message}\""));
            }
            ServerMessage::Status { message } => {
                let message = message.unwrap_or_else(|| "Unknown status".to_string());
                self.set_status(format!("Status: {message}"));
            }
            ServerMessage::WorkflowAwait {
                id,
                workflow_id,
                before_this,
            } => {
                let workflow_id = workflow_id.unwrap_or_else(|| "unknown".to_string());
                self.record_run_id(id, &workflow_id);
                self.set_status(format!(
                    "Status: Waiting for workflow {workflow_id} to start, there are {} users before you.",
                    display_number(before_this.as_ref(), 0)
                ));
            }
            ServerMessage::WorkflowStart { id, workflow_id } => {
                let workflow_id = workflow_id.unwrap_or_else(|| "unknown".to_string());
                self.record_run_id(id, &workflow_id);
                self.set_status(format!("Status: Workflow {workflow_id} has started."));
            }
            ServerMessage::WorkflowStatus {
                node_name,
                progress,
                total,
            } => {
                if self.run.is_some() {
                    self.set_status(format!(
                        "Status: Running {} ({}/{})",
                        node_name.as_deref().unwrap_or("unknown"),
                        display_number(progress.as_ref(), 0),
                        display_number(total.as_ref(), 1)
                    ));
                }
            }
            ServerMessage::WorkflowFinished {
                error,
                error_message,
            } => self.finish_run(error, error_message),
            ServerMessage::PrepareBatch {
                file_name,
                file_action,
            } => {
                if file_action == Some(FileAction::Replace) {
                    let file_name = file_name.unwrap_or_else(|| "new batch".to_string());
                    match clear_batch(&self.session.routing_dir(), &file_name) {
                        Ok(removed) => tracing::debug!(file_name = %file_name, removed, "cleared batch"),
                        Err(err) => tracing::warn!(file_name = %file_name, "failed to clear batch: {err:#}"),
                    }
                }
            }
            ServerMessage::SetConfigValue { field, value } => {
                // only real projects have a timeline config
                if let (Some(field), Some(path)) = (field, self.session.config_path()) {
                    if let Err(err) = write_config_value(&path, &field, value) {
                        tracing::warn!(field = %field, "failed to write timeline config: {err:#}");
                    }
                }
            }
            ServerMessage::File(descriptor) => {
                tracing::warn!(?descriptor, "file descriptor reached the ui without its payload");
            }
            other @ (ServerMessage::UploadAck
            | ServerMessage::FileUploadSuccess { .. }
            | ServerMessage::FileUploadSkip { .. }) => {
                tracing::debug!(kind = other.kind(), "upload reply outside of an upload");
            }
        }
    }

    fn record_run_id(&mut self, id: Option<Value>, workflow_id: &str) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let first = run.run_id.is_none();
        run.run_id = id;
        if first {
            if let Some(run_id) = run.run_id.as_ref().map(run_id_label) {
                tracing::info!(run_id = %run_id, workflow_id, "run accepted");
                self.emit(SessionEvent::RunAccepted, json!({ "run_id": run_id, "workflow_id": workflow_id }));
            }
        }
    }

    fn finish_run(&mut self, error: bool, error_message: Option<String>) {
        let Some(run) = self.run.take() else {
            tracing::debug!("WORKFLOW_FINISHED without an outstanding run");
            return;
        };
        self.state = SessionState::Ready;
        self.emit(
            SessionEvent::RunFinished,
            json!({
                "workflow_id": run.workflow_id,
                "run_id": run.run_id.as_ref().map(run_id_label),
                "error": error,
                "error_message": error_message,
            }),
        );
        if error {
            let message = error_message.unwrap_or_else(|| "No message provided".to_string());
            self.set_status(format!("Status: Workflow finished with error: {message}"));
        } else {
            self.set_status(status::FINISHED);
        }

        if run.created_project {
            // eligible workflows differ now that a project is open
            self.thumbnails.invalidate();
            self.refresh_options();
        }
        if let Some(tree) = self.tree.as_mut() {
            tree.refresh_from_host(&self.host);
        }
    }

    fn handle_project_file(&mut self, placement: &FilePlacement, bytes: &[u8]) {
        let routing_dir = self.session.routing_dir();
        let stored = store_project_file(
            &routing_dir,
            placement.file_name(),
            placement.file_action(),
            bytes,
            placement.separator(),
        );
        let path = match stored {
            Ok(path) => path,
            Err(err) => {
                self.end_run_with(format!("Error: Failed to write received file from server {err:#}"));
                return;
            }
        };
        self.emit(
            SessionEvent::ProjectFileStored,
            json!({
                "path": path.to_string_lossy(),
                "bytes": bytes.len(),
                "project": self.session.is_real(),
            }),
        );
        if let Err(err) = self.materialize(placement, &path) {
            self.end_run_with(format!("Error: Failed to process received file from server {err:#}"));
        }
    }

    fn materialize(&mut self, placement: &FilePlacement, path: &Path) -> Result<()> {
        match placement.action {
            Some(PlacementKind::NewLayer) if self.host.current_image().is_some() => {
                self.host.insert_layer(path, placement)
            }
            Some(PlacementKind::NewImage | PlacementKind::NewLayer) => {
                if self.session.is_real() {
                    tracing::debug!(path = %path.display(), "kept in project, not opening");
                    Ok(())
                } else {
                    self.host.open_as_image(path)
                }
            }
            _ => Ok(()),
        }
    }

    // selection

    pub fn contexts(&self) -> &[String] {
        self.catalogue
            .as_ref()
            .map(|catalogue| catalogue.contexts.as_slice())
            .unwrap_or_default()
    }

    pub fn categories(&self) -> &[String] {
        match (&self.catalogue, &self.context) {
            (Some(catalogue), Some(context)) => catalogue.categories_for(context),
            _ => &[],
        }
    }

    pub fn workflow_options(&self) -> Vec<WorkflowOption> {
        match (&self.catalogue, &self.context, &self.category) {
            (Some(catalogue), Some(context), Some(category)) => {
                workflow_options(catalogue, context, category, self.session.view())
            }
            _ => Vec::new(),
        }
    }

    pub fn selected_context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn selected_category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn selected_workflow(&self) -> Option<&str> {
        self.tree.as_ref().map(ExposeTree::workflow_id)
    }

    pub fn select_context(&mut self, context: &str) -> Result<(), ControllerError> {
        self.ensure_ready()?;
        if !self.contexts().iter().any(|item| item == context) {
            return Err(ControllerError::UnknownSelection(context.to_string()));
        }
        self.global_saved
            .set_str("", "", memory::DEFAULT_CONTEXT, Some(context))?;
        self.apply_context(Some(context.to_string()));
        Ok(())
    }

    pub fn select_category(&mut self, category: &str) -> Result<(), ControllerError> {
        self.ensure_ready()?;
        if !self.categories().iter().any(|item| item == category) {
            return Err(ControllerError::UnknownSelection(category.to_string()));
        }
        if let Some(context) = self.context.clone() {
            self.global_saved
                .set_str("", &context, memory::DEFAULT_CATEGORY, Some(category))?;
        }
        self.apply_category(Some(category.to_string()));
        Ok(())
    }

    pub fn select_workflow(&mut self, workflow_id: &str) -> Result<(), ControllerError> {
        self.ensure_ready()?;
        if !self
            .workflow_options()
            .iter()
            .any(|option| option.id == workflow_id)
        {
            return Err(ControllerError::UnknownSelection(workflow_id.to_string()));
        }
        if let Some(key) = self.workflow_memory_key() {
            self.global_saved
                .set_str("", &key, memory::DEFAULT_WORKFLOW, Some(workflow_id))?;
        }
        self.apply_workflow(Some(workflow_id.to_string()));
        Ok(())
    }

    fn workflow_memory_key(&self) -> Option<String> {
        Some(format!("{}/{}", self.context.as_deref()?, self.category.as_deref()?))
    }

    /// Selects the remembered (or first) context, category and workflow.
    fn reselect(&mut self) {
        let remembered = self.global_saved.get_str("", "", memory::DEFAULT_CONTEXT);
        let context = pick_context(self.contexts(), remembered.as_deref()).map(str::to_string);
        self.apply_context(context);
    }

    /// Re-derives the workflow list of the current category, e.g. after
    /// the open project changed.
    fn refresh_options(&mut self) {
        let category = self.category.clone();
        self.apply_category(category);
    }

    fn apply_context(&mut self, context: Option<String>) {
        self.context = context;
        let category = self.context.as_deref().and_then(|context| {
            let remembered = self.global_saved.get_str("", context, memory::DEFAULT_CATEGORY);
            pick_default(self.categories(), remembered.as_deref()).map(str::to_string)
        });
        self.apply_category(category);
    }

    fn apply_category(&mut self, category: Option<String>) {
        self.category = category;
        let ids: Vec<String> = self
            .workflow_options()
            .into_iter()
            .map(|option| option.id)
            .collect();
        let remembered = self
            .workflow_memory_key()
            .and_then(|key| self.global_saved.get_str("", &key, memory::DEFAULT_WORKFLOW));
        let workflow = pick_default(&ids, remembered.as_deref()).map(str::to_string);
        self.apply_workflow(workflow);
    }

    /// Replaces the expose tree. The old tree, and every relation between
    /// its fields, goes away in one drop after its pending writes land.
    fn apply_workflow(&mut self, workflow_id: Option<String>) {
        self.flush_tree();
        self.tree = None;
        let (Some(catalogue), Some(workflow_id)) = (self.catalogue.as_ref(), workflow_id) else {
            return;
        };
        let store = self.session.saved_store(&self.global_saved);
        match ExposeTree::build(catalogue, &workflow_id, store, self.options.write_delay) {
            Some(mut tree) => {
                tree.after_ui_built(&self.host);
                self.emit(
                    SessionEvent::WorkflowSelected,
                    json!({
                        "workflow_id": workflow_id,
                        "context": tree.context(),
                        "fields": tree.fields().count(),
                    }),
                );
                self.tree = Some(tree);
            }
            None => tracing::warn!(workflow_id = %workflow_id, "selected workflow is not in the catalogue"),
        }
    }

    // editing

    fn tree_mut(&mut self) -> Result<&mut ExposeTree, ControllerError> {
        self.ensure_not_busy()?;
        self.tree.as_mut().ok_or(ControllerError::NoWorkflow)
    }

    pub fn set_value(&mut self, field: &FieldPath, value: Value, now: Instant) -> Result<(), ControllerError> {
        self.tree_mut()?
            .set_value(field, value, now)
            .map_err(ControllerError::Field)
    }

    pub fn insert_batch_item(
        &mut self,
        batch_id: &str,
        index: usize,
        file: PathBuf,
        now: Instant,
    ) -> Result<(), ControllerError> {
        self.tree_mut()?
            .insert_batch_item(batch_id, index, file, now)
            .map_err(ControllerError::Field)
    }

    pub fn remove_batch_item(&mut self, batch_id: &str, index: usize, now: Instant) -> Result<(), ControllerError> {
        self.tree_mut()?
            .remove_batch_item(batch_id, index, now)
            .map_err(ControllerError::Field)
    }

    pub fn move_batch_item(
        &mut self,
        batch_id: &str,
        from: usize,
        to: usize,
        now: Instant,
    ) -> Result<(), ControllerError> {
        self.tree_mut()?
            .move_batch_item(batch_id, from, to, now)
            .map_err(ControllerError::Field)
    }

    /// Re-reads the open image after the user changed it in the editor.
    pub fn refresh_from_host(&mut self) {
        if let Some(tree) = self.tree.as_mut() {
            tree.refresh_from_host(&self.host);
        }
    }

    /// What would stop a run right now, for the run button.
    pub fn blocker(&self) -> Option<Blocker> {
        let env_data = self.env_data();
        self.tree.as_ref()?.first_blocker(&env_data.env())
    }

    /// The `expose` map a run would send, before uploads.
    pub fn values(&self) -> Option<Map<String, Value>> {
        let env_data = self.env_data();
        Some(self.tree.as_ref()?.values(&env_data.env()))
    }

    // runs

    /// Starts the selected workflow.
    ///
    /// `new_project_path` is where a project-init workflow creates its
    /// project when none is open; other cases ignore it. Uploads run on a
    /// worker thread and the `WORKFLOW_OPERATION` goes out from
    /// [`Controller::pump`] once they finish.
    pub fn run_workflow(&mut self, new_project_path: Option<&Path>) -> Result<(), ControllerError> {
        self.ensure_ready()?;
        let workflow_id = self
            .tree
            .as_ref()
            .map(|tree| tree.workflow_id().to_string())
            .ok_or(ControllerError::NoWorkflow)?;
        let (label, project_type, is_init) = {
            let workflow = self
                .catalogue
                .as_ref()
                .and_then(|catalogue| catalogue.workflow(&workflow_id))
                .ok_or(ControllerError::NoWorkflow)?;
            (
                workflow.label.clone(),
                workflow.project_type.clone(),
                workflow.project_type_init,
            )
        };

        // a new project copies the global saved values, so they must be current
        self.flush_tree();
        let created_project = match self.project_step(&label, project_type.as_deref(), is_init, new_project_path) {
            Ok(created) => created,
            Err(err) => {
                if !matches!(err, ControllerError::NeedsProjectPath(_)) {
                    self.set_status(format!("Error: {err}"));
                }
                return Err(err);
            }
        };

        let env_data = self.env_data();
        let env = env_data.env();
        let blocker = self
            .tree
            .as_ref()
            .and_then(|tree| tree.first_blocker(&env));
        if let Some(blocker) = blocker {
            let message = blocker_message(&blocker);
            tracing::info!(workflow_id = %workflow_id, field = %blocker.label(), "run blocked");
            self.set_status(format!("Error: Some input fields are invalid. {message}"));
            return Err(ControllerError::Blocked {
                label: blocker.label().to_string(),
                message,
            });
        }

        let tree = self.tree.as_mut().ok_or(ControllerError::NoWorkflow)?;
        let uploads = match tree.upload_all(&mut self.host, &env) {
            Ok(uploads) => uploads,
            Err(err) => {
                tracing::warn!(workflow_id = %workflow_id, "could not prepare uploads: {err}");
                self.set_status(status::upload_failed(&err));
                return Err(ControllerError::Upload(err));
            }
        };

        self.next_token += 1;
        let token = self.next_token;
        self.run = Some(ActiveRun {
            token,
            workflow_id: workflow_id.clone(),
            phase: RunPhase::Uploading,
            run_id: None,
            created_project,
        });
        self.state = SessionState::Running;
        self.set_status(status::RUNNING);

        if uploads.is_empty() {
            return self.submit(token);
        }
        self.spawn_uploads(token, workflow_id, uploads);
        Ok(())
    }

    /// Creates or branches the project the run writes into. Returns true
    /// when a new project was created.
    fn project_step(
        &mut self,
        label: &str,
        project_type: Option<&str>,
        is_init: bool,
        new_project_path: Option<&Path>,
    ) -> Result<bool, ControllerError> {
        let created = if is_init && !self.session.is_real() {
            let path = new_project_path.ok_or_else(|| ControllerError::NeedsProjectPath(label.to_string()))?;
            let project_path = path.with_extension("");
            let global_saved = self.global_saved.path().to_path_buf();
            let manifest = self
                .session
                .create_empty(project_type.unwrap_or("Unknown"), &project_path, label, &global_saved)?
                .manifest_path()
                .to_path_buf();
            self.remember_project(&manifest)?;
            true
        } else if is_init {
            self.session
                .project_mut()?
                .branch_timeline(ALTERNATIVE_TIMELINE_NAME, true)?;
            false
        } else if self.session.is_real() {
            self.session.project_mut()?.branch_timeline(label, false)?;
            false
        } else {
            return Ok(false);
        };
        self.thumbnails.invalidate();
        Ok(created)
    }

    fn spawn_uploads(&self, token: u64, workflow_id: String, uploads: Vec<PendingUpload>) {
        let sink = Arc::clone(&self.connection.sink);
        let relegator = Arc::clone(&self.connection.relegator);
        let dispatcher = self.connection.dispatcher.clone();
        let timeout = self.options.upload_timeout;
        thread::spawn(move || {
            let uploader = Uploader::new(sink.as_ref(), &relegator).with_timeout(timeout);
            let mut uploaded = Vec::new();
            let mut failure = None;
            for upload in &uploads {
                match uploader.upload_one(upload, &workflow_id) {
                    Ok(outcome) => uploaded.push((upload.field.clone(), outcome)),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            dispatcher.post(UiEvent::UploadsFinished {
                token,
                uploaded,
                failure,
            });
        });
    }

    fn finish_uploads(
        &mut self,
        token: u64,
        uploaded: Vec<(FieldPath, UploadOutcome)>,
        failure: Option<UploadError>,
    ) {
        let Some(run) = self
            .run
            .as_ref()
            .filter(|run| run.token == token && run.phase == RunPhase::Uploading)
        else {
            tracing::debug!(token, "stale upload result");
            return;
        };
        let skipped = uploaded.iter().filter(|(_, outcome)| outcome.skipped).count();
        let sent = uploaded.len() - skipped;
        self.emit(
            SessionEvent::UploadFinished,
            json!({
                "workflow_id": run.workflow_id,
                "uploaded": sent,
                "skipped": skipped,
                "error": failure.as_ref().map(ToString::to_string),
            }),
        );
        if let Some(err) = failure {
            tracing::warn!(workflow_id = %run.workflow_id, "upload failed: {err}");
            self.end_run_with(status::upload_failed(&err));
            return;
        }
        self.set_status(status::running_after_uploads(sent, skipped));
        if let Some(tree) = self.tree.as_mut() {
            for (field, outcome) in &uploaded {
                tree.accept_upload(field, &outcome.server_path);
            }
        }
        if let Err(err) = self.submit(token) {
            tracing::warn!("run not submitted: {err}");
        }
    }

    /// Sends `WORKFLOW_OPERATION` for run `token`.
    fn submit(&mut self, token: u64) -> Result<(), ControllerError> {
        let env_data = self.env_data();
        let tree = self.tree.as_ref().ok_or(ControllerError::NoWorkflow)?;
        let expose = tree.values(&env_data.env());
        let field_count = expose.len();
        let message = ClientMessage::WorkflowOperation {
            workflow_id: tree.workflow_id().to_string(),
            expose,
        };
        if let Err(err) = self.connection.sink.send_text(&message.to_text()) {
            self.fail(format!("Error: {err:#}"));
            return Err(err.into());
        }
        if let Some(run) = self.run.as_mut().filter(|run| run.token == token) {
            run.phase = RunPhase::Submitted;
            tracing::info!(workflow_id = %run.workflow_id, "workflow operation sent");
            let payload = json!({ "workflow_id": run.workflow_id, "fields": field_count });
            self.emit(SessionEvent::RunStarted, payload);
        }
        Ok(())
    }

    /// Asks the server to cancel the outstanding run. Does nothing until the
    /// server has assigned a run id; returns whether a request was sent.
    pub fn cancel_run(&mut self) -> Result<bool, ControllerError> {
        if self.state == SessionState::Errored {
            return Ok(false);
        }
        let Some(run_id) = self.run_id().cloned() else {
            return Ok(false);
        };
        let message = ClientMessage::Cancel {
            run_id: run_id.clone(),
        };
        if let Err(err) = self.connection.sink.send_text(&message.to_text()) {
            self.fail(format!("Error: {err:#}"));
            return Err(err.into());
        }
        tracing::info!(run_id = %run_id_label(&run_id), "cancel requested");
        Ok(true)
    }

    // projects

    fn remember_project(&self, manifest_path: &Path) -> Result<(), ControllerError> {
        let path = manifest_path.to_string_lossy();
        self.global_saved
            .set_str("", "", memory::LAST_OPENED_PROJECT, Some(&path))?;
        Ok(())
    }

    pub fn last_opened_project(&self) -> Option<PathBuf> {
        self.global_saved
            .get_str("", "", memory::LAST_OPENED_PROJECT)
            .map(PathBuf::from)
    }

    /// Common tail of every project change.
    fn project_changed(&mut self, status: String) {
        self.thumbnails.invalidate();
        self.set_status(status);
        self.refresh_options();
    }

    pub fn open_project(&mut self, manifest_path: &Path) -> Result<(), ControllerError> {
        self.ensure_not_busy()?;
        self.flush_tree();
        match self.session.open(manifest_path) {
            Ok(project) => {
                let name = project.name().to_string();
                self.remember_project(manifest_path)?;
                self.project_changed(format!("Status: Opened project {name}"));
                Ok(())
            }
            Err(err) => {
                self.project_changed(format!("Error: Failed to open project file: {err}"));
                Err(err.into())
            }
        }
    }

    pub fn close_project(&mut self) -> Result<(), ControllerError> {
        self.ensure_not_busy()?;
        self.flush_tree();
        if self.session.close().is_none() {
            return Err(ProjectError::NoProject.into());
        }
        self.project_changed(status::CLOSED_PROJECT.to_string());
        Ok(())
    }

    pub fn switch_timeline(&mut self, timeline_id: &str) -> Result<(), ControllerError> {
        self.ensure_not_busy()?;
        self.flush_tree();
        let project = self.session.project_mut()?;
        project.switch_timeline(timeline_id)?;
        let name = project
            .current_timeline()
            .map(|timeline| timeline.name.clone())
            .unwrap_or_default();
        self.project_changed(format!("Status: Switched to timeline '{name}'"));
        Ok(())
    }

    pub fn branch_timeline(&mut self, name: &str, as_new_root: bool) -> Result<String, ControllerError> {
        self.ensure_not_busy()?;
        self.flush_tree();
        let id = self.session.project_mut()?.branch_timeline(name, as_new_root)?;
        let status = if as_new_root {
            format!("Status: Created new alternate timeline '{name}'")
        } else {
            format!("Status: Branched new timeline '{name}'")
        };
        self.project_changed(status);
        Ok(id)
    }

    pub fn delete_timeline(&mut self, timeline_id: &str, keep_children: bool) -> Result<Vec<String>, ControllerError> {
        self.ensure_not_busy()?;
        self.flush_tree();
        let removed = self
            .session
            .project_mut()?
            .delete_timeline(timeline_id, keep_children)?;
        self.project_changed(format!("Status: Deleted {} timeline(s)", removed.len()));
        Ok(removed)
    }

    /// Thumbnails of one timeline's files, for the project dialog.
    pub fn timeline_thumbnails(&mut self, timeline_id: &str) -> Result<Vec<(PathBuf, Arc<RgbaImage>)>, ControllerError> {
        let project = self.session.project().ok_or(ProjectError::NoProject)?;
        if !project.manifest().timelines.contains_key(timeline_id) {
            return Err(ProjectError::UnknownTimeline(timeline_id.to_string()).into());
        }
        let dir = project.timeline_dir(timeline_id);
        Ok(self.thumbnails.for_timeline(&dir))
    }

    /// Blocking; the plugin calls it from a worker.
    pub fn workflow_preview(&self, workflow_id: &str) -> Option<Vec<u8>> {
        fetch_workflow_preview(&self.options.config, workflow_id)
    }

    /// Writes pending field values and closes the connection.
    pub fn shutdown(&mut self) {
        self.flush_tree();
        self.connection.close();
    }
}
