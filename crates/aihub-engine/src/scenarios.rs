//! Whole-session runs against a scripted server: catalogue, edits, uploads,
//! the run itself and the files the server pushes back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aihub_contracts::events::SessionEvent;
use aihub_contracts::project::files::FILES_DIR;
use aihub_contracts::store::{get_dot_path, read_config_json, FieldPath, HubConfig, CONFIG_FILE_NAME};
use anyhow::{anyhow, Result};
use image::{Rgba, RgbaImage};
use serde_json::{json, Value};

use crate::controller::{status, Connection, Controller, ControllerError, ControllerOptions, SessionState};
use crate::dispatch::ui_channel;
use crate::host::NullHost;
use crate::relegator::Relegator;
use crate::router::Router;
use crate::transport::{Frame, FrameSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadReply {
    Ack,
    Skip,
    Refuse,
}

const STORED_PATH: &str = "input/stored.png";
const KNOWN_PATH: &str = "input/known.png";
const REFUSAL: &str = "upload quota exceeded";

/// Plays the server side of the upload handshake; everything else is fed
/// in by the test through [`Scripted::feed`].
struct ScriptedSink {
    router: Arc<Router>,
    reply: UploadReply,
    texts: Mutex<Vec<Value>>,
    binaries: Mutex<Vec<Vec<u8>>>,
}

impl FrameSink for ScriptedSink {
    fn send_text(&self, text: &str) -> Result<()> {
        let message: Value = serde_json::from_str(text)?;
        let kind = message["type"].as_str().unwrap_or_default().to_string();
        self.texts
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .push(message);
        if kind == "FILE_UPLOAD" {
            let reply = match self.reply {
                UploadReply::Ack => json!({"type": "UPLOAD_ACK"}),
                UploadReply::Skip => json!({"type": "FILE_UPLOAD_SKIP", "file": KNOWN_PATH}),
                UploadReply::Refuse => json!({"type": "ERROR", "message": REFUSAL}),
            };
            self.router.route(Frame::Text(reply.to_string()));
        }
        Ok(())
    }

    fn send_binary(&self, bytes: &[u8]) -> Result<()> {
        self.binaries
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .push(bytes.to_vec());
        let reply = json!({"type": "FILE_UPLOAD_SUCCESS", "file": STORED_PATH});
        self.router.route(Frame::Text(reply.to_string()));
        Ok(())
    }
}

struct Scripted {
    controller: Controller<NullHost>,
    router: Arc<Router>,
    sink: Arc<ScriptedSink>,
    base: tempfile::TempDir,
}

impl Scripted {
    fn new(reply: UploadReply) -> Result<Self> {
        let base = tempfile::tempdir()?;
        let relegator = Arc::new(Relegator::new());
        let (dispatcher, queue) = ui_channel();
        let router = Arc::new(Router::new(Arc::clone(&relegator), dispatcher.clone()));
        let sink = Arc::new(ScriptedSink {
            router: Arc::clone(&router),
            reply,
            texts: Mutex::new(Vec::new()),
            binaries: Mutex::new(Vec::new()),
        });
        let connection = Connection::from_parts(sink.clone(), relegator, dispatcher, queue);
        let mut options = ControllerOptions::new(base.path().join("config"), HubConfig::default());
        options.upload_timeout = Duration::from_secs(2);
        let controller = Controller::new(options, connection, NullHost)?;
        let mut scripted = Self {
            controller,
            router,
            sink,
            base,
        };
        scripted.router.connected();
        scripted.pump()?;
        Ok(scripted)
    }

    fn pump(&mut self) -> Result<()> {
        self.controller.pump(Instant::now())?;
        Ok(())
    }

    fn feed(&mut self, message: Value) -> Result<()> {
        self.router.route(Frame::Text(message.to_string()));
        self.pump()
    }

    fn feed_binary(&mut self, bytes: &[u8]) -> Result<()> {
        self.router.route(Frame::Binary(bytes.to_vec()));
        self.pump()
    }

    fn catalogue(&mut self, workflows: Value) -> Result<()> {
        self.feed(json!({
            "type": "INFO_LIST",
            "workflows": workflows,
            "models": [
                {"id": "m1", "name": "SDXL base", "context": "image", "family": "sdxl", "file": "m1.safetensors"}
            ],
            "loras": [
                {"id": "l1", "context": "image", "family": "sdxl", "file": "l1.safetensors"},
                {"id": "l2", "context": "image", "family": "sdxl", "file": "l2.safetensors"}
            ],
            "samplers": ["euler"],
            "schedulers": ["normal"]
        }))
    }

    fn texts(&self) -> Vec<Value> {
        self.sink
            .texts
            .lock()
            .map(|texts| texts.clone())
            .unwrap_or_default()
    }

    fn sent_of(&self, kind: &str) -> Vec<Value> {
        self.texts()
            .into_iter()
            .filter(|message| message["type"] == kind)
            .collect()
    }

    fn binaries(&self) -> usize {
        self.sink.binaries.lock().map(|sent| sent.len()).unwrap_or_default()
    }

    /// Pumps until the run has been submitted or the upload worker gave up.
    fn wait_for_submit(&mut self) -> Result<Value> {
        for _ in 0..100 {
            if let Some(operation) = self.sent_of("WORKFLOW_OPERATION").pop() {
                return Ok(operation);
            }
            if !self.controller.is_running() {
                break;
            }
            self.controller.wait_and_pump(Duration::from_millis(50))?;
        }
        Err(anyhow!("run was never submitted: {}", self.controller.status()))
    }

    fn set(&mut self, field: &str, value: Value) -> Result<()> {
        self.controller
            .set_value(&FieldPath::single(field), value, Instant::now())?;
        Ok(())
    }

    fn state_of(&self, field: &str) -> Option<Value> {
        let tree = self.controller.tree()?;
        tree.field(&FieldPath::single(field)).map(|field| field.state())
    }
}

fn write_png(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    RgbaImage::from_pixel(8, 4, Rgba([10, 20, 30, 255])).save(&path)?;
    Ok(path)
}

#[test]
fn delegated_minimum_follows_its_source() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Ack)?;
    scripted.catalogue(json!({
        "frames": {"label": "Frames", "context": "image", "category": "gen", "expose": {
            "start": {"type": "AIHubExposeInteger", "data": {"label": "Start", "min": 0, "max": 10, "value": 0, "index": 0}},
            "end": {"type": "AIHubExposeInteger", "data": {
                "label": "End", "min": 0, "max": 10, "value": 3, "index": 1,
                "min_expose_id": "start", "min_expose_offset": 1
            }}
        }}
    }))?;
    assert_eq!(scripted.controller.selected_workflow(), Some("frames"));
    assert_eq!(scripted.state_of("end"), Some(json!(3)));

    scripted.set("start", json!(5))?;
    assert_eq!(scripted.state_of("end"), Some(json!(6)));

    // lowering the source relaxes the bound but leaves the value alone
    scripted.set("start", json!(1))?;
    assert_eq!(scripted.state_of("end"), Some(json!(6)));
    Ok(())
}

#[test]
fn missing_required_image_blocks_the_run() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Ack)?;
    scripted.catalogue(json!({
        "img2img": {"label": "Image to image", "context": "image", "category": "gen", "expose": {
            "source": {"type": "AIHubExposeImage", "data": {"label": "Source image"}}
        }}
    }))?;

    let err = scripted.controller.run_workflow(None);
    match err {
        Err(ControllerError::Blocked { label, message }) => {
            assert_eq!(label, "Source image");
            assert!(message.contains("Source image"), "{message}");
        }
        other => return Err(anyhow!("expected a blocked run, got {other:?}")),
    }
    assert!(scripted
        .controller
        .status()
        .starts_with("Error: Some input fields are invalid."));
    assert_eq!(scripted.controller.state(), SessionState::Ready);
    assert!(scripted.sent_of("WORKFLOW_OPERATION").is_empty());
    assert!(scripted.sent_of("FILE_UPLOAD").is_empty());
    Ok(())
}

#[test]
fn lora_selection_is_sent_as_joined_strings() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Ack)?;
    scripted.catalogue(json!({
        "txt2img": {"label": "Text to image", "context": "image", "category": "gen", "expose": {
            "model": {"type": "AIHubExposeModel", "data": {"label": "Model", "limit_to_family": "sdxl"}}
        }}
    }))?;
    scripted.set(
        "model",
        json!({"model": "m1", "loras": [
            {"id": "l1", "enabled": true, "strength": 0.7},
            {"id": "l2", "enabled": false, "strength": 1.0}
        ]}),
    )?;

    scripted.controller.run_workflow(None)?;
    let operation = scripted.wait_for_submit()?;
    assert_eq!(operation["workflow_id"], "txt2img");
    let model = &operation["expose"]["model"];
    assert_eq!(model["model"], "m1");
    assert_eq!(model["loras"], "l1.safetensors");
    assert_eq!(model["loras_strengths"], "0.7");
    assert_eq!(model["loras_use_loader_model_only"], "false");
    assert_eq!(scripted.controller.status(), status::RUNNING);
    Ok(())
}

fn upload_workflow(scripted: &mut Scripted) -> Result<PathBuf> {
    scripted.catalogue(json!({
        "img2img": {"label": "Image to image", "context": "image", "category": "gen", "expose": {
            "source": {"type": "AIHubExposeImage", "data": {"label": "Source image"}}
        }}
    }))?;
    let png = write_png(scripted.base.path(), "source.png")?;
    scripted.set("source", json!(png.to_string_lossy()))?;
    Ok(png)
}

#[test]
fn acknowledged_upload_sends_bytes_once() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Ack)?;
    upload_workflow(&mut scripted)?;

    scripted.controller.run_workflow(None)?;
    let operation = scripted.wait_for_submit()?;

    let declared = scripted.sent_of("FILE_UPLOAD");
    assert_eq!(declared.len(), 1);
    let filename = declared[0]["filename"].as_str().unwrap_or_default();
    assert!(filename.ends_with(".png"), "{filename}");
    assert_eq!(filename.len(), 64 + ".png".len());
    assert_eq!(declared[0]["workflow_id"], "img2img");

    assert_eq!(scripted.binaries(), 1);
    let source = &operation["expose"]["source"];
    assert_eq!(source["local_file"], STORED_PATH);
    assert_eq!(source["width"], 8);
    assert_eq!(source["height"], 4);
    assert_eq!(scripted.controller.status(), status::running_after_uploads(1, 0));
    Ok(())
}

#[test]
fn known_content_is_not_sent_again() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Skip)?;
    upload_workflow(&mut scripted)?;

    scripted.controller.run_workflow(None)?;
    let operation = scripted.wait_for_submit()?;
    assert_eq!(scripted.sent_of("FILE_UPLOAD").len(), 1);
    assert_eq!(scripted.binaries(), 0);
    assert_eq!(operation["expose"]["source"]["local_file"], KNOWN_PATH);
    assert_eq!(scripted.controller.status(), status::running_after_uploads(0, 1));
    Ok(())
}

#[test]
fn refused_upload_reports_the_server_message() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Refuse)?;
    upload_workflow(&mut scripted)?;

    scripted.controller.run_workflow(None)?;
    for _ in 0..100 {
        if !scripted.controller.is_running() {
            break;
        }
        scripted.controller.wait_and_pump(Duration::from_millis(50))?;
    }
    assert_eq!(scripted.controller.state(), SessionState::Ready);
    assert_eq!(scripted.controller.status(), status::upload_failed(REFUSAL));
    assert!(scripted.controller.status().contains(REFUSAL));
    assert_eq!(scripted.binaries(), 0);
    assert!(scripted.sent_of("WORKFLOW_OPERATION").is_empty());
    Ok(())
}

#[test]
fn project_init_run_creates_then_branches() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Ack)?;
    scripted.catalogue(json!({
        "comic_init": {"label": "New comic", "context": "image", "category": "gen",
            "project_type": "comic", "project_type_init": true, "expose": {}},
        "comic_panel": {"label": "Add panel", "context": "image", "category": "gen",
            "project_type": "comic", "expose": {}}
    }))?;
    let ids: Vec<String> = scripted
        .controller
        .workflow_options()
        .into_iter()
        .map(|option| option.id)
        .collect();
    assert_eq!(ids, vec!["comic_init"]);

    assert!(matches!(
        scripted.controller.run_workflow(None),
        Err(ControllerError::NeedsProjectPath(_))
    ));

    let requested = scripted.base.path().join("comic.aihubproj");
    scripted.controller.run_workflow(Some(&requested))?;
    let (manifest, initial_id) = {
        let project = scripted
            .controller
            .session()
            .project()
            .ok_or_else(|| anyhow!("no project created"))?;
        let timeline = project
            .current_timeline()
            .ok_or_else(|| anyhow!("no current timeline"))?;
        assert_eq!(project.name(), "comic");
        assert_eq!(timeline.name, "New comic");
        assert!(timeline.initial);
        (project.manifest_path().to_path_buf(), timeline.id.clone())
    };
    assert_eq!(manifest, requested);
    assert!(manifest.is_file());
    assert_eq!(scripted.controller.last_opened_project(), Some(manifest.clone()));

    scripted.feed(json!({"type": "WORKFLOW_START", "id": 7, "workflow_id": "comic_init"}))?;
    assert_eq!(scripted.controller.run_id(), Some(&json!(7)));
    scripted.feed(json!({"type": "WORKFLOW_FINISHED", "error": false}))?;
    assert_eq!(scripted.controller.status(), status::FINISHED);

    // the open project makes its non-init workflows eligible
    let ids: Vec<String> = scripted
        .controller
        .workflow_options()
        .into_iter()
        .map(|option| option.id)
        .collect();
    assert_eq!(ids, vec!["comic_init", "comic_panel"]);

    scripted.controller.select_workflow("comic_panel")?;
    scripted.controller.run_workflow(None)?;
    let (panel_id, panel_dir) = {
        let project = scripted
            .controller
            .session()
            .project()
            .ok_or_else(|| anyhow!("project closed"))?;
        let timeline = project
            .current_timeline()
            .ok_or_else(|| anyhow!("no current timeline"))?;
        assert_eq!(timeline.name, "Add panel");
        assert_eq!(timeline.parent_id.as_deref(), Some(initial_id.as_str()));
        (timeline.id.clone(), project.timeline_dir(&timeline.id))
    };
    assert_ne!(panel_id, initial_id);

    scripted.feed(json!({"type": "FILE", "action": {
        "action": "NEW_IMAGE", "file_name": "panel.png", "file_action": "APPEND"
    }}))?;
    scripted.feed_binary(b"panel bytes")?;
    let stored = panel_dir.join(FILES_DIR).join("panel_1.png");
    assert_eq!(std::fs::read(&stored)?, b"panel bytes");

    scripted.feed(json!({"type": "SET_CONFIG_VALUE", "field": "story.page", "value": 3}))?;
    let config = read_config_json(&panel_dir.join(CONFIG_FILE_NAME));
    assert_eq!(get_dot_path(&config, "story.page"), Some(&json!(3)));

    scripted.feed(json!({"type": "PREPARE_BATCH", "file_name": "panel.png", "file_action": "REPLACE"}))?;
    assert!(!stored.exists());

    scripted.feed(json!({"type": "WORKFLOW_FINISHED", "error": true, "error_message": "out of memory"}))?;
    assert_eq!(
        scripted.controller.status(),
        "Status: Workflow finished with error: out of memory"
    );
    assert_eq!(scripted.controller.state(), SessionState::Ready);

    let finished = scripted
        .controller
        .events()
        .session_events(Some(SessionEvent::RunFinished))?;
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[1]["error_message"], "out of memory");
    Ok(())
}

#[test]
fn edits_are_refused_while_running() -> Result<()> {
    let mut scripted = Scripted::new(UploadReply::Ack)?;
    scripted.catalogue(json!({
        "txt2img": {"label": "Text to image", "context": "image", "category": "gen", "expose": {
            "steps": {"type": "AIHubExposeInteger", "data": {"label": "Steps", "min": 1, "max": 50, "value": 20}}
        }}
    }))?;
    scripted.controller.run_workflow(None)?;
    assert!(matches!(
        scripted.controller.set_value(&FieldPath::single("steps"), json!(30), Instant::now()),
        Err(ControllerError::Busy)
    ));
    assert!(matches!(scripted.controller.run_workflow(None), Err(ControllerError::Busy)));

    scripted.feed(json!({"type": "WORKFLOW_FINISHED"}))?;
    scripted.set("steps", json!(30))?;
    assert_eq!(scripted.state_of("steps"), Some(json!(30)));
    Ok(())
}
