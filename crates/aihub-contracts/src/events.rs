use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Keys stamped by the writer. Payloads cannot replace them, so every line
/// can be attributed to the session that wrote it.
const RESERVED_KEYS: [&str; 3] = ["type", "session_id", "ts"];

/// What a line of `events.jsonl` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Status,
    CatalogueReceived,
    WorkflowSelected,
    RunStarted,
    RunAccepted,
    RunFinished,
    UploadFinished,
    ProjectFileStored,
    Errored,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::CatalogueReceived => "catalogue_received",
            Self::WorkflowSelected => "workflow_selected",
            Self::RunStarted => "run_started",
            Self::RunAccepted => "run_accepted",
            Self::RunFinished => "run_finished",
            Self::UploadFinished => "upload_finished",
            Self::ProjectFileStored => "project_file_stored",
            Self::Errored => "errored",
        }
    }
}

/// Append-only log of one client session, shared by every session that
/// uses the same base folder.
///
/// Each line is a compact JSON object with `type`, `session_id` and `ts`
/// followed by the caller's fields. Clones share the file lock, so the
/// receive loop, upload workers and the UI thread can each hold a handle.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Appends one event. Object payloads are merged field by field, any
    /// other payload is stored under `data`.
    pub fn emit(&self, event: SessionEvent, payload: Value) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert("type".to_string(), Value::String(event.as_str().to_string()));
        line.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        match payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if RESERVED_KEYS.contains(&key.as_str()) {
                        tracing::debug!(event = event.as_str(), key, "ignoring reserved event key");
                        continue;
                    }
                    line.insert(key, value);
                }
            }
            Value::Null => {}
            other => {
                line.insert("data".to_string(), other);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed opening {}", self.inner.path.display()))?;
        writeln!(file, "{text}")?;
        Ok(Value::Object(line))
    }

    /// Emits and drops the outcome; event logging never interrupts the session.
    pub fn emit_quiet(&self, event: SessionEvent, payload: Value) {
        if let Err(err) = self.emit(event, payload) {
            tracing::warn!(event = event.as_str(), "failed to append session event: {err:#}");
        }
    }

    /// Events this session wrote, in order. Lines of other sessions and
    /// unreadable lines are skipped.
    pub fn session_events(&self, event: Option<SessionEvent>) -> anyhow::Result<Vec<Value>> {
        let file = match std::fs::File::open(&self.inner.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", self.inner.path.display()))
            }
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let Ok(parsed) = serde_json::from_str::<Value>(&line?) else {
                continue;
            };
            if parsed["session_id"] != self.inner.session_id.as_str() {
                continue;
            }
            if event.is_some_and(|event| parsed["type"] != event.as_str()) {
                continue;
            }
            events.push(parsed);
        }
        Ok(events)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn lines_carry_type_session_and_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-123");

        let emitted = writer.emit(SessionEvent::WorkflowSelected, json!({"workflow_id": "upscale"}))?;
        let content = std::fs::read_to_string(writer.path())?;
        let parsed: Value = serde_json::from_str(content.trim_end())?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], "workflow_selected");
        assert_eq!(parsed["session_id"], "session-123");
        assert_eq!(parsed["workflow_id"], "upscale");
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_cannot_rewrite_the_session_stamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-123");

        let emitted = writer.emit(
            SessionEvent::Status,
            json!({"type": "run_finished", "session_id": "other", "ts": "yesterday", "message": "Status: Ready"}),
        )?;
        assert_eq!(emitted["type"], "status");
        assert_eq!(emitted["session_id"], "session-123");
        assert_ne!(emitted["ts"], "yesterday");
        assert_eq!(emitted["message"], "Status: Ready");

        let scalar = writer.emit(SessionEvent::Errored, json!("boom"))?;
        assert_eq!(scalar["data"], "boom");
        Ok(())
    }

    #[test]
    fn sessions_sharing_a_log_read_back_their_own_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let first = EventWriter::new(&path, "first");
        let second = EventWriter::new(&path, "second");
        let clone = first.clone();

        first.emit(SessionEvent::RunStarted, json!({"workflow_id": "a"}))?;
        second.emit(SessionEvent::RunStarted, json!({"workflow_id": "b"}))?;
        clone.emit(SessionEvent::RunFinished, json!({"workflow_id": "a"}))?;
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"{truncated\n")?;

        assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 4);
        assert_eq!(first.session_events(None)?.len(), 2);
        let finished = first.session_events(Some(SessionEvent::RunFinished))?;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0]["workflow_id"], "a");
        assert_eq!(second.session_events(Some(SessionEvent::RunFinished))?.len(), 0);
        Ok(())
    }

    #[test]
    fn missing_log_has_no_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("absent.jsonl"), "s");
        assert!(writer.session_events(None)?.is_empty());
        Ok(())
    }
}
