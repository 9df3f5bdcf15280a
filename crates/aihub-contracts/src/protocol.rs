//! Wire messages exchanged with the AI Hub server.
//!
//! Text frames are JSON objects with a `type` discriminator; binary frames
//! carry raw payloads and are correlated out of band.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub const FILE_UPLOAD: &str = "FILE_UPLOAD";
pub const WORKFLOW_OPERATION: &str = "WORKFLOW_OPERATION";

const SERVER_MESSAGE_TYPES: &[&str] = &[
    "INFO_LIST",
    "UPLOAD_ACK",
    "FILE_UPLOAD_SUCCESS",
    "FILE_UPLOAD_SKIP",
    "ERROR",
    "STATUS",
    "WORKFLOW_AWAIT",
    "WORKFLOW_START",
    "WORKFLOW_STATUS",
    "WORKFLOW_FINISHED",
    "FILE",
    "PREPARE_BATCH",
    "SET_CONFIG_VALUE",
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("received invalid message from server: {0}")]
    Malformed(String),
    #[error("message of type {kind} is malformed: {source}")]
    BadShape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("workflow {workflow_id} field {field_id} has unknown type {tag}")]
    UnknownFieldKind {
        workflow_id: String,
        field_id: String,
        tag: String,
    },
    #[error("catalogue has no usable {0}")]
    EmptyCatalogue(&'static str),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    InfoList(InfoList),
    UploadAck,
    FileUploadSuccess {
        #[serde(default)]
        file: Option<String>,
    },
    FileUploadSkip {
        #[serde(default)]
        file: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Status {
        #[serde(default)]
        message: Option<String>,
    },
    WorkflowAwait {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        workflow_id: Option<String>,
        #[serde(default)]
        before_this: Option<Value>,
    },
    WorkflowStart {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        workflow_id: Option<String>,
    },
    WorkflowStatus {
        #[serde(default)]
        node_name: Option<String>,
        #[serde(default)]
        progress: Option<Value>,
        #[serde(default)]
        total: Option<Value>,
    },
    WorkflowFinished {
        #[serde(default)]
        error: bool,
        #[serde(default)]
        error_message: Option<String>,
    },
    File(FileDescriptor),
    PrepareBatch {
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        file_action: Option<FileAction>,
    },
    SetConfigValue {
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        value: Value,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::InfoList(_) => "INFO_LIST",
            ServerMessage::UploadAck => "UPLOAD_ACK",
            ServerMessage::FileUploadSuccess { .. } => "FILE_UPLOAD_SUCCESS",
            ServerMessage::FileUploadSkip { .. } => "FILE_UPLOAD_SKIP",
            ServerMessage::Error { .. } => "ERROR",
            ServerMessage::Status { .. } => "STATUS",
            ServerMessage::WorkflowAwait { .. } => "WORKFLOW_AWAIT",
            ServerMessage::WorkflowStart { .. } => "WORKFLOW_START",
            ServerMessage::WorkflowStatus { .. } => "WORKFLOW_STATUS",
            ServerMessage::WorkflowFinished { .. } => "WORKFLOW_FINISHED",
            ServerMessage::File(_) => "FILE",
            ServerMessage::PrepareBatch { .. } => "PREPARE_BATCH",
            ServerMessage::SetConfigValue { .. } => "SET_CONFIG_VALUE",
        }
    }
}

/// Raw catalogue snapshot; `catalogue::WorkflowCatalogue` gives it structure.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct InfoList {
    #[serde(default)]
    pub workflows: IndexMap<String, Value>,
    #[serde(default)]
    pub models: Vec<Value>,
    #[serde(default)]
    pub loras: Vec<Value>,
    #[serde(default)]
    pub samplers: Vec<String>,
    #[serde(default)]
    pub schedulers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct FileDescriptor {
    #[serde(default)]
    pub action: Option<FilePlacement>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_action: Option<FileAction>,
}

impl FileDescriptor {
    /// Placement with top-level `file_name`/`file_action` used as fallbacks.
    pub fn placement(&self) -> FilePlacement {
        let mut placement = self.action.clone().unwrap_or_default();
        if placement.file_name.is_none() {
            placement.file_name = self.file_name.clone();
        }
        if placement.file_action.is_none() {
            placement.file_action = self.file_action;
        }
        placement
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileAction {
    Replace,
    Append,
    Join,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementKind {
    NewImage,
    NewLayer,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceLayerAction {
    NewBefore,
    NewAfter,
    Replace,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRef {
    Id(u64),
    First,
    Last,
}

/// Where a server-pushed file is stored and how the host should show it.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct FilePlacement {
    #[serde(default)]
    pub action: Option<PlacementKind>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_action: Option<FileAction>,
    #[serde(default)]
    pub file_separator: Option<String>,
    #[serde(default)]
    pub pos_x: i64,
    #[serde(default)]
    pub pos_y: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub reference_layer_id: Option<Value>,
    #[serde(default)]
    pub reference_layer_action: Option<ReferenceLayerAction>,
}

impl FilePlacement {
    pub fn file_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or("unnamed")
    }

    pub fn file_action(&self) -> FileAction {
        self.file_action.unwrap_or(FileAction::Replace)
    }

    pub fn separator(&self) -> &[u8] {
        self.file_separator.as_deref().unwrap_or("").as_bytes()
    }

    pub fn layer_name(&self) -> &str {
        self.name.as_deref().unwrap_or("AI Hub Layer")
    }

    pub fn reference_layer(&self) -> Option<LayerRef> {
        match self.reference_layer_id.as_ref()? {
            Value::Number(number) => number.as_u64().map(LayerRef::Id),
            Value::String(raw) if raw == "__first__" => Some(LayerRef::First),
            Value::String(raw) if raw == "__last__" => Some(LayerRef::Last),
            Value::String(raw) if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) => {
                raw.parse().ok().map(LayerRef::Id)
            }
            _ => None,
        }
    }

    pub fn reference_layer_action(&self) -> ReferenceLayerAction {
        self.reference_layer_action
            .unwrap_or(ReferenceLayerAction::NewAfter)
    }
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Known(ServerMessage),
    Unknown(String),
}

pub fn parse_server_message(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Err(ProtocolError::Malformed(
            "message has no type discriminator".to_string(),
        ));
    };
    if !SERVER_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown(kind));
    }
    serde_json::from_value(value)
        .map(Inbound::Known)
        .map_err(|source| ProtocolError::BadShape { kind, source })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    FileUpload {
        filename: String,
        workflow_id: String,
    },
    WorkflowOperation {
        workflow_id: String,
        expose: Map<String, Value>,
    },
    Cancel {
        run_id: Value,
    },
}

impl ClientMessage {
    pub fn to_value(&self) -> Value {
        match self {
            ClientMessage::FileUpload {
                filename,
                workflow_id,
            } => json!({
                "type": FILE_UPLOAD,
                "filename": filename,
                "workflow_id": workflow_id,
                "if_not_exists": true,
            }),
            ClientMessage::WorkflowOperation {
                workflow_id,
                expose,
            } => json!({
                "type": WORKFLOW_OPERATION,
                "workflow_id": workflow_id,
                "expose": expose,
            }),
            ClientMessage::Cancel { run_id } => json!({
                "type": WORKFLOW_OPERATION,
                "cancel": run_id,
            }),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

/// Renders a progress number with the fewest decimals: `3.0` prints as `3`.
pub fn display_number(value: Option<&Value>, fallback: i64) -> String {
    match value {
        Some(Value::Number(number)) => {
            if let Some(int) = number.as_i64() {
                return int.to_string();
            }
            match number.as_f64() {
                Some(float) if float.fract() == 0.0 && float.abs() < 1e15 => {
                    format!("{}", float as i64)
                }
                Some(float) => float.to_string(),
                None => number.to_string(),
            }
        }
        Some(Value::String(text)) => text.clone(),
        _ => fallback.to_string(),
    }
}

/// Run ids may arrive as strings or numbers; render either for logs.
pub fn run_id_label(run_id: &Value) -> String {
    match run_id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
