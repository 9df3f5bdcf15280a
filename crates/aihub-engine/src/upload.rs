//! Two-phase binary upload: declare the content hash, then send bytes only
//! when the server does not already have them.

use std::path::PathBuf;
use std::time::Duration;

use aihub_contracts::protocol::{parse_server_message, ClientMessage, Inbound, ServerMessage};
use aihub_contracts::store::FieldPath;
use sha2::{Digest, Sha256};

use crate::relegator::Relegator;
use crate::transport::FrameSink;

pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const PNG_HASHED_CHUNKS: &[&[u8; 4]] = &[b"IHDR", b"IDAT", b"IEND"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("timeout waiting for response")]
    Timeout,
    #[error("{0}")]
    Server(String),
    #[error("server did not report an uploaded file path")]
    MissingPath,
    #[error("unexpected reply {0} during upload")]
    UnexpectedReply(String),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Prepare(String),
}

/// Bytes one field wants uploaded, with the hash they are declared under.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub field: FieldPath,
    pub local_file: Option<PathBuf>,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub extension: String,
}

impl PendingUpload {
    pub fn new(field: FieldPath, local_file: Option<PathBuf>, bytes: Vec<u8>) -> Self {
        let extension = local_file
            .as_ref()
            .and_then(|path| path.extension())
            .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_else(|| {
                if bytes.starts_with(PNG_SIGNATURE) {
                    ".png".to_string()
                } else {
                    String::new()
                }
            });
        Self {
            content_hash: content_hash(&bytes),
            field,
            local_file,
            bytes,
            extension,
        }
    }

    /// Name declared in `FILE_UPLOAD`: the hash plus the source extension.
    pub fn upload_name(&self) -> String {
        format!("{}{}", self.content_hash, self.extension)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub server_path: String,
    /// True when the server already had the content and no bytes were sent.
    pub skipped: bool,
}

/// SHA-256 of the payload. For PNG only `IHDR`, `IDAT` and `IEND` are
/// hashed so metadata-only re-encodes keep the same hash.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    if !hash_png_chunks(bytes, &mut hasher) {
        hasher = Sha256::new();
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

fn hash_png_chunks(bytes: &[u8], hasher: &mut Sha256) -> bool {
    let Some(mut rest) = bytes.strip_prefix(PNG_SIGNATURE) else {
        return false;
    };
    let mut saw_end = false;
    while rest.len() >= 12 {
        let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let Some(total) = length.checked_add(12) else {
            return false;
        };
        if rest.len() < total {
            return false;
        }
        let kind = &rest[4..8];
        if PNG_HASHED_CHUNKS.iter().any(|wanted| kind == wanted.as_slice()) {
            hasher.update(kind);
            hasher.update(&rest[8..8 + length]);
        }
        if kind == b"IEND" {
            saw_end = true;
            break;
        }
        rest = &rest[total..];
    }
    saw_end
}

/// Runs the upload handshake over a sink and its relegator. Must not be
/// called on the UI thread: every step can block for up to `timeout`.
pub struct Uploader<'a> {
    sink: &'a dyn FrameSink,
    relegator: &'a Relegator,
    timeout: Duration,
}

impl<'a> Uploader<'a> {
    pub fn new(sink: &'a dyn FrameSink, relegator: &'a Relegator) -> Self {
        Self {
            sink,
            relegator,
            timeout: UPLOAD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn upload_one(
        &self,
        upload: &PendingUpload,
        workflow_id: &str,
    ) -> Result<UploadOutcome, UploadError> {
        let header = ClientMessage::FileUpload {
            filename: upload.upload_name(),
            workflow_id: workflow_id.to_string(),
        };
        self.relegator.arm();
        self.sink
            .send_text(&header.to_text())
            .map_err(|err| UploadError::Transport(err.to_string()))?;

        match self.await_reply()? {
            ServerMessage::Error { message } => {
                return Err(UploadError::Server(message.unwrap_or_default()))
            }
            ServerMessage::FileUploadSkip { file } => {
                tracing::debug!(hash = %upload.content_hash, "server already has upload");
                return Ok(UploadOutcome {
                    server_path: file.unwrap_or_else(|| upload.upload_name()),
                    skipped: true,
                });
            }
            ServerMessage::UploadAck => {}
            other => return Err(UploadError::UnexpectedReply(other.kind().to_string())),
        }

        self.relegator.arm();
        self.sink
            .send_binary(&upload.bytes)
            .map_err(|err| UploadError::Transport(err.to_string()))?;

        match self.await_reply()? {
            ServerMessage::FileUploadSuccess { file: Some(path) } if !path.is_empty() => {
                tracing::debug!(hash = %upload.content_hash, path = %path, "upload stored");
                Ok(UploadOutcome {
                    server_path: path,
                    skipped: false,
                })
            }
            ServerMessage::FileUploadSuccess { .. } => Err(UploadError::MissingPath),
            ServerMessage::Error { message } => Err(UploadError::Server(message.unwrap_or_default())),
            other => Err(UploadError::UnexpectedReply(other.kind().to_string())),
        }
    }

    fn await_reply(&self) -> Result<ServerMessage, UploadError> {
        if !self.relegator.wait(self.timeout) {
            return Err(UploadError::Timeout);
        }
        let raw = self.relegator.take_response().ok_or(UploadError::Timeout)?;
        match parse_server_message(&raw) {
            Ok(Inbound::Known(message)) => Ok(message),
            Ok(Inbound::Unknown(kind)) => Err(UploadError::UnexpectedReply(kind)),
            Err(err) => Err(UploadError::UnexpectedReply(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use serde_json::Value;

    use super::*;
    use crate::transport::Frame;

    fn png(chunks: &[(&str, &str)]) -> Vec<u8> {
        let mut out = PNG_SIGNATURE.to_vec();
        for (kind, data) in chunks {
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(kind.as_bytes());
            out.extend_from_slice(data.as_bytes());
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        out
    }

    #[test]
    fn png_hash_ignores_ancillary_chunks() {
        let plain = png(&[("IHDR", "head"), ("IDAT", "pixels"), ("IEND", "")]);
        let tagged = png(&[
            ("IHDR", "head"),
            ("tEXt", "Software\0gimp"),
            ("IDAT", "pixels"),
            ("tIME", "1234567"),
            ("IEND", ""),
        ]);
        let changed = png(&[("IHDR", "head"), ("IDAT", "pixelz"), ("IEND", "")]);
        assert_eq!(content_hash(&plain), content_hash(&tagged));
        assert_ne!(content_hash(&plain), content_hash(&changed));
    }

    #[test]
    fn truncated_png_and_other_bytes_hash_raw() {
        let mut truncated = png(&[("IHDR", "head"), ("IDAT", "pixels")]);
        truncated.truncate(truncated.len() - 2);
        let mut raw = Sha256::new();
        raw.update(&truncated);
        assert_eq!(content_hash(&truncated), hex::encode(raw.finalize()));
        assert_eq!(content_hash(b"abc").len(), 64);
    }

    #[test]
    fn extension_comes_from_file_or_signature() {
        let field = FieldPath::single("image");
        let from_file = PendingUpload::new(field.clone(), Some(PathBuf::from("/x/in.JPG")), b"x".to_vec());
        assert_eq!(from_file.extension, ".jpg");
        let png_bytes = png(&[("IHDR", ""), ("IEND", "")]);
        let from_bytes = PendingUpload::new(field, None, png_bytes);
        assert_eq!(from_bytes.upload_name(), format!("{}.png", from_bytes.content_hash));
    }

    /// Answers each frame with the next scripted reply through the relegator,
    /// the way the receive loop would.
    struct ScriptedServer {
        relegator: Arc<Relegator>,
        replies: Mutex<Vec<&'static str>>,
        sent: Mutex<Vec<Frame>>,
    }

    impl ScriptedServer {
        fn new(relegator: Arc<Relegator>, replies: &[&'static str]) -> Self {
            let mut replies = replies.to_vec();
            replies.reverse();
            Self {
                relegator,
                replies: Mutex::new(replies),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn reply(&self) {
            if let Some(next) = self.replies.lock().ok().and_then(|mut r| r.pop()) {
                self.relegator.fulfil(next.to_string());
            }
        }

        fn sent(&self) -> Vec<Frame> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    impl FrameSink for ScriptedServer {
        fn send_text(&self, text: &str) -> Result<()> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(Frame::Text(text.to_string()));
            }
            self.reply();
            Ok(())
        }

        fn send_binary(&self, bytes: &[u8]) -> Result<()> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(Frame::Binary(bytes.to_vec()));
            }
            self.reply();
            Ok(())
        }
    }

    fn pending() -> PendingUpload {
        PendingUpload::new(FieldPath::single("image"), None, b"bytes".to_vec())
    }

    #[test]
    fn skip_never_sends_bytes() -> Result<()> {
        let relegator = Arc::new(Relegator::new());
        let server = ScriptedServer::new(
            Arc::clone(&relegator),
            &[r#"{"type":"FILE_UPLOAD_SKIP","file":"uploads/abc"}"#],
        );
        let outcome = Uploader::new(&server, &relegator).upload_one(&pending(), "wf")?;
        assert_eq!(
            outcome,
            UploadOutcome {
                server_path: "uploads/abc".to_string(),
                skipped: true
            }
        );
        let sent = server.sent();
        assert_eq!(sent.len(), 1);
        let Frame::Text(header) = &sent[0] else {
            panic!("expected header text");
        };
        let header: Value = serde_json::from_str(header)?;
        assert_eq!(header["type"], "FILE_UPLOAD");
        assert_eq!(header["if_not_exists"], true);
        assert_eq!(header["workflow_id"], "wf");
        Ok(())
    }

    #[test]
    fn ack_sends_exactly_one_binary_frame() -> Result<()> {
        let relegator = Arc::new(Relegator::new());
        let server = ScriptedServer::new(
            Arc::clone(&relegator),
            &[
                r#"{"type":"UPLOAD_ACK"}"#,
                r#"{"type":"FILE_UPLOAD_SUCCESS","file":"uploads/new.png"}"#,
            ],
        );
        let outcome = Uploader::new(&server, &relegator).upload_one(&pending(), "wf")?;
        assert_eq!(outcome.server_path, "uploads/new.png");
        assert!(!outcome.skipped);
        let sent = server.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], Frame::Binary(b"bytes".to_vec()));
        Ok(())
    }

    #[test]
    fn failures_map_to_upload_errors() {
        let cases: Vec<(Vec<&'static str>, UploadError)> = vec![
            (
                vec![r#"{"type":"ERROR","message":"quota"}"#],
                UploadError::Server("quota".to_string()),
            ),
            (
                vec![r#"{"type":"UPLOAD_ACK"}"#, r#"{"type":"FILE_UPLOAD_SUCCESS"}"#],
                UploadError::MissingPath,
            ),
            (
                vec![r#"{"type":"UPLOAD_ACK"}"#, r#"{"type":"STATUS","message":"busy"}"#],
                UploadError::UnexpectedReply("STATUS".to_string()),
            ),
            (vec![r#"{"type":"UPLOAD_ACK"}"#], UploadError::Timeout),
        ];
        for (replies, expected) in cases {
            let relegator = Arc::new(Relegator::new());
            let server = ScriptedServer::new(Arc::clone(&relegator), &replies);
            let result = Uploader::new(&server, &relegator)
                .with_timeout(Duration::from_millis(20))
                .upload_one(&pending(), "wf");
            assert_eq!(result, Err(expected));
        }
    }
}
