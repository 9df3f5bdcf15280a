//! Runtime side of the AI Hub client: the websocket session, binary
//! uploads, the form fields of the selected workflow and the controller
//! that ties them to the open project.

pub mod controller;
pub mod debounce;
pub mod dispatch;
pub mod exposes;
pub mod host;
pub mod preview;
pub mod relegator;
pub mod router;
pub mod thumbnails;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod scenarios;

pub use controller::{
    status, Connection, Controller, ControllerError, ControllerOptions, SessionState,
};
pub use exposes::tree::Blocker;
pub use exposes::{Expose, ExposeTree, FieldEnv};
pub use host::{FileImageHost, ImageHost, NullHost};
pub use relegator::Relegator;
pub use router::Router;
pub use transport::{Frame, FrameSink, WsTransport};
pub use upload::{PendingUpload, UploadError, UploadOutcome, Uploader};
