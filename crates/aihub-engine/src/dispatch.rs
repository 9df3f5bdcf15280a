//! The one way background threads reach UI-owned state.
//!
//! The receive loop and upload workers never touch the controller directly;
//! they post a [`UiEvent`] and the UI thread applies it in `Controller::pump`.

use std::sync::mpsc;
use std::time::Duration;

use aihub_contracts::protocol::{FilePlacement, ServerMessage};
use aihub_contracts::store::FieldPath;

use crate::upload::{UploadError, UploadOutcome};

#[derive(Debug)]
pub enum UiEvent {
    Connected,
    Message(ServerMessage),
    UnknownMessage(String),
    /// A `FILE` descriptor matched with its binary payload.
    ProjectFile {
        placement: FilePlacement,
        bytes: Vec<u8>,
    },
    /// Inbound frame that could not be decoded.
    Malformed(String),
    Closed {
        reason: Option<String>,
    },
    /// Result of the upload phase of run `token`, in field order. Stops at
    /// the first failure.
    UploadsFinished {
        token: u64,
        uploaded: Vec<(FieldPath, UploadOutcome)>,
        failure: Option<UploadError>,
    },
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<UiEvent>,
}

impl Dispatcher {
    pub fn post(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("ui queue closed, dropping event");
        }
    }
}

#[derive(Debug)]
pub struct UiQueue {
    rx: mpsc::Receiver<UiEvent>,
}

impl UiQueue {
    /// Everything posted so far, without blocking.
    pub fn drain(&self) -> Vec<UiEvent> {
        self.rx.try_iter().collect()
    }

    pub fn next_timeout(&self, timeout: Duration) -> Option<UiEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub fn ui_channel() -> (Dispatcher, UiQueue) {
    let (tx, rx) = mpsc::channel();
    (Dispatcher { tx }, UiQueue { rx })
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn events_arrive_in_post_order_across_threads() {
        let (dispatcher, queue) = ui_channel();
        let remote = dispatcher.clone();
        thread::spawn(move || {
            remote.post(UiEvent::Connected);
            remote.post(UiEvent::UnknownMessage("PING".to_string()));
        })
        .join()
        .ok();
        let events = queue.drain();
        assert!(matches!(events[0], UiEvent::Connected));
        assert!(matches!(&events[1], UiEvent::UnknownMessage(kind) if kind == "PING"));
        assert!(queue.next_timeout(Duration::from_millis(5)).is_none());
    }
}
