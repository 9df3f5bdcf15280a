use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use aihub_contracts::protocol::{parse_server_message, FileDescriptor, Inbound, ServerMessage};

use crate::dispatch::{Dispatcher, UiEvent};
use crate::relegator::Relegator;
use crate::transport::Frame;

#[derive(Debug, Default)]
struct PendingFiles {
    descriptors: VecDeque<FileDescriptor>,
    payloads: VecDeque<Vec<u8>>,
}

/// Routes every inbound frame to exactly one consumer:
///
/// 1. text while the relegator is armed goes to the relegator, whatever it says;
/// 2. binary with a queued `FILE` descriptor completes the oldest descriptor;
/// 3. binary with no descriptor is buffered until one arrives;
/// 4. any other text is decoded and posted to the UI queue.
pub struct Router {
    relegator: Arc<Relegator>,
    dispatcher: Dispatcher,
    pending: Mutex<PendingFiles>,
}

impl Router {
    pub fn new(relegator: Arc<Relegator>, dispatcher: Dispatcher) -> Self {
        Self {
            relegator,
            dispatcher,
            pending: Mutex::new(PendingFiles::default()),
        }
    }

    pub fn connected(&self) {
        self.dispatcher.post(UiEvent::Connected);
    }

    pub fn closed(&self, reason: Option<String>) {
        self.dispatcher.post(UiEvent::Closed { reason });
    }

    pub fn route(&self, frame: Frame) {
        // one coarse lock per frame so the descriptor queues and the
        // relegator never observe a half-handled message
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let text = match frame {
            Frame::Text(text) => {
                if self.relegator.is_armed() {
                    self.relegator.fulfil(text);
                    return;
                }
                text
            }
            Frame::Binary(bytes) => {
                match pending.descriptors.pop_front() {
                    Some(descriptor) => self.dispatcher.post(UiEvent::ProjectFile {
                        placement: descriptor.placement(),
                        bytes,
                    }),
                    None => pending.payloads.push_back(bytes),
                }
                return;
            }
        };

        match parse_server_message(&text) {
            Ok(Inbound::Known(ServerMessage::File(descriptor))) => {
                match pending.payloads.pop_front() {
                    Some(bytes) => self.dispatcher.post(UiEvent::ProjectFile {
                        placement: descriptor.placement(),
                        bytes,
                    }),
                    None => pending.descriptors.push_back(descriptor),
                }
            }
            Ok(Inbound::Known(message)) => {
                tracing::debug!(kind = message.kind(), "control message");
                self.dispatcher.post(UiEvent::Message(message));
            }
            Ok(Inbound::Unknown(kind)) => self.dispatcher.post(UiEvent::UnknownMessage(kind)),
            Err(err) => {
                tracing::warn!("malformed frame from server: {err}");
                self.dispatcher.post(UiEvent::Malformed(err.to_string()));
            }
        }
    }

    pub fn queued_descriptors(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .descriptors
            .len()
    }

    pub fn queued_payloads(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .payloads
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use aihub_contracts::protocol::FileAction;

    use super::*;
    use crate::dispatch::{ui_channel, UiEvent};

    fn file_frame(name: &str) -> Frame {
        Frame::Text(format!(
            r#"{{"type":"FILE","action":{{"action":"NEW_IMAGE","file_name":"{name}","file_action":"APPEND"}}}}"#
        ))
    }

    #[test]
    fn armed_relegator_takes_text_even_if_it_looks_like_control() {
        let relegator = Arc::new(Relegator::new());
        let (dispatcher, queue) = ui_channel();
        let router = Router::new(Arc::clone(&relegator), dispatcher);

        relegator.arm();
        router.route(Frame::Text(r#"{"type":"STATUS","message":"hi"}"#.to_string()));
        assert_eq!(
            relegator.take_response().as_deref(),
            Some(r#"{"type":"STATUS","message":"hi"}"#)
        );
        assert!(queue.drain().is_empty());

        router.route(Frame::Text(r#"{"type":"STATUS","message":"hi"}"#.to_string()));
        assert!(matches!(
            queue.drain().as_slice(),
            [UiEvent::Message(ServerMessage::Status { .. })]
        ));
    }

    #[test]
    fn descriptors_and_payloads_pair_in_fifo_order() {
        let (dispatcher, queue) = ui_channel();
        let router = Router::new(Arc::new(Relegator::new()), dispatcher);

        router.route(file_frame("a.png"));
        router.route(file_frame("b.png"));
        assert_eq!(router.queued_descriptors(), 2);
        router.route(Frame::Binary(b"first".to_vec()));
        router.route(Frame::Binary(b"second".to_vec()));

        let names: Vec<(String, Vec<u8>)> = queue
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                UiEvent::ProjectFile { placement, bytes } => {
                    assert_eq!(placement.file_action(), FileAction::Append);
                    Some((placement.file_name().to_string(), bytes))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.png".to_string(), b"first".to_vec()),
                ("b.png".to_string(), b"second".to_vec())
            ]
        );
    }

    #[test]
    fn early_binary_waits_for_its_descriptor() {
        let (dispatcher, queue) = ui_channel();
        let router = Router::new(Arc::new(Relegator::new()), dispatcher);

        router.route(Frame::Binary(b"payload".to_vec()));
        assert_eq!(router.queued_payloads(), 1);
        assert!(queue.drain().is_empty());

        router.route(file_frame("late.png"));
        assert_eq!(router.queued_payloads(), 0);
        assert!(matches!(
            queue.drain().as_slice(),
            [UiEvent::ProjectFile { bytes, .. }] if bytes == b"payload"
        ));
    }

    #[test]
    fn unknown_and_malformed_text_are_reported() {
        let (dispatcher, queue) = ui_channel();
        let router = Router::new(Arc::new(Relegator::new()), dispatcher);
        router.route(Frame::Text(r#"{"type":"PING"}"#.to_string()));
        router.route(Frame::Text("not json".to_string()));
        let events = queue.drain();
        assert!(matches!(&events[0], UiEvent::UnknownMessage(kind) if kind == "PING"));
        assert!(matches!(&events[1], UiEvent::Malformed(_)));
    }
}
