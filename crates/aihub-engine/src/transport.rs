//! Websocket connection to the AI Hub server.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aihub_contracts::store::HubConfig;
use anyhow::{Context, Result};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderValue, Request};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use crate::router::Router;

const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One inbound websocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Outbound half of the connection.
pub trait FrameSink: Send + Sync {
    fn send_text(&self, text: &str) -> Result<()>;
    fn send_binary(&self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed(Option<String>),
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct WsTransport {
    socket: Arc<Mutex<Socket>>,
    state: Arc<Mutex<ConnectionState>>,
    stop: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connects to `{protocol}://{host}:{port}/ws`, authenticating with the
    /// `api-key` header.
    pub fn connect(config: &HubConfig) -> Result<Self> {
        let request = build_websocket_request(config)?;
        let (mut socket, _) = websocket_connect(request).with_context(|| {
            format!("failed to connect to {}", config.websocket_url())
        })?;
        set_socket_read_timeout(&mut socket, Some(READ_POLL_INTERVAL));
        tracing::info!(server = %config.server_label(), "websocket connected");
        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
            state: Arc::new(Mutex::new(ConnectionState::Open)),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn socket(&self) -> MutexGuard<'_, Socket> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Starts the single receive loop. Frames are routed strictly in arrival
    /// order; the loop ends when the socket closes or `close` is called.
    pub fn spawn_receive_loop(&self, router: Arc<Router>) -> JoinHandle<()> {
        let transport = self.clone();
        thread::spawn(move || transport.receive_loop(&router))
    }

    fn receive_loop(&self, router: &Router) {
        router.connected();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Closed(None));
                router.closed(None);
                return;
            }
            let read = self.socket().read();
            match read {
                Ok(WsMessage::Text(text)) => router.route(Frame::Text(text.to_string())),
                Ok(WsMessage::Binary(bytes)) => router.route(Frame::Binary(bytes.to_vec())),
                Ok(WsMessage::Close(frame)) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    self.set_state(ConnectionState::Closed(reason.clone()));
                    router.closed(reason);
                    return;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    // let senders take the socket between polls
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    let reason = err.to_string();
                    tracing::warn!("websocket read failed: {reason}");
                    self.set_state(ConnectionState::Closed(Some(reason.clone())));
                    router.closed(Some(reason));
                    return;
                }
            }
        }
    }

    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.socket().close(None);
    }
}

impl FrameSink for WsTransport {
    fn send_text(&self, text: &str) -> Result<()> {
        self.socket()
            .send(WsMessage::Text(text.to_string().into()))
            .context("failed to send text frame")
    }

    fn send_binary(&self, bytes: &[u8]) -> Result<()> {
        self.socket()
            .send(WsMessage::Binary(bytes.to_vec().into()))
            .context("failed to send binary frame")
    }
}

fn build_websocket_request(config: &HubConfig) -> Result<Request<()>> {
    let mut request = config
        .websocket_url()
        .as_str()
        .into_client_request()
        .context("invalid websocket request")?;
    request.headers_mut().insert(
        "api-key",
        HeaderValue::from_str(&config.apikey).context("invalid api key header")?,
    );
    Ok(request)
}

fn set_socket_read_timeout(ws: &mut Socket, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}
