// Transport Interface
//
// A transport opens message-oriented duplex sessions. Opening returns a
// session handle immediately; establishment, inbound frames, errors and
// closure are reported asynchronously as `SessionEvent`s tagged with the
// generation number the caller assigned to the session.

use futures_util::{sink::SinkExt, stream::StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Monotonic session counter assigned by the connection manager
pub type Generation = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Established,
    Message(String),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub generation: Generation,
    pub event: TransportEvent,
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("session closed")]
    Closed,
}

pub trait Transport: Send {
    /// Start opening a session. Must not block.
    fn open(
        &self,
        endpoint: &str,
        generation: Generation,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

pub trait TransportSession: Send {
    /// Queue a text frame. Must not block.
    fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the session. Safe to call repeatedly.
    fn close(&mut self);
}

// ============================================================================
// WebSocket transport
// ============================================================================

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// tokio-tungstenite client transport
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    fn open(
        &self,
        endpoint: &str,
        generation: Generation,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(TransportError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "expected ws:// or wss://".to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_websocket(endpoint.to_string(), generation, events, out_rx));

        Ok(Box::new(WebSocketSession {
            outgoing: out_tx,
            closed: false,
        }))
    }
}

async fn run_websocket(
    endpoint: String,
    generation: Generation,
    events: EventSender,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(SessionEvent { generation, event });
    };

    let ws_stream = tokio::select! {
        result = tokio_tungstenite::connect_async(endpoint.as_str()) => match result {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                tracing::error!("WebSocket connect to {} failed: {}", endpoint, e);
                emit(TransportEvent::Error(e.to_string()));
                return;
            }
        },
        // Nothing is sent before establishment, so anything here is a close
        _ = outgoing.recv() => {
            tracing::debug!("Session {} closed before it was established", generation);
            return;
        }
    };

    tracing::info!("WebSocket connection established to {}", endpoint);
    emit(TransportEvent::Established);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::error!("WebSocket send failed: {}", e);
                        emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws_sender.close().await;
                    emit(TransportEvent::Closed);
                    break;
                }
            },

            msg_result = ws_receiver.next() => match msg_result {
                Some(Ok(msg)) => {
                    if msg.is_text() {
                        match msg.to_text() {
                            Ok(text) => emit(TransportEvent::Message(text.to_string())),
                            Err(e) => tracing::warn!("Dropping non-UTF-8 text frame: {}", e),
                        }
                    } else if msg.is_close() {
                        emit(TransportEvent::Closed);
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    emit(TransportEvent::Closed);
                    break;
                }
            }
        }
    }

    tracing::debug!("Session {} finished", generation);
}

struct WebSocketSession {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: bool,
}

impl TransportSession for WebSocketSession {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

/// Record of one session opened through a [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub endpoint: String,
    pub generation: Generation,
    pub sent: Vec<String>,
    pub closed: bool,
    events: EventSender,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: Vec<OpenedSession>,
    fail_next_open: Option<TransportError>,
}

/// Loopback transport that records outgoing frames and lets the caller
/// inject session events. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `open` fail synchronously
    pub fn fail_next_open(&self, error: TransportError) {
        self.lock().fail_next_open = Some(error);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn session(&self, index: usize) -> Option<OpenedSession> {
        self.lock().sessions.get(index).cloned()
    }

    /// Frames sent on the given session
    pub fn sent(&self, index: usize) -> Vec<String> {
        self.session(index).map(|s| s.sent).unwrap_or_default()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.session(index).is_some_and(|s| s.closed)
    }

    /// Deliver an event as if it came from the given session
    pub fn emit(&self, index: usize, event: TransportEvent) -> bool {
        let state = self.lock();
        match state.sessions.get(index) {
            Some(session) => session
                .events
                .send(SessionEvent {
                    generation: session.generation,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        endpoint: &str,
        generation: Generation,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut state = self.lock();
        if let Some(error) = state.fail_next_open.take() {
            return Err(error);
        }
        state.sessions.push(OpenedSession {
            endpoint: endpoint.to_string(),
            generation,
            sent: Vec::new(),
            closed: false,
            events,
        });
        Ok(Box::new(MemorySession {
            transport: self.clone(),
            index: state.sessions.len() - 1,
        }))
    }
}

struct MemorySession {
    transport: MemoryTransport,
    index: usize,
}

impl TransportSession for MemorySession {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut state = self.transport.lock();
        let session = &mut state.sessions[self.index];
        if session.closed {
            return Err(TransportError::Closed);
        }
        session.sent.push(text);
        Ok(())
    }

    fn close(&mut self) {
        self.transport.lock().sessions[self.index].closed = true;
    }
}
