// Connection Management
//
// Owns at most one transport session, drives the connection state machine
// and turns inbound frames into registry operations.
//
// disconnected -> connecting -> connected -> disconnected
// connecting | connected -> error -> disconnected

use crate::protocol::{self, Inbound, LocationUpdate, PresenceMessage};
use crate::transport::{EventSender, Generation, SessionEvent, Transport, TransportError, TransportEvent, TransportSession};
use geopresence_core::{Coordinate, Identity};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Registry operation produced by an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Location(LocationUpdate),
    Leave(Identity),
}

struct ActiveSession {
    generation: Generation,
    endpoint: String,
    room: String,
    session: Box<dyn TransportSession>,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    identity: Identity,
    events: EventSender,
    state: ConnectionState,
    active: Option<ActiveSession>,
    next_generation: Generation,
    last_error: Option<String>,
    /// States entered since the last `take_transitions`
    transitions: Vec<ConnectionState>,
}

impl<T: Transport> ConnectionManager<T> {
    /// `events` must be the sender half of the channel the owner reads
    /// session events from.
    pub fn new(transport: T, identity: Identity, events: EventSender) -> Self {
        Self {
            transport,
            identity,
            events,
            state: ConnectionState::Disconnected,
            active: None,
            next_generation: 0,
            last_error: None,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Room of the active session
    pub fn room(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.room.as_str())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.endpoint.as_str())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Drain the states entered since the previous call, oldest first
    pub fn take_transitions(&mut self) -> Vec<ConnectionState> {
        std::mem::take(&mut self.transitions)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!("Connection state {} -> {}", self.state, state);
            self.state = state;
            self.transitions.push(state);
        }
    }

    /// Open a new session, tearing down the current one first.
    ///
    /// Completion is reported later through an `Established` event.
    pub fn connect(&mut self, endpoint: &str, room: &str) -> Result<(), TransportError> {
        self.teardown();

        self.next_generation += 1;
        let generation = self.next_generation;
        self.last_error = None;
        self.set_state(ConnectionState::Connecting);

        tracing::info!("Connecting to {} (room {})", endpoint, room);

        match self.transport.open(endpoint, generation, self.events.clone()) {
            Ok(session) => {
                self.active = Some(ActiveSession {
                    generation,
                    endpoint: endpoint.to_string(),
                    room: room.to_string(),
                    session,
                });
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Leave the room and close the session
    pub fn disconnect(&mut self) {
        if self.teardown() {
            tracing::info!("Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Encode and transmit while connected; silently dropped otherwise
    pub fn send(&mut self, message: &PresenceMessage) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let text = match protocol::encode(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode outgoing message: {}", e);
                return false;
            }
        };

        match active.session.send(text) {
            Ok(()) => true,
            Err(e) => {
                self.fail(e.to_string());
                false
            }
        }
    }

    /// Broadcast a position to the current room
    pub fn send_location(&mut self, coordinate: Coordinate, captured_at: i64) -> bool {
        let Some(room) = self.room().map(str::to_string) else {
            return false;
        };
        let message = PresenceMessage::location(room, self.identity.clone(), coordinate, captured_at);
        self.send(&message)
    }

    /// Apply a transport event. Events of superseded sessions are ignored.
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<Dispatch> {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(event.generation) {
            tracing::debug!("Ignoring event from stale session {}", event.generation);
            return None;
        }

        match event.event {
            TransportEvent::Established => {
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Connected);
                    if let Some(room) = self.room().map(str::to_string) {
                        let join = PresenceMessage::join(room, self.identity.clone());
                        self.send(&join);
                    }
                }
                None
            }
            TransportEvent::Message(text) => self.dispatch_inbound(&text),
            TransportEvent::Error(reason) => {
                self.fail(reason);
                None
            }
            TransportEvent::Closed => {
                self.active = None;
                self.set_state(ConnectionState::Disconnected);
                None
            }
        }
    }

    fn dispatch_inbound(&self, text: &str) -> Option<Dispatch> {
        let inbound = match protocol::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("Dropping bad message: {}", e);
                return None;
            }
        };

        match inbound {
            Inbound::Message(PresenceMessage::Location(update)) => {
                if update.id == self.identity {
                    return None;
                }
                if self.room() != Some(update.room.as_str()) {
                    tracing::debug!("Ignoring location for room {}", update.room);
                    return None;
                }
                Some(Dispatch::Location(update))
            }
            Inbound::Message(PresenceMessage::Leave(member)) => {
                if member.id == self.identity {
                    return None;
                }
                Some(Dispatch::Leave(member.id))
            }
            Inbound::Message(PresenceMessage::Join(member)) => {
                tracing::debug!("{} joined {}", member.id, member.room);
                None
            }
            Inbound::Unknown(kind) => {
                tracing::debug!("Ignoring message of type {}", kind);
                None
            }
        }
    }

    /// Error, then disconnected; the session is dropped
    fn fail(&mut self, reason: String) {
        tracing::error!("Transport error: {}", reason);
        self.last_error = Some(reason);
        self.set_state(ConnectionState::Error);
        if let Some(mut active) = self.active.take() {
            active.session.close();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Best-effort leave, then close. Returns whether a session existed.
    fn teardown(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };

        if self.state == ConnectionState::Connected {
            let leave = PresenceMessage::leave(active.room.clone(), self.identity.clone());
            match protocol::encode(&leave) {
                Ok(text) => {
                    if let Err(e) = active.session.send(text) {
                        tracing::debug!("Leave not delivered: {}", e);
                    }
                }
                Err(e) => tracing::debug!("Failed to encode leave: {}", e),
            }
        }
        active.session.close();
        true
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
