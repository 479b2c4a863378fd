// Presence Wire Protocol
//
// Every frame is one JSON object tagged by `type`.
//
// Protocol flow:
// 1. Client sends "join" once the connection is established
// 2. Clients broadcast "location" on every new position sample
// 3. Client sends "leave" before closing or switching rooms
//
// The relay forwards each frame to the other members of the sender's room.
// Nothing is acknowledged or retried.

use geopresence_core::{Coordinate, DomainError, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Message types this client understands
pub const KNOWN_TYPES: [&str; 3] = ["join", "location", "leave"];

/// Presence frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceMessage {
    /// Announce presence in a room
    #[serde(rename = "join")]
    Join(RoomMember),

    /// Current position of a participant
    #[serde(rename = "location")]
    Location(LocationUpdate),

    /// Announce departure from a room
    #[serde(rename = "leave")]
    Leave(RoomMember),
}

impl PresenceMessage {
    pub fn join(room: impl Into<String>, id: Identity) -> Self {
        Self::Join(RoomMember {
            room: room.into(),
            id,
        })
    }

    pub fn leave(room: impl Into<String>, id: Identity) -> Self {
        Self::Leave(RoomMember {
            room: room.into(),
            id,
        })
    }

    pub fn location(
        room: impl Into<String>,
        id: Identity,
        coordinate: Coordinate,
        ts: i64,
    ) -> Self {
        Self::Location(LocationUpdate {
            room: room.into(),
            id,
            lat: coordinate.latitude(),
            lon: coordinate.longitude(),
            ts,
        })
    }
}

/// Payload of `join` and `leave`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub room: String,
    pub id: Identity,
}

/// Payload of `location`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub room: String,
    pub id: Identity,
    pub lat: f64,
    pub lon: f64,
    /// Capture time at the sender (epoch milliseconds)
    pub ts: i64,
}

impl LocationUpdate {
    pub fn coordinate(&self) -> Result<Coordinate, DomainError> {
        Coordinate::new(self.lat, self.lon)
    }
}

/// A successfully parsed frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(PresenceMessage),
    /// Well-formed frame with a type this client does not handle
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or non-string 'type' field")]
    MissingType,
    #[error("invalid '{kind}' frame: {reason}")]
    InvalidFields { kind: String, reason: String },
    #[error("coordinate out of range: ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// Serialize a frame
pub fn encode(message: &PresenceMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Parse and validate a frame
pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    let value: JsonValue =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let kind = match &value {
        JsonValue::Object(map) => map
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(DecodeError::MissingType)?
            .to_string(),
        _ => return Err(DecodeError::NotAnObject),
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown(kind));
    }

    let message: PresenceMessage =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidFields {
            kind: kind.clone(),
            reason: e.to_string(),
        })?;

    if let PresenceMessage::Location(update) = &message {
        if update.coordinate().is_err() {
            return Err(DecodeError::InvalidCoordinate {
                lat: update.lat,
                lon: update.lon,
            });
        }
    }

    Ok(Inbound::Message(message))
}
