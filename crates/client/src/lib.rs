// Room Presence Client
//
// Joins a named room over a relay, broadcasts this participant's position
// and keeps a live, proximity-classified view of every other participant.

pub mod connection;
pub mod controller;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod view;

pub use connection::{ConnectionManager, ConnectionState, Dispatch};
pub use controller::{ControllerError, PresenceController, PresenceHandle, PresenceSettings};
pub use protocol::{decode, encode, DecodeError, Inbound, LocationUpdate, PresenceMessage, RoomMember};
pub use registry::{PeerRecord, PeerRegistry, PeerSighting};
pub use transport::{
    EventReceiver, EventSender, Generation, MemoryTransport, SessionEvent, Transport,
    TransportError, TransportEvent, TransportSession, WebSocketTransport,
};
pub use view::{classify, PeerView, PresenceView, SelfLocation};
