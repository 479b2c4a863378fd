// Development Relay
//
// A minimal WebSocket room relay. A `join` frame puts the socket in a room;
// every later text frame is forwarded unchanged to the other sockets in that
// room. Sockets that drop without a `leave` get one synthesized for them.

pub mod server;

pub use server::{RelayServer, RoomDirectory};
