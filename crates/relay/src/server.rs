use anyhow::{Context, Result};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

type ConnId = String;
type Outbox = mpsc::UnboundedSender<Message>;

/// Room name to the sockets currently joined to it
#[derive(Debug, Clone, Default)]
pub struct RoomDirectory {
    rooms: Arc<RwLock<HashMap<String, HashMap<ConnId, Outbox>>>>,
}

impl RoomDirectory {
    /// Number of sockets joined to `room`
    pub async fn members(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn join(&self, room: &str, conn_id: &str, outbox: Outbox) {
        self.rooms
            .write()
            .await
            .entry(room.to_string())
            .or_default()
            .insert(conn_id.to_string(), outbox);
    }

    async fn leave(&self, room: &str, conn_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Send `text` to every member of `room` except the sender
    async fn forward(&self, room: &str, from: &str, text: &str) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, outbox) in members {
            if conn_id != from && outbox.send(Message::Text(text.to_string().into())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// The fields the relay routes on
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    room: Option<String>,
    id: Option<String>,
}

struct Membership {
    room: String,
    id: Option<String>,
}

/// Development relay: fans each frame out to the sender's room
pub struct RelayServer {
    listener: TcpListener,
    directory: RoomDirectory,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay on {}", addr))?;
        Ok(Self {
            listener,
            directory: RoomDirectory::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn directory(&self) -> RoomDirectory {
        self.directory.clone()
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Relay listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let directory = self.directory.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, directory).await {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, directory: RoomDirectory) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;

    tracing::info!("WebSocket connection established from {}", addr);

    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<Message>();
    let mut membership: Option<Membership> = None;

    loop {
        tokio::select! {
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(msg)) => {
                        if msg.is_text() {
                            let text = msg.to_text()?;
                            route(&directory, &conn_id, &outbox, &mut membership, text).await;
                        } else if msg.is_close() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }

            Some(frame) = inbox.recv() => {
                if let Err(e) = ws_sender.send(frame).await {
                    tracing::warn!("Send to {} failed: {}", addr, e);
                    break;
                }
            }
        }
    }

    if let Some(member) = membership.take() {
        directory.leave(&member.room, &conn_id).await;
        if let Some(id) = member.id {
            let leave = serde_json::json!({ "type": "leave", "room": member.room, "id": id });
            directory.forward(&member.room, &conn_id, &leave.to_string()).await;
            tracing::debug!("Synthesized leave for {} in {}", id, member.room);
        }
    }

    tracing::info!("Connection from {} closed", addr);
    Ok(())
}

async fn route(
    directory: &RoomDirectory,
    conn_id: &str,
    outbox: &Outbox,
    membership: &mut Option<Membership>,
    text: &str,
) {
    let envelope = match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!("Dropping unroutable frame: {}", e);
            return;
        }
    };

    match envelope.kind.as_str() {
        "join" => {
            let Some(room) = envelope.room else {
                tracing::debug!("Dropping join without room");
                return;
            };
            if let Some(previous) = membership.take() {
                directory.leave(&previous.room, conn_id).await;
            }
            directory.join(&room, conn_id, outbox.clone()).await;
            directory.forward(&room, conn_id, text).await;
            tracing::info!("{} joined {}", envelope.id.as_deref().unwrap_or(conn_id), room);
            *membership = Some(Membership {
                room,
                id: envelope.id,
            });
        }
        "leave" => {
            if let Some(member) = membership.take() {
                directory.forward(&member.room, conn_id, text).await;
                directory.leave(&member.room, conn_id).await;
                tracing::info!("{} left {}", member.id.as_deref().unwrap_or(conn_id), member.room);
            }
        }
        _ => match membership {
            Some(member) => {
                directory.forward(&member.room, conn_id, text).await;
            }
            None => tracing::debug!("Dropping {} frame from socket outside any room", envelope.kind),
        },
    }
}
