use futures_util::{SinkExt, StreamExt};
use geopresence_relay::{RelayServer, RoomDirectory};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (String, RoomDirectory) {
    let server = tokio_test::assert_ok!(RelayServer::bind("127.0.0.1:0").await);
    let url = format!("ws://{}", server.local_addr().unwrap());
    let directory = server.directory();
    tokio::spawn(server.run());
    (url, directory)
}

async fn client(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    ws
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn wait_members(directory: &RoomDirectory, room: &str, expected: usize) {
    tokio::time::timeout(WAIT, async {
        while directory.members(room).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("room membership did not settle");
}

#[tokio::test]
async fn relay_smoke_forwards_within_room_only() {
    let (url, directory) = start_relay().await;
    let mut a = client(&url).await;
    let mut b = client(&url).await;
    let mut c = client(&url).await;

    send(&mut a, json!({"type": "join", "room": "r", "id": "a"})).await;
    wait_members(&directory, "r", 1).await;
    send(&mut b, json!({"type": "join", "room": "r", "id": "b"})).await;
    send(&mut c, json!({"type": "join", "room": "other", "id": "c"})).await;
    wait_members(&directory, "r", 2).await;
    wait_members(&directory, "other", 1).await;

    // a sees b's join
    assert_eq!(recv(&mut a).await["id"], "b");

    let location = json!({"type": "location", "room": "r", "id": "a", "lat": 1.0, "lon": 1.0, "ts": 5});
    send(&mut a, location.clone()).await;
    assert_eq!(recv(&mut b).await, location);

    send(&mut c, json!({"type": "location", "room": "other", "id": "c", "lat": 2.0, "lon": 2.0, "ts": 6})).await;
    send(&mut b, json!({"type": "location", "room": "r", "id": "b", "lat": 3.0, "lon": 3.0, "ts": 7})).await;
    let next = recv(&mut a).await;
    assert_eq!(next["id"], "b");
    assert_eq!(next["ts"], 7);
}

#[tokio::test]
async fn relay_smoke_synthesizes_leave_on_drop() {
    let (url, directory) = start_relay().await;
    let mut a = client(&url).await;
    let mut b = client(&url).await;

    send(&mut a, json!({"type": "join", "room": "r", "id": "a"})).await;
    wait_members(&directory, "r", 1).await;
    send(&mut b, json!({"type": "join", "room": "r", "id": "b"})).await;
    wait_members(&directory, "r", 2).await;
    assert_eq!(recv(&mut a).await["type"], "join");

    drop(b);
    let leave = recv(&mut a).await;
    assert_eq!(leave, json!({"type": "leave", "room": "r", "id": "b"}));
    wait_members(&directory, "r", 1).await;
}

#[tokio::test]
async fn relay_smoke_explicit_leave_unregisters() {
    let (url, directory) = start_relay().await;
    let mut a = client(&url).await;
    let mut b = client(&url).await;

    send(&mut a, json!({"type": "join", "room": "r", "id": "a"})).await;
    wait_members(&directory, "r", 1).await;
    send(&mut b, json!({"type": "join", "room": "r", "id": "b"})).await;
    wait_members(&directory, "r", 2).await;
    assert_eq!(recv(&mut a).await["type"], "join");

    send(&mut b, json!({"type": "leave", "room": "r", "id": "b"})).await;
    assert_eq!(recv(&mut a).await["type"], "leave");
    wait_members(&directory, "r", 1).await;

    // Frames from a socket outside any room go nowhere
    send(&mut b, json!({"type": "location", "room": "r", "id": "b", "lat": 0.0, "lon": 0.0, "ts": 1})).await;
    send(&mut a, json!({"type": "leave", "room": "r", "id": "a"})).await;
    wait_members(&directory, "r", 0).await;
    assert_eq!(directory.room_count().await, 0);
}

#[test]
fn relay_smoke_bind_rejects_bad_address() {
    let result = tokio_test::block_on(RelayServer::bind("not-an-address"));
    assert!(result.is_err());
}
