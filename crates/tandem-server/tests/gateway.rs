//! End-to-end tests against an in-process server.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::message::EXTENSION_DOCUMENT_DELETED;
use tandem_protocol::{codec, AwarenessEntry, AwarenessUpdate, Message, SyncMessage};
use tandem_server::config::{Config, DocumentEntry, TokenEntry};
use tandem_server::{serve, AppState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.auth.tokens = vec![
        TokenEntry::new("t-alice", "alice"),
        TokenEntry::new("t-bob", "bob"),
        TokenEntry::new("t-mallory", "mallory"),
    ];
    config.documents.entries.push(DocumentEntry {
        id: "abc".into(),
        aliases: vec!["welcome".into()],
        readers: vec!["alice".into(), "bob".into()],
        public: false,
    });
    config
}

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    stop: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        tokio::spawn(serve(listener, Arc::clone(&state), async move {
            let _ = stopped.await;
        }));

        Self {
            addr,
            state,
            stop: Some(stop),
        }
    }

    async fn connect(&self, query: &str) -> Client {
        let url = format!("ws://{}/ws?{}", self.addr, query);
        let (client, _) = connect_async(url).await.expect("connect");
        client
    }

    async fn join(&self, token: &str) -> Client {
        self.connect(&format!("noteId=abc&token={}", token)).await
    }
}

async fn send(client: &mut Client, message: &Message) {
    let frame = codec::encode(message).unwrap();
    client.send(WsMessage::Binary(frame.to_vec())).await.unwrap();
}

/// Next protocol frame, skipping control messages.
async fn recv(client: &mut Client) -> Message {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            WsMessage::Binary(data) => return codec::decode(&data).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected message {:?}", other),
        }
    }
}

/// Close code of the next close frame, skipping everything else.
async fn recv_close(client: &mut Client) -> u16 {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

async fn assert_silent(client: &mut Client) {
    match timeout(Duration::from_millis(300), client.next()).await {
        Err(_) => {}
        Ok(msg) => panic!("expected no frame, got {:?}", msg),
    }
}

async fn handshake(client: &mut Client, local: &Doc) {
    let sv = {
        use yrs::updates::encoder::Encode;
        local.transact().state_vector().encode_v1()
    };
    send(client, &Message::query_state_vector(sv)).await;
    match recv(client).await {
        Message::Sync(SyncMessage::StateVectorReply(update)) => apply(local, &update),
        other => panic!("expected step 2, got {:?}", other),
    }
}

fn apply(doc: &Doc, update: &[u8]) {
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
}

fn edit(doc: &Doc, index: u32, chunk: &str) -> Vec<u8> {
    let text = doc.get_or_insert_text("content");
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, index, chunk);
    }
    doc.transact().encode_diff_v1(&before)
}

fn content(doc: &Doc) -> String {
    let text = doc.get_or_insert_text("content");
    let txn = doc.transact();
    text.get_string(&txn)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Upgrade a bare TCP stream. Unlike a tungstenite client it never answers
/// pings. Returns the stream and any frame bytes read past the handshake.
async fn raw_join(addr: SocketAddr, token: &str) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /ws?noteId=abc&token={} HTTP/1.1\r\nHost: localhost\r\n\
         Upgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        token
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    loop {
        let mut chunk = [0u8; 1024];
        let n = timeout(WAIT, stream.read(&mut chunk)).await.unwrap().unwrap();
        assert!(n > 0, "connection closed during upgrade");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            assert!(buf.starts_with(b"HTTP/1.1 101"));
            let frames = buf.split_off(end + 4);
            return (stream, frames);
        }
    }
}

/// Read unmasked server frames until a close frame and return its code.
async fn raw_close_code(stream: &mut TcpStream, mut buf: Vec<u8>) -> u16 {
    loop {
        while buf.len() >= 2 {
            let opcode = buf[0] & 0x0f;
            let (len, header) = match buf[1] & 0x7f {
                126 if buf.len() >= 4 => (usize::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
                126 => break,
                len => (usize::from(len), 2),
            };
            if buf.len() < header + len {
                break;
            }
            if opcode == 0x8 {
                return u16::from_be_bytes([buf[header], buf[header + 1]]);
            }
            buf.drain(..header + len);
        }

        let mut chunk = [0u8; 1024];
        let n = timeout(WAIT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert!(n > 0, "stream ended before a close frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Update inserting `text` into the "content" text as client 5, written by
/// hand so the string bytes can be anything.
fn raw_text_update(text: &[u8]) -> Vec<u8> {
    let mut update = vec![1, 1, 5, 0, 4, 1, 7];
    update.extend_from_slice(b"content");
    update.push(text.len() as u8);
    update.extend_from_slice(text);
    update.push(0);
    update
}

#[tokio::test]
async fn test_admission_gating() {
    let server = TestServer::start(test_config()).await;

    let mut missing_doc = server.connect("token=t-alice").await;
    assert_eq!(recv_close(&mut missing_doc).await, 4400);

    let mut no_token = server.connect("noteId=abc").await;
    assert_eq!(recv_close(&mut no_token).await, 4401);

    let mut bad_token = server.connect("noteId=abc&token=nope").await;
    assert_eq!(recv_close(&mut bad_token).await, 4401);

    let mut forbidden = server.join("t-mallory").await;
    assert_eq!(recv_close(&mut forbidden).await, 4403);

    let mut not_found = server.connect("noteId=nope&token=t-alice").await;
    assert_eq!(recv_close(&mut not_found).await, 4404);

    // Nothing was registered with a hub.
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn test_rejection_leaves_live_hub_untouched() {
    let server = TestServer::start(test_config()).await;
    let mut alice = server.join("t-alice").await;
    handshake(&mut alice, &Doc::new()).await;

    let mut forbidden = server.join("t-mallory").await;
    assert_eq!(recv_close(&mut forbidden).await, 4403);

    let mut bad_token = server.join("nope").await;
    assert_eq!(recv_close(&mut bad_token).await, 4401);

    let mut no_token = server.connect("noteId=abc").await;
    assert_eq!(recv_close(&mut no_token).await, 4401);

    let hub = server.state.registry.get("abc").unwrap();
    assert_eq!(hub.connection_count(), 1);
    assert_eq!(server.state.registry.stats().connections, 1);
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_bearer_header_and_alias() {
    let server = TestServer::start(test_config()).await;

    let url = format!("ws://{}/ws?noteId=welcome", server.addr);
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer t-alice".parse().unwrap());
    let (mut client, _) = connect_async(request).await.unwrap();

    handshake(&mut client, &Doc::new()).await;
    assert!(server.state.registry.contains("abc"));
}

#[tokio::test]
async fn test_sync_scenario() {
    let server = TestServer::start(test_config()).await;

    // A joins, catches up on an empty document, then types "Hello".
    let mut a = server.join("t-alice").await;
    let doc_a = Doc::new();
    handshake(&mut a, &doc_a).await;
    assert_eq!(content(&doc_a), "");
    send(&mut a, &Message::update(edit(&doc_a, 0, "Hello"))).await;
    // Frames of one connection are processed in order, so once this reply
    // arrives the update has been merged.
    handshake(&mut a, &doc_a).await;

    // B joins and receives "Hello" through the handshake.
    let mut b = server.join("t-bob").await;
    let doc_b = Doc::new();
    handshake(&mut b, &doc_b).await;
    assert_eq!(content(&doc_b), "Hello");
    assert_eq!(server.state.registry.stats().connections, 2);

    // B's edit reaches A, and is not echoed back to B.
    send(&mut b, &Message::update(edit(&doc_b, 5, " world"))).await;
    match recv(&mut a).await {
        Message::Sync(SyncMessage::Update(update)) => apply(&doc_a, &update),
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(content(&doc_a), "Hello world");
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;

    a.send(WsMessage::Binary(vec![0x02, 0x00])).await.unwrap();
    a.send(WsMessage::Binary(vec![0x00, 0x02, 0x09, 0x01])).await.unwrap();
    a.send(WsMessage::Text("hello".into())).await.unwrap();

    // The connection survives and keeps working.
    handshake(&mut a, &Doc::new()).await;
}

#[tokio::test]
async fn test_invalid_update_does_not_affect_peers() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;
    let mut b = server.join("t-bob").await;
    let doc_b = Doc::new();
    handshake(&mut b, &doc_b).await;

    // Two bytes of the inserted text are not UTF-8.
    let mut text = b"Hello world, this is a longer update".to_vec();
    text[0] = 0xf5;
    text[31] = 0xec;
    let update = raw_text_update(&text);
    send(&mut a, &Message::update(update.clone())).await;
    send(&mut a, &Message::state_vector_reply(update)).await;

    // Nothing was merged or relayed, and the sender is still attached.
    let doc_a = Doc::new();
    handshake(&mut a, &doc_a).await;
    assert_eq!(content(&doc_a), "");
    assert_silent(&mut b).await;

    send(&mut b, &Message::update(edit(&doc_b, 0, "still here"))).await;
    match recv(&mut a).await {
        Message::Sync(SyncMessage::Update(update)) => apply(&doc_a, &update),
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(content(&doc_a), "still here");
    assert_eq!(server.state.registry.stats().connections, 2);
}

#[tokio::test]
async fn test_heartbeat_timeout_close_code() {
    let mut config = test_config();
    config.heartbeat.interval_ms = 50;
    config.heartbeat.timeout_ms = 200;
    let server = TestServer::start(config).await;

    let (mut silent, pending) = raw_join(server.addr, "t-alice").await;
    assert_eq!(raw_close_code(&mut silent, pending).await, 4504);
    wait_until(|| server.state.registry.is_empty()).await;
}

#[tokio::test]
async fn test_awareness_cleanup_on_disconnect() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;
    let mut b = server.join("t-bob").await;
    wait_until(|| server.state.registry.stats().connections == 2).await;

    let presence = AwarenessUpdate::new(vec![AwarenessEntry::new(
        42,
        1,
        json!({"user": {"name": "alice"}, "cursor": null}),
    )]);
    send(&mut a, &Message::awareness_from(&presence)).await;

    match recv(&mut b).await {
        Message::Awareness(encoded) => {
            assert_eq!(AwarenessUpdate::decode(&encoded).unwrap(), presence);
        }
        other => panic!("expected awareness, got {:?}", other),
    }

    a.close(None).await.unwrap();

    match recv(&mut b).await {
        Message::Awareness(encoded) => {
            let update = AwarenessUpdate::decode(&encoded).unwrap();
            assert_eq!(update.entries, vec![AwarenessEntry::removed(42, 1)]);
        }
        other => panic!("expected awareness removal, got {:?}", other),
    }

    send(&mut b, &Message::QueryAwareness).await;
    match recv(&mut b).await {
        Message::Awareness(encoded) => {
            assert!(AwarenessUpdate::decode(&encoded).unwrap().is_empty());
        }
        other => panic!("expected awareness, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hub_released_after_last_disconnect() {
    let server = TestServer::start(test_config()).await;

    let mut a = server.join("t-alice").await;
    let doc_a = Doc::new();
    handshake(&mut a, &doc_a).await;
    send(&mut a, &Message::update(edit(&doc_a, 0, "draft"))).await;
    handshake(&mut a, &doc_a).await;
    assert_ne!(
        server.state.registry.get("abc").unwrap().encode_state(),
        tandem_core::DocumentReplica::new().encode_state()
    );
    a.close(None).await.unwrap();
    wait_until(|| server.state.registry.is_empty()).await;

    // The next session starts from a fresh, empty replica.
    let mut b = server.join("t-bob").await;
    let doc_b = Doc::new();
    handshake(&mut b, &doc_b).await;
    assert_eq!(content(&doc_b), "");
}

#[tokio::test]
async fn test_document_deleted() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;
    handshake(&mut a, &Doc::new()).await;

    assert_eq!(server.state.registry.document_deleted("abc"), 1);

    match recv(&mut a).await {
        Message::Extension { tag, payload } => {
            assert_eq!(tag, EXTENSION_DOCUMENT_DELETED);
            assert_eq!(&payload[..], b"abc");
        }
        other => panic!("expected deletion notice, got {:?}", other),
    }
    assert_eq!(recv_close(&mut a).await, 4410);
    wait_until(|| server.state.registry.is_empty()).await;
}

#[tokio::test]
async fn test_disconnect_user() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;
    let mut b = server.join("t-bob").await;
    wait_until(|| server.state.registry.stats().connections == 2).await;

    assert_eq!(server.state.registry.disconnect_user("abc", "bob"), 1);
    assert_eq!(recv_close(&mut b).await, 4408);
    wait_until(|| server.state.registry.stats().connections == 1).await;

    handshake(&mut a, &Doc::new()).await;
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;
    handshake(&mut a, &Doc::new()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = &response[response.find("\r\n\r\n").unwrap() + 4..];
    let health: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["documents"], 1);
    assert_eq!(health["connections"], 1);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let mut server = TestServer::start(test_config()).await;
    let mut a = server.join("t-alice").await;
    handshake(&mut a, &Doc::new()).await;

    if let Some(stop) = server.stop.take() {
        stop.send(()).unwrap();
    }

    assert_eq!(recv_close(&mut a).await, 1001);
    wait_until(|| server.state.registry.is_empty()).await;
    assert!(server.state.registry.is_shutting_down());
}
