#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use max_client_sdk::types::{ClientDescriptor, Identity, NotificationParser, Uuid};
use max_client_sdk::ws::{Config, Connection, EventParser};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub const TOKEN: &str = "test-session-token";
pub const PROFILE_ID: i64 = 42;

const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

#[must_use]
pub fn identity() -> Identity {
    Identity::builder()
        .device_id(Uuid::nil())
        .token(TOKEN)
        .build()
}

/// Short deadlines so failure paths resolve quickly.
#[must_use]
pub fn config() -> Config {
    let mut config = Config::default()
        .with_request_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2));
    config.shutdown_grace = Duration::from_millis(500);
    config
}

#[must_use]
pub fn sync_payload() -> Value {
    json!({
        "chats": [
            { "id": PROFILE_ID, "type": "DIALOG" },
            { "id": -100, "type": "CHAT", "title": "Team", "owner": 7 },
            { "id": -200, "type": "CHANNEL", "title": "News" }
        ],
        "profile": {
            "contact": {
                "id": PROFILE_ID,
                "names": [{ "name": "Test Bot", "type": "ONEME" }]
            }
        }
    })
}

#[must_use]
pub fn message_push(chat_id: i64, text: &str) -> Value {
    json!({
        "chatId": chat_id,
        "message": { "id": "1001", "sender": 7, "text": text, "time": 1_700_000_000_000_i64 }
    })
}

/// In-process stand-in for the Max WebSocket API.
///
/// Every accepted socket is handed to the test as a [`MockPeer`], which scripts the
/// server side frame by frame.
pub struct MockServer {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peers_tx, peers) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let mut origin = None;
                let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    origin = request
                        .headers()
                        .get("origin")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    Ok(response)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };

                if peers_tx.send(MockPeer { ws, origin, seq: 0 }).is_err() {
                    break;
                }
            }
        });

        Self { addr, peers }
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    /// Wait for the next client socket.
    pub async fn accept(&mut self) -> MockPeer {
        timeout(WAIT, self.peers.recv()).await.unwrap().unwrap()
    }
}

/// Server side of one accepted socket.
pub struct MockPeer {
    ws: WebSocketStream<TcpStream>,
    /// `Origin` header of the upgrade request
    pub origin: Option<String>,
    /// Server-side push counter
    seq: u64,
}

impl MockPeer {
    /// Next text frame from the client, decoded.
    pub async fn recv_frame(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client closed the socket")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Next client request with `opcode`, skipping anything else (e.g. pings).
    pub async fn recv_request(&mut self, opcode: u16) -> Value {
        loop {
            let frame = self.recv_frame().await;
            if frame["opcode"] == json!(opcode) {
                return frame;
            }
        }
    }

    /// Whether the client closed the socket within a short wait.
    pub async fn closed_by_client(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    pub async fn send(&mut self, frame: &Value) {
        self.send_raw(&frame.to_string()).await;
    }

    /// Answer `request` with a successful response.
    pub async fn reply(&mut self, request: &Value, payload: Value) {
        self.reply_to(request["seq"].as_u64().unwrap(), request["opcode"].as_u64().unwrap(), payload)
            .await;
    }

    pub async fn reply_to(&mut self, seq: u64, opcode: u64, payload: Value) {
        self.send(&json!({ "ver": 11, "cmd": 1, "seq": seq, "opcode": opcode, "payload": payload }))
            .await;
    }

    /// Answer `request` with an error response.
    pub async fn reply_error(&mut self, request: &Value, error: &str) {
        self.send(&json!({
            "ver": 11,
            "cmd": 3,
            "seq": request["seq"],
            "opcode": request["opcode"],
            "payload": { "error": error, "message": "rejected by mock" }
        }))
        .await;
    }

    /// Send a server-initiated frame.
    pub async fn push(&mut self, opcode: u16, payload: Value) {
        self.seq += 1;
        let seq = self.seq;
        self.send(&json!({ "ver": 11, "cmd": 0, "seq": seq, "opcode": opcode, "payload": payload }))
            .await;
    }

    /// Acknowledge session init and answer the sync with `sync`.
    pub async fn complete_handshake_with(&mut self, sync: Value) {
        let init = self.recv_request(6).await;
        self.reply(&init, json!({ "location": "RU" })).await;

        let login = self.recv_request(19).await;
        self.reply(&login, sync).await;
    }

    pub async fn complete_handshake(&mut self) {
        self.complete_handshake_with(sync_payload()).await;
    }

    /// Drop the socket without a close frame.
    pub fn kill(self) {
        drop(self.ws);
    }
}

#[must_use]
pub fn connection(server: &MockServer, config: Config) -> Connection {
    Connection::new(&server.url(), config, NotificationParser::default()).unwrap()
}

/// Connect `connection` against `server`, playing the server side of the handshake.
pub async fn connect<E, P>(server: &mut MockServer, connection: &Connection<E, P>) -> MockPeer
where
    E: Clone + Send + Sync + 'static,
    P: EventParser<E>,
{
    let credentials = identity();
    let client = ClientDescriptor::default();
    let (connected, peer) = tokio::join!(
        connection.connect(&credentials, &client),
        async {
            let mut peer = server.accept().await;
            peer.complete_handshake().await;
            peer
        }
    );
    connected.unwrap();
    peer
}
