// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{
    AckRegistry, Heartbeat, HeartbeatConfig, NonceBucket, Transport, TransportConfig,
    TransportError,
};
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::any,
};
use futures::{SinkExt, StreamExt};
use ingest_common::domain::{
    Action, Envelope, OutboxStreamAckPayload, PingPayload, QueryBus, now_millis,
};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::sleep};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    #[serde(default = "host_default")]
    pub host: IpAddr,

    #[serde(default = "port_default")]
    pub port: u16,

    #[serde(default = "path_default")]
    pub path: String,

    /// Shared token; when set, pongs must carry an HMAC proof over the ping's nonce challenge.
    #[serde(default)]
    pub token: Option<SecretString>,

    #[serde(rename = "heartbeat", default)]
    pub heartbeat: HeartbeatConfig,
}

fn host_default() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn port_default() -> u16 {
    3_001
}

fn path_default() -> String {
    "/consumer".to_string()
}

/// WebSocket transport with exactly one logical client: new connections stay candidates until
/// they produce a valid pong, which promotes them to the bound consumer. Only the bound client's
/// query frames are processed.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: WsConfig,
    max_message_bytes: u64,
    heartbeat: Heartbeat,
    acks: AckRegistry,
    query_bus: QueryBus,
    bound: RwLock<Option<BoundClient>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
struct BoundClient {
    sid: String,
    tx: mpsc::Sender<String>,
}

impl WsTransport {
    pub fn new(
        config: WsConfig,
        transport_config: &TransportConfig,
        query_bus: QueryBus,
        acks: AckRegistry,
    ) -> Self {
        let heartbeat = Heartbeat::new(config.heartbeat.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                max_message_bytes: transport_config.max_message_bytes,
                heartbeat,
                acks,
                query_bus,
                bound: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn serve(&self) -> Result<SocketAddr, TransportError> {
        let app = Router::new()
            .route(&self.inner.config.path, any(ws_handler))
            .with_state(self.clone());

        let addr = SocketAddr::new(self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|error| TransportError::Io(error.into()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| TransportError::Io(error.into()))?;

        let server = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                error!(error:%; "WebSocket transport server failed");
            }
        });
        self.inner.tasks.lock().push(server);

        debug!(addr:% = local_addr, path = self.inner.config.path; "WebSocket transport serving");
        Ok(local_addr)
    }

    fn token(&self) -> Option<&str> {
        self.inner
            .config
            .token
            .as_ref()
            .map(|token| token.expose_secret())
    }

    fn is_bound(&self, sid: &str) -> bool {
        self.inner
            .bound
            .read()
            .as_ref()
            .is_some_and(|client| client.sid == sid)
    }

    /// Promote a candidate after its first valid pong; an existing live binding stays in place.
    fn bind_candidate(&self, sid: &str, tx: &mpsc::Sender<String>) {
        let mut bound = self.inner.bound.write();

        match bound.as_ref() {
            Some(client) if client.sid == sid => {}

            Some(client) if !client.tx.is_closed() => {
                debug!(sid; "pong from unbound candidate while a consumer is bound");
            }

            _ => {
                info!(sid; "stream consumer bound");
                *bound = Some(BoundClient {
                    sid: sid.to_string(),
                    tx: tx.clone(),
                });
            }
        }
    }

    fn unbind(&self, sid: &str) {
        let mut bound = self.inner.bound.write();
        if bound.as_ref().is_some_and(|client| client.sid == sid) {
            *bound = None;
            self.inner.heartbeat.mark_offline();
            info!(sid; "stream consumer unbound");
        }
    }

    async fn handle_socket(self, socket: WebSocket) {
        let sid = Uuid::now_v7().to_string();
        debug!(sid; "candidate connected");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let challenges = Arc::new(NonceBucket::new());

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let pinger = tokio::spawn(
            self.clone()
                .ping_loop(sid.clone(), out_tx.clone(), challenges.clone()),
        );

        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    self.handle_frame(&sid, &out_tx, &challenges, text.as_str())
                        .await;
                }

                Ok(Message::Close(_)) | Err(_) => break,

                _ => {}
            }
        }

        writer.abort();
        pinger.abort();
        self.unbind(&sid);
        debug!(sid; "socket closed");
    }

    /// Ping with an exponentially backed-off schedule; with a token configured each ping carries
    /// a single-use nonce challenge.
    async fn ping_loop(
        self,
        sid: String,
        out_tx: mpsc::Sender<String>,
        challenges: Arc<NonceBucket>,
    ) {
        loop {
            let ts = now_millis();
            let mut payload = PingPayload {
                ts,
                nonce: None,
                sid: Some(sid.clone()),
            };

            let envelope = Envelope::request(Action::Ping, &payload).expect("ping serializes");
            let envelope = if self.token().is_some() {
                let correlation_id = envelope
                    .correlation_id
                    .expect("request envelopes carry a correlation id");
                payload.nonce = Some(challenges.issue(correlation_id, ts));

                Envelope {
                    payload: Some(serde_json::to_value(&payload).expect("ping serializes")),
                    ..envelope
                }
            } else {
                envelope
            };

            let text = serde_json::to_string(&envelope).expect("envelope serializes");
            if out_tx.send(text).await.is_err() {
                return;
            }

            sleep(self.inner.heartbeat.next_interval()).await;
        }
    }

    async fn handle_frame(
        &self,
        sid: &str,
        out_tx: &mpsc::Sender<String>,
        challenges: &NonceBucket,
        text: &str,
    ) {
        let envelope = match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(sid, error:%; "malformed frame dropped");
                return;
            }
        };

        match envelope.action {
            Action::Pong => {
                if self
                    .inner
                    .heartbeat
                    .accept_pong(&envelope, self.token(), challenges, Some(sid))
                {
                    self.bind_candidate(sid, out_tx);
                } else {
                    // Invalid proof or password: the pong is dropped, liveness untouched.
                    warn!(sid; "invalid pong dropped");
                }
            }

            Action::QueryRequest => {
                if !self.is_bound(sid) {
                    debug!(sid; "query from unbound candidate ignored");
                    return;
                }

                let response = self.inner.query_bus.execute_envelope(&envelope).await;
                let text = serde_json::to_string(&response).expect("envelope serializes");
                let _ = out_tx.send(text).await;
            }

            Action::OutboxStreamAck => {
                if !self.is_bound(sid) {
                    debug!(sid; "ACK from unbound candidate ignored");
                    return;
                }

                match (envelope.correlation_id, envelope.payload_as()) {
                    (Some(correlation_id), Ok(payload)) => {
                        self.inner.acks.resolve(&correlation_id, payload);
                    }

                    _ => warn!(sid; "malformed ACK dropped"),
                }
            }

            Action::RegisterStreamConsumer => {
                debug!(sid; "stream consumer candidate registered");
            }

            action => debug!(sid, action:?; "unexpected frame ignored"),
        }
    }
}

impl Transport for WsTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(envelope).map_err(|error| TransportError::Io(error.into()))?;
        if text.len() as u64 > self.inner.max_message_bytes {
            return Err(TransportError::OversizedMessage {
                size: text.len() as u64,
                max_bytes: self.inner.max_message_bytes,
            });
        }

        let client = self
            .inner
            .bound
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        client
            .tx
            .send(text)
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    fn is_online(&self) -> bool {
        self.inner.heartbeat.is_online()
    }

    async fn wait_for_online(&self, deadline: std::time::Duration) -> Result<(), TransportError> {
        self.inner.heartbeat.wait_for_online(deadline).await
    }

    async fn destroy(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        *self.inner.bound.write() = None;
        self.inner.acks.reject_all();
        self.inner.heartbeat.mark_offline();
    }
}

async fn ws_handler(State(transport): State<WsTransport>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| transport.handle_socket(socket))
}

#[cfg(test)]
mod tests {
    use super::{WsConfig, WsTransport};
    use crate::domain::{AckRegistry, HeartbeatConfig, Transport, TransportConfig, compute_proof};
    use futures::{SinkExt, StreamExt};
    use ingest_common::domain::{
        Action, Envelope, OutboxStreamAckPayload, PingPayload, PongPayload, QueryBus,
        QueryResponsePayload,
    };
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    fn config(token: Option<&str>) -> WsConfig {
        WsConfig {
            host: "127.0.0.1".parse().expect("valid address"),
            port: 0,
            path: "/consumer".to_string(),
            token: token.map(|token| token.to_string().into()),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(50),
                ..HeartbeatConfig::default()
            },
        }
    }

    async fn next_envelope<S>(ws: &mut S) -> Envelope
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame within deadline")
                .expect("stream open")
                .expect("frame readable");

            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).expect("frame is an envelope");
            }
        }
    }

    #[tokio::test]
    async fn test_pong_binds_consumer_and_acks_resolve() {
        let acks = AckRegistry::new();
        let query_bus = QueryBus::new();
        query_bus.register("Echo", |dto| async move { Ok(dto) });

        let transport = WsTransport::new(
            config(Some("secret")),
            &TransportConfig::default(),
            query_bus,
            acks.clone(),
        );
        let addr = transport.serve().await.expect("server binds");

        let (mut ws, _) = connect_async(format!("ws://{addr}/consumer"))
            .await
            .expect("client connects");

        // Candidate: a ping with a nonce challenge arrives, the proof-carrying pong binds us.
        let ping = next_envelope(&mut ws).await;
        assert_eq!(ping.action, Action::Ping);
        let challenge = ping.payload_as::<PingPayload>().expect("ping payload");
        let nonce = challenge.nonce.expect("nonce challenge present");
        let sid = challenge.sid.expect("sid present");

        let pong = Envelope::response_to(
            &ping,
            Action::Pong,
            &PongPayload {
                password: None,
                proof: Some(compute_proof("secret", &nonce, challenge.ts, Some(&sid))),
            },
        )
        .expect("pong can be built");
        ws.send(Message::text(serde_json::to_string(&pong).expect("pong serializes")))
            .await
            .expect("pong sent");

        transport
            .wait_for_online(Duration::from_secs(5))
            .await
            .expect("consumer comes online");

        // Bound client queries are bridged to the query bus.
        let query = Envelope::request(
            Action::QueryRequest,
            &serde_json::json!({ "name": "Echo", "dto": { "x": 1 } }),
        )
        .expect("query can be built");
        ws.send(Message::text(
            serde_json::to_string(&query).expect("query serializes"),
        ))
        .await
        .expect("query sent");

        let response = loop {
            let envelope = next_envelope(&mut ws).await;
            if envelope.action == Action::QueryResponse {
                break envelope;
            }
        };
        assert_eq!(response.correlation_id, query.correlation_id);
        let payload = response
            .payload_as::<QueryResponsePayload>()
            .expect("response payload");
        assert_eq!(payload.data, Some(serde_json::json!({ "x": 1 })));

        // An outbox batch flows out; the client's ACK resolves the registry.
        let batch = Envelope::request(Action::OutboxStreamBatch, &serde_json::json!({"events": []}))
            .expect("batch can be built");
        let correlation_id = batch.correlation_id.expect("correlation id");
        let waiter = acks.register(correlation_id);
        transport.send(&batch).await.expect("batch sent");

        let received = loop {
            let envelope = next_envelope(&mut ws).await;
            if envelope.action == Action::OutboxStreamBatch {
                break envelope;
            }
        };
        let ack = Envelope::response_to(
            &received,
            Action::OutboxStreamAck,
            &OutboxStreamAckPayload {
                all_ok: true,
                ok_indices: None,
            },
        )
        .expect("ack can be built");
        ws.send(Message::text(serde_json::to_string(&ack).expect("ack serializes")))
            .await
            .expect("ack sent");

        let payload = waiter
            .wait(Duration::from_secs(5))
            .await
            .expect("ack resolves the waiter");
        assert!(payload.all_ok);

        transport.destroy().await;
    }

    #[tokio::test]
    async fn test_invalid_proof_does_not_bind() {
        let transport = WsTransport::new(
            config(Some("secret")),
            &TransportConfig::default(),
            QueryBus::new(),
            AckRegistry::new(),
        );
        let addr = transport.serve().await.expect("server binds");

        let (mut ws, _) = connect_async(format!("ws://{addr}/consumer"))
            .await
            .expect("client connects");

        let ping = next_envelope(&mut ws).await;
        let pong = Envelope::response_to(
            &ping,
            Action::Pong,
            &PongPayload {
                password: None,
                proof: Some("deadbeef".to_string()),
            },
        )
        .expect("pong can be built");
        ws.send(Message::text(serde_json::to_string(&pong).expect("pong serializes")))
            .await
            .expect("pong sent");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!transport.is_online());

        transport.destroy().await;
    }
}
