// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{
    AckRegistry, Heartbeat, HeartbeatConfig, Transport, TransportConfig, TransportError,
};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use ingest_common::{
    domain::{
        Action, Envelope, OutboxStreamAckPayload, PingPayload, PongPayload, QueryBus, QueryError,
        QueryRequestPayload, QueryResponsePayload, now_millis,
    },
    error::StdErrorExt,
};
use log::{debug, error, warn};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, task::JoinHandle, time::sleep};
use tower_http::cors::CorsLayer;

/// Header carrying the shared transport token; receivers match it case-insensitively.
pub const TOKEN_HEADER: &str = "x-transport-token";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Outbox batches are POSTed here; the synchronous response body is the ACK.
    pub url: String,

    /// Pings are POSTed here; the synchronous response body is the pong.
    pub ping_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "host_default")]
    pub host: IpAddr,

    #[serde(default = "port_default")]
    pub port: u16,

    #[serde(default)]
    pub cors: bool,

    #[serde(default)]
    pub token: Option<SecretString>,

    #[serde(default)]
    pub webhook: Option<WebhookConfig>,

    #[serde(rename = "ping", default)]
    pub heartbeat: HeartbeatConfig,
}

fn host_default() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn port_default() -> u16 {
    3_000
}

/// HTTP transport: serves `POST /query` bridging to the local query bus, delivers outbox batches
/// to the configured webhook (parsing the synchronous response as the ACK) and keeps liveness via
/// pings against the webhook's ping endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

struct Inner {
    config: HttpConfig,
    max_message_bytes: u64,
    client: reqwest::Client,
    heartbeat: Heartbeat,
    acks: AckRegistry,
    query_bus: QueryBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(
        config: HttpConfig,
        transport_config: &TransportConfig,
        query_bus: QueryBus,
        acks: AckRegistry,
    ) -> Result<Self, TransportError> {
        if let Some(webhook) = &config.webhook {
            // Batches and pings must not share an endpoint, or the peer cannot tell them apart.
            if url_path(&webhook.url) == url_path(&webhook.ping_url) {
                return Err(TransportError::Config(
                    "webhook.url and webhook.ping_url must differ in path".to_string(),
                ));
            }
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| TransportError::Io(error.into()))?;
        let heartbeat = Heartbeat::new(config.heartbeat.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                max_message_bytes: transport_config.max_message_bytes,
                client,
                heartbeat,
                acks,
                query_bus,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind the query endpoint and start the heartbeat loop.
    pub async fn serve(&self) -> Result<SocketAddr, TransportError> {
        let mut app = Router::new()
            .route("/query", post(query_handler))
            .with_state(self.clone());
        if self.inner.config.cors {
            app = app.layer(CorsLayer::permissive());
        }

        let addr = SocketAddr::new(self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|error| TransportError::Io(error.into()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| TransportError::Io(error.into()))?;

        let server = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                error!(error:%; "HTTP transport server failed");
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.push(server);
        if self.inner.config.webhook.is_some() {
            tasks.push(tokio::spawn(self.clone().ping_loop()));
        }

        debug!(addr:% = local_addr; "HTTP transport serving");
        Ok(local_addr)
    }

    /// Periodically POST a ping to the peer; a valid pong (password match when configured) marks
    /// the peer online.
    async fn ping_loop(self) {
        loop {
            let Some(webhook) = self.inner.config.webhook.as_ref() else {
                return;
            };

            let ping = Envelope::request(
                Action::Ping,
                &PingPayload {
                    ts: now_millis(),
                    nonce: None,
                    sid: None,
                },
            )
            .expect("ping payload serializes");

            match self.post_envelope(&webhook.ping_url, &ping).await {
                Ok(response) if response.action == Action::Pong => {
                    match response.payload_as::<PongPayload>() {
                        Ok(pong) => {
                            if !self.inner.heartbeat.record_pong(&pong) {
                                warn!("pong with wrong password dropped");
                            }
                        }

                        Err(error) => warn!(error:%; "malformed pong payload"),
                    }
                }

                Ok(response) => {
                    warn!(action:? = response.action; "expected Pong, peer answered otherwise")
                }

                Err(error) => {
                    debug!(error = error.display_chain(); "ping delivery failed");
                }
            }

            sleep(self.inner.heartbeat.next_interval()).await;
        }
    }

    async fn post_envelope(
        &self,
        url: &str,
        envelope: &Envelope,
    ) -> Result<Envelope, TransportError> {
        let mut request = self.inner.client.post(url).json(envelope);
        if let Some(token) = &self.inner.config.token {
            request = request.header(TOKEN_HEADER, token.expose_secret());
        }

        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| TransportError::Io(error.into()))?;

        response
            .json::<Envelope>()
            .await
            .map_err(|error| TransportError::Io(error.into()))
    }
}

impl Transport for HttpTransport {
    /// POST the batch to the webhook and treat the synchronous response body as the ACK,
    /// resolving the registry under the response's mirrored correlation ID.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let webhook = self
            .inner
            .config
            .webhook
            .as_ref()
            .ok_or(TransportError::NotConnected)?;

        let size = serde_json::to_string(envelope)
            .map_err(|error| TransportError::Io(error.into()))?
            .len() as u64;
        if size > self.inner.max_message_bytes {
            return Err(TransportError::OversizedMessage {
                size,
                max_bytes: self.inner.max_message_bytes,
            });
        }

        let response = self.post_envelope(&webhook.url, envelope).await?;

        if response.action != Action::OutboxStreamAck {
            return Err(TransportError::Io(
                format!("expected OutboxStreamAck, got {:?}", response.action).into(),
            ));
        }

        let payload = response
            .payload_as::<OutboxStreamAckPayload>()
            .map_err(|error| TransportError::Io(error.into()))?;
        if let Some(correlation_id) = response.correlation_id {
            self.inner.acks.resolve(&correlation_id, payload);
        }

        Ok(())
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

        self.inner.acks.reject_all();
        self.inner.heartbeat.mark_offline();
    }
}

/// `POST /query`: body is either `{name, dto}` or a full `QueryRequest` envelope; the response is
/// a `QueryResponse` envelope with mirrored IDs.
async fn query_handler(
    State(transport): State<HttpTransport>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<Envelope>) {
    if let Some(token) = &transport.inner.config.token {
        let presented = headers
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());

        if presented != Some(token.expose_secret()) {
            let envelope = error_envelope(&bare_request(serde_json::Value::Null), "invalid token");
            return (StatusCode::UNAUTHORIZED, Json(envelope));
        }
    }

    // Accept both the bare payload shape and a full envelope.
    let request = if body.get("action").is_some() {
        match serde_json::from_value::<Envelope>(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                let envelope =
                    error_envelope(&bare_request(serde_json::Value::Null), &error.to_string());
                return (StatusCode::BAD_REQUEST, Json(envelope));
            }
        }
    } else {
        bare_request(body)
    };

    let payload = match request.payload_as::<QueryRequestPayload>() {
        Ok(payload) => payload,
        Err(error) => {
            let envelope = error_envelope(&request, &error.display_chain());
            return (StatusCode::BAD_REQUEST, Json(envelope));
        }
    };

    match transport
        .inner
        .query_bus
        .execute(&payload.name, payload.dto)
        .await
    {
        Ok(data) => {
            let envelope = Envelope::response_to(
                &request,
                Action::QueryResponse,
                &QueryResponsePayload {
                    ok: true,
                    data: Some(data),
                    err: None,
                },
            )
            .expect("query response serializes");
            (StatusCode::OK, Json(envelope))
        }

        Err(error @ QueryError::BadRequest(_)) => (
            StatusCode::BAD_REQUEST,
            Json(error_envelope(&request, &error.display_chain())),
        ),

        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_envelope(&request, &error.display_chain())),
        ),
    }
}

fn bare_request(payload: serde_json::Value) -> Envelope {
    Envelope {
        action: Action::QueryRequest,
        payload: Some(payload),
        request_id: None,
        correlation_id: None,
        timestamp: now_millis(),
    }
}

fn error_envelope(request: &Envelope, err: &str) -> Envelope {
    Envelope::response_to(
        request,
        Action::QueryResponse,
        &QueryResponsePayload {
            ok: false,
            data: None,
            err: Some(err.to_string()),
        },
    )
    .expect("query response serializes")
}

fn url_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme
        .split_once('/')
        .map(|(_, path)| path)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::{HttpConfig, HttpTransport, WebhookConfig, url_path};
    use crate::domain::{
        AckRegistry, HeartbeatConfig, Transport, TransportConfig, TransportError,
    };
    use assert_matches::assert_matches;
    use ingest_common::domain::QueryBus;
    use std::time::Duration;

    fn config(webhook: Option<WebhookConfig>) -> HttpConfig {
        HttpConfig {
            host: "127.0.0.1".parse().expect("valid address"),
            port: 0,
            cors: false,
            token: None,
            webhook,
            heartbeat: Default::default(),
        }
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("http://host:1/hook/batch"), "hook/batch");
        assert_eq!(url_path("http://host:1"), "");
        assert_eq!(url_path("host/ping"), "ping");
    }

    #[test]
    fn test_webhook_paths_must_differ() {
        let webhook = WebhookConfig {
            url: "http://consumer:9000/hook".to_string(),
            ping_url: "http://consumer:9000/hook".to_string(),
        };

        let result = HttpTransport::new(
            config(Some(webhook)),
            &TransportConfig::default(),
            QueryBus::new(),
            AckRegistry::new(),
        );
        assert_matches!(result, Err(TransportError::Config(_)));

        let webhook = WebhookConfig {
            url: "http://consumer:9000/hook".to_string(),
            ping_url: "http://consumer:9000/ping".to_string(),
        };
        let result = HttpTransport::new(
            config(Some(webhook)),
            &TransportConfig::default(),
            QueryBus::new(),
            AckRegistry::new(),
        );
        assert_matches!(result, Ok(_));
    }

    #[tokio::test]
    async fn test_send_without_webhook_is_not_connected() {
        use crate::domain::Transport;
        use ingest_common::domain::{Action, Envelope};

        let transport = HttpTransport::new(
            config(None),
            &TransportConfig::default(),
            QueryBus::new(),
            AckRegistry::new(),
        )
        .expect("transport can be created");

        let envelope = Envelope::request(Action::OutboxStreamBatch, &serde_json::json!({}))
            .expect("envelope can be built");
        assert_matches!(
            transport.send(&envelope).await,
            Err(TransportError::NotConnected)
        );
    }

    /// Minimal downstream consumer: answers pings with the given password and every batch with a
    /// positive ACK.
    async fn consumer_stub(password: &'static str) -> std::net::SocketAddr {
        use axum::{Json, Router, routing::post};
        use ingest_common::domain::{
            Action, Envelope, OutboxStreamAckPayload, PongPayload,
        };

        let app = Router::new()
            .route(
                "/ping",
                post(move |Json(envelope): Json<Envelope>| async move {
                    let pong = Envelope::response_to(
                        &envelope,
                        Action::Pong,
                        &PongPayload {
                            password: Some(password.to_string()),
                            proof: None,
                        },
                    )
                    .expect("pong can be built");
                    Json(pong)
                }),
            )
            .route(
                "/hook",
                post(|Json(envelope): Json<Envelope>| async move {
                    let ack = Envelope::response_to(
                        &envelope,
                        Action::OutboxStreamAck,
                        &OutboxStreamAckPayload {
                            all_ok: true,
                            ok_indices: None,
                        },
                    )
                    .expect("ack can be built");
                    Json(ack)
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("stub binds");
        let addr = listener.local_addr().expect("stub address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        addr
    }

    fn transport_against(
        addr: std::net::SocketAddr,
        password: &str,
        acks: AckRegistry,
    ) -> HttpTransport {
        let mut config = config(Some(WebhookConfig {
            url: format!("http://{addr}/hook"),
            ping_url: format!("http://{addr}/ping"),
        }));
        config.heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(50),
            password: Some(password.to_string()),
            ..HeartbeatConfig::default()
        };

        HttpTransport::new(config, &TransportConfig::default(), QueryBus::new(), acks)
            .expect("transport can be created")
    }

    #[tokio::test]
    async fn test_pong_handshake_and_webhook_ack() {
        use ingest_common::domain::{Action, Envelope};

        let addr = consumer_stub("pw").await;
        let acks = AckRegistry::new();
        let transport = transport_against(addr, "pw", acks.clone());

        transport.serve().await.expect("transport serves");
        transport
            .wait_for_online(Duration::from_secs(5))
            .await
            .expect("valid pong marks the peer online");

        // The synchronous webhook response body is the ACK.
        let batch =
            Envelope::request(Action::OutboxStreamBatch, &serde_json::json!({"events": []}))
                .expect("batch can be built");
        let correlation_id = batch.correlation_id.expect("correlation id");
        let waiter = acks.register(correlation_id);

        transport.send(&batch).await.expect("batch delivered");
        let ack = waiter
            .wait(Duration::from_secs(5))
            .await
            .expect("response body resolves the waiter");
        assert!(ack.all_ok);

        transport.destroy().await;
    }

    #[tokio::test]
    async fn test_wrong_pong_password_stays_offline() {
        let addr = consumer_stub("bad").await;
        let transport = transport_against(addr, "pw", AckRegistry::new());

        transport.serve().await.expect("transport serves");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!transport.is_online());

        transport.destroy().await;
    }

    #[tokio::test]
    async fn test_query_endpoint() {
        use ingest_common::domain::{Envelope, QueryResponsePayload};

        let query_bus = QueryBus::new();
        query_bus.register("Echo", |dto| async move { Ok(dto) });

        let transport = HttpTransport::new(
            config(None),
            &TransportConfig::default(),
            query_bus,
            AckRegistry::new(),
        )
        .expect("transport can be created");
        let addr = transport.serve().await.expect("transport serves");

        let client = reqwest::Client::new();

        // Bare payload shape.
        let response = client
            .post(format!("http://{addr}/query"))
            .json(&serde_json::json!({ "name": "Echo", "dto": { "a": 1 } }))
            .send()
            .await
            .expect("query sent");
        assert_eq!(response.status(), 200);
        let envelope = response.json::<Envelope>().await.expect("response envelope");
        let payload = envelope
            .payload_as::<QueryResponsePayload>()
            .expect("response payload");
        assert!(payload.ok);
        assert_eq!(payload.data, Some(serde_json::json!({ "a": 1 })));

        // Unknown handler surfaces the normalized failure shape.
        let response = client
            .post(format!("http://{addr}/query"))
            .json(&serde_json::json!({ "name": "Nope" }))
            .send()
            .await
            .expect("query sent");
        assert_eq!(response.status(), 500);
        let envelope = response.json::<Envelope>().await.expect("response envelope");
        let payload = envelope
            .payload_as::<QueryResponsePayload>()
            .expect("response payload");
        assert!(!payload.ok);
        assert_matches!(payload.err, Some(err) if err.contains("handler not found"));

        transport.destroy().await;
    }
}
