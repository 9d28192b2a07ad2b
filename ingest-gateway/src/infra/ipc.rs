// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{
    AckRegistry, Heartbeat, HeartbeatConfig, NonceBucket, Transport, TransportConfig,
    TransportError,
};
use ingest_common::domain::{
    Action, Envelope, PingPayload, QueryBus, RpcRequestPayload, RpcResponsePayload, now_millis,
};
use log::{debug, warn};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{process::Stdio, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpcConfig {
    /// Consumer executable to spawn as a child process; unset when attaching to existing pipes.
    #[serde(default)]
    pub program: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Shared token; when set, pongs must prove it via the ping's nonce challenge (no sid).
    #[serde(default)]
    pub token: Option<SecretString>,

    #[serde(rename = "heartbeat", default)]
    pub heartbeat: HeartbeatConfig,
}

/// IPC transport over the child process message channel: one string-encoded JSON envelope per
/// line. `RpcRequest` frames bridge to the query bus with the usual correlation discipline.
#[derive(Clone)]
pub struct IpcTransport {
    inner: Arc<Inner>,
}

struct Inner {
    token: Option<SecretString>,
    max_message_bytes: u64,
    heartbeat: Heartbeat,
    acks: AckRegistry,
    query_bus: QueryBus,
    out_tx: mpsc::Sender<String>,
    challenges: NonceBucket,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl IpcTransport {
    /// Spawn the configured consumer executable as a child process and attach to its stdio.
    pub fn spawn_child(
        config: IpcConfig,
        transport_config: &TransportConfig,
        query_bus: QueryBus,
        acks: AckRegistry,
    ) -> Result<Self, TransportError> {
        let program = config
            .program
            .clone()
            .ok_or_else(|| TransportError::Config("ipc.program is required".to_string()))?;

        let mut child = Command::new(program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|error| TransportError::Io(error.into()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Config("child stdout not piped".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Config("child stdin not piped".to_string()))?;

        let transport = Self::attach(stdout, stdin, config, transport_config, query_bus, acks);
        *transport.inner.child.lock() = Some(child);

        Ok(transport)
    }

    /// Attach to an established duplex channel; used directly in tests and by [spawn_child].
    ///
    /// [spawn_child]: IpcTransport::spawn_child
    pub fn attach<R, W>(
        reader: R,
        writer: W,
        config: IpcConfig,
        transport_config: &TransportConfig,
        query_bus: QueryBus,
        acks: AckRegistry,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let heartbeat = Heartbeat::new(config.heartbeat.clone());

        let transport = Self {
            inner: Arc::new(Inner {
                token: config.token,
                max_message_bytes: transport_config.max_message_bytes,
                heartbeat,
                acks,
                query_bus,
                out_tx,
                challenges: NonceBucket::new(),
                tasks: Mutex::new(Vec::new()),
                child: Mutex::new(None),
            }),
        };

        let mut tasks = transport.inner.tasks.lock();
        tasks.push(tokio::spawn(write_loop(writer, out_rx)));
        tasks.push(tokio::spawn(transport.clone().read_loop(reader)));
        tasks.push(tokio::spawn(transport.clone().ping_loop()));
        drop(tasks);

        transport
    }

    fn token(&self) -> Option<&str> {
        self.inner.token.as_ref().map(|token| token.expose_secret())
    }

    async fn read_loop<R>(self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut lines = BufReader::new(reader).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        self.handle_line(line).await;
                    }
                }

                Ok(None) => break,

                Err(error) => {
                    warn!(error:%; "IPC read failed");
                    break;
                }
            }
        }

        debug!("IPC channel closed");
        self.inner.heartbeat.mark_offline();
        self.inner.acks.reject_all();
    }

    async fn handle_line(&self, line: &str) {
        let envelope = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(error:%; "malformed IPC message dropped");
                return;
            }
        };

        match envelope.action {
            Action::Pong => {
                if !self.inner.heartbeat.accept_pong(
                    &envelope,
                    self.token(),
                    &self.inner.challenges,
                    None,
                ) {
                    warn!("invalid pong dropped");
                }
            }

            Action::QueryRequest => {
                let response = self.inner.query_bus.execute_envelope(&envelope).await;
                self.send_serialized(&response).await;
            }

            Action::RpcRequest => {
                let response = self.handle_rpc(&envelope).await;
                self.send_serialized(&response).await;
            }

            Action::OutboxStreamAck => match (envelope.correlation_id, envelope.payload_as()) {
                (Some(correlation_id), Ok(payload)) => {
                    self.inner.acks.resolve(&correlation_id, payload);
                }

                _ => warn!("malformed ACK dropped"),
            },

            Action::RegisterStreamConsumer => debug!("stream consumer registered"),

            action => debug!(action:?; "unexpected IPC message ignored"),
        }
    }

    /// `RpcRequest` → `RpcResponse` with the mirrored correlation ID, dispatching the method on
    /// the query bus.
    async fn handle_rpc(&self, envelope: &Envelope) -> Envelope {
        let response = match envelope.payload_as::<RpcRequestPayload>() {
            Ok(payload) => match self
                .inner
                .query_bus
                .execute(&payload.method, payload.params)
                .await
            {
                Ok(data) => RpcResponsePayload {
                    ok: true,
                    data: Some(data),
                    err: None,
                },

                Err(error) => RpcResponsePayload {
                    ok: false,
                    data: None,
                    err: Some(error.to_string()),
                },
            },

            Err(error) => RpcResponsePayload {
                ok: false,
                data: None,
                err: Some(error.to_string()),
            },
        };

        Envelope::response_to(envelope, Action::RpcResponse, &response)
            .expect("rpc response serializes")
    }

    async fn ping_loop(self) {
        loop {
            let ts = now_millis();
            let mut payload = PingPayload {
                ts,
                nonce: None,
                sid: None,
            };

            let envelope = Envelope::request(Action::Ping, &payload).expect("ping serializes");
            let envelope = if self.token().is_some() {
                let correlation_id = envelope
                    .correlation_id
                    .expect("request envelopes carry a correlation id");
                payload.nonce = Some(self.inner.challenges.issue(correlation_id, ts));

                Envelope {
                    payload: Some(serde_json::to_value(&payload).expect("ping serializes")),
                    ..envelope
                }
            } else {
                envelope
            };

            self.send_serialized(&envelope).await;
            sleep(self.inner.heartbeat.next_interval()).await;
        }
    }

    async fn send_serialized(&self, envelope: &Envelope) {
        let text = serde_json::to_string(envelope).expect("envelope serializes");
        if self.inner.out_tx.send(text).await.is_err() {
            debug!("IPC writer gone, message dropped");
        }
    }
}

async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(mut line) = out_rx.recv().await {
        line.push('\n');
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

impl Transport for IpcTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(envelope).map_err(|error| TransportError::Io(error.into()))?;
        if text.len() as u64 > self.inner.max_message_bytes {
            return Err(TransportError::OversizedMessage {
                size: text.len() as u64,
                max_bytes: self.inner.max_message_bytes,
            });
        }

        self.inner
            .out_tx
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
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

        if let Some(mut child) = self.inner.child.lock().take() {
            let _ = child.start_kill();
        }

        self.inner.acks.reject_all();
        self.inner.heartbeat.mark_offline();
    }
}

#[cfg(test)]
mod tests {
    use super::{IpcConfig, IpcTransport};
    use crate::domain::{AckRegistry, HeartbeatConfig, Transport, TransportConfig, compute_proof};
    use ingest_common::domain::{
        Action, Envelope, OutboxStreamAckPayload, PingPayload, PongPayload, QueryBus,
        RpcResponsePayload,
    };
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct FakeConsumer {
        reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeConsumer {
        async fn next_envelope(&mut self) -> Envelope {
            loop {
                let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
                    .await
                    .expect("line within deadline")
                    .expect("channel open")
                    .expect("channel not closed");

                if !line.trim().is_empty() {
                    return serde_json::from_str(&line).expect("line is an envelope");
                }
            }
        }

        async fn send(&mut self, envelope: &Envelope) {
            let mut line = serde_json::to_string(envelope).expect("envelope serializes");
            line.push('\n');
            self.writer
                .write_all(line.as_bytes())
                .await
                .expect("line written");
        }
    }

    fn setup(token: Option<&str>) -> (IpcTransport, FakeConsumer, AckRegistry, QueryBus) {
        let (ours, theirs) = tokio::io::duplex(64 * 1_024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);

        let acks = AckRegistry::new();
        let query_bus = QueryBus::new();
        query_bus.register("Echo", |dto| async move { Ok(dto) });

        let transport = IpcTransport::attach(
            our_read,
            our_write,
            IpcConfig {
                token: token.map(|token| token.to_string().into()),
                heartbeat: HeartbeatConfig {
                    interval: Duration::from_millis(50),
                    ..HeartbeatConfig::default()
                },
                ..IpcConfig::default()
            },
            &TransportConfig::default(),
            query_bus.clone(),
            acks.clone(),
        );

        let consumer = FakeConsumer {
            reader: BufReader::new(their_read).lines(),
            writer: their_write,
        };

        (transport, consumer, acks, query_bus)
    }

    #[tokio::test]
    async fn test_ping_pong_with_proof() {
        let (transport, mut consumer, _acks, _bus) = setup(Some("secret"));
        assert!(!transport.is_online());

        let ping = loop {
            let envelope = consumer.next_envelope().await;
            if envelope.action == Action::Ping {
                break envelope;
            }
        };
        let challenge = ping.payload_as::<PingPayload>().expect("ping payload");
        let nonce = challenge.nonce.expect("nonce challenge present");

        let pong = Envelope::response_to(
            &ping,
            Action::Pong,
            &PongPayload {
                password: None,
                proof: Some(compute_proof("secret", &nonce, challenge.ts, None)),
            },
        )
        .expect("pong can be built");
        consumer.send(&pong).await;

        transport
            .wait_for_online(Duration::from_secs(5))
            .await
            .expect("transport comes online");

        transport.destroy().await;
    }

    #[tokio::test]
    async fn test_batch_ack_and_rpc_round_trip() {
        let (transport, mut consumer, acks, _bus) = setup(None);

        // Outbox batch with ACK.
        let batch =
            Envelope::request(Action::OutboxStreamBatch, &serde_json::json!({"events": []}))
                .expect("batch can be built");
        let correlation_id = batch.correlation_id.expect("correlation id");
        let waiter = acks.register(correlation_id);
        transport.send(&batch).await.expect("batch sent");

        let received = loop {
            let envelope = consumer.next_envelope().await;
            if envelope.action == Action::OutboxStreamBatch {
                break envelope;
            }
        };
        assert_eq!(received.correlation_id, Some(correlation_id));

        let ack = Envelope::response_to(
            &received,
            Action::OutboxStreamAck,
            &OutboxStreamAckPayload {
                all_ok: true,
                ok_indices: None,
            },
        )
        .expect("ack can be built");
        consumer.send(&ack).await;

        waiter
            .wait(Duration::from_secs(5))
            .await
            .expect("ack resolves the waiter");

        // RpcRequest bridges to the query bus and mirrors the correlation id.
        let rpc = Envelope::request(
            Action::RpcRequest,
            &serde_json::json!({ "method": "Echo", "params": { "n": 1 } }),
        )
        .expect("rpc request can be built");
        consumer.send(&rpc).await;

        let response = loop {
            let envelope = consumer.next_envelope().await;
            if envelope.action == Action::RpcResponse {
                break envelope;
            }
        };
        assert_eq!(response.correlation_id, rpc.correlation_id);
        let payload = response
            .payload_as::<RpcResponsePayload>()
            .expect("rpc response payload");
        assert!(payload.ok);
        assert_eq!(payload.data, Some(serde_json::json!({ "n": 1 })));

        transport.destroy().await;
    }
}
