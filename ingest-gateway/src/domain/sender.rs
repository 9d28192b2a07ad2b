// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{AckRegistry, Transport, TransportConfig, TransportError};
use ingest_common::{
    domain::{
        Action, Envelope, OutboxStreamBatchPayload, Publisher, SystemEvent, WireEventRecord,
    },
    error::StdErrorExt,
};
use log::{debug, warn};
use serde::Deserialize;
use std::{collections::HashSet, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, task, time::Instant};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SenderConfig {
    /// `model_name`s whose events are re-emitted on the local bus after ACK.
    #[serde(default)]
    pub system_models: HashSet<String>,
}

/// Streams outbox batches over the transport and awaits a strict correlation-id ACK per batch.
/// Batches go out one at a time; system events are re-emitted locally only after the ACK, on a
/// separate task so emission never happens on the send path.
#[derive(Clone)]
pub struct OutboxBatchSender<T, P> {
    transport: T,
    publisher: P,
    acks: AckRegistry,
    system_models: Arc<HashSet<String>>,
    max_message_bytes: u64,
    ack_timeout: Duration,
    send_lock: Arc<Mutex<()>>,
}

impl<T, P> OutboxBatchSender<T, P>
where
    T: Transport,
    P: Publisher,
{
    pub fn new(
        config: SenderConfig,
        transport_config: &TransportConfig,
        transport: T,
        publisher: P,
        acks: AckRegistry,
    ) -> Self {
        Self {
            transport,
            publisher,
            acks,
            system_models: Arc::new(config.system_models),
            max_message_bytes: transport_config.max_message_bytes,
            ack_timeout: transport_config.ack_timeout,
            send_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Send one batch and await its ACK. On success the acknowledged system events are emitted
    /// locally; a partial ACK emits the acknowledged subset and still fails the call so the
    /// caller re-sends per the at-least-once contract.
    pub async fn publish_wire_stream_batch_with_ack(
        &self,
        events: &[WireEventRecord],
    ) -> Result<(), SendError> {
        if events.is_empty() {
            return Ok(());
        }

        // One batch in flight per sender.
        let _guard = self.send_lock.lock().await;

        let envelope = Envelope::request(
            Action::OutboxStreamBatch,
            &OutboxStreamBatchPayload {
                events: events.to_vec(),
            },
        )?;
        let correlation_id = envelope
            .correlation_id
            .expect("request envelopes carry a correlation id");

        let serialized_len = serde_json::to_string(&envelope)?.len() as u64;
        if serialized_len > self.max_message_bytes {
            return Err(SendError::Transport(TransportError::OversizedMessage {
                size: serialized_len,
                max_bytes: self.max_message_bytes,
            }));
        }

        let started_at = Instant::now();
        let waiter = self.acks.register(correlation_id);

        let result = match self.transport.send(&envelope).await {
            Ok(()) => waiter.wait(self.ack_timeout).await,
            Err(error) => Err(error),
        };

        // The pending map is left clean on every path.
        self.acks.remove(&correlation_id);

        let ack = result.inspect_err(|error| {
            warn!(
                correlation_id:% = correlation_id,
                events = events.len(),
                error = error.display_chain();
                "outbox batch failed"
            );
            metrics::counter!("outbox_batches_failed").increment(1);
        })?;

        metrics::histogram!("outbox_ack_seconds").record(started_at.elapsed().as_secs_f64());

        if ack.all_ok {
            debug!(correlation_id:% = correlation_id, events = events.len(); "batch acknowledged");
            self.emit_locally(events.to_vec());
            return Ok(());
        }

        // Partial ACK: okIndices names the applied subset; without it the batch failed entirely.
        let Some(ok_indices) = ack.ok_indices else {
            return Err(SendError::BatchRejected);
        };

        let acked = ok_indices
            .iter()
            .filter_map(|&index| events.get(index).cloned())
            .collect::<Vec<_>>();
        let acked_len = acked.len();
        self.emit_locally(acked);

        Err(SendError::PartialAck {
            acked: acked_len,
            total: events.len(),
        })
    }

    /// Emit system events on a spawned task, one tick removed from the send path, so observers
    /// can never re-enter the sender within the same call stack.
    fn emit_locally(&self, events: Vec<WireEventRecord>) {
        let publisher = self.publisher.clone();
        let system_models = self.system_models.clone();

        task::spawn(async move {
            for record in events {
                if !system_models.contains(&record.model_name) {
                    continue;
                }

                match SystemEvent::from_wire(&record) {
                    Ok(event) => {
                        if let Err(error) = publisher.publish(&event).await {
                            warn!(
                                event_type = event.event_type,
                                error = error.display_chain();
                                "cannot publish system event"
                            );
                        }
                    }

                    // Parse failures skip the record; the rest of the batch continues.
                    Err(error) => {
                        warn!(
                            model_name = record.model_name,
                            event_type = record.event_type,
                            error:%;
                            "cannot parse system event payload"
                        );
                    }
                }
            }
        });
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("batch envelope cannot be serialized")]
    Serialize(#[from] serde_json::Error),

    #[error("batch rejected by the consumer")]
    BatchRejected,

    #[error("batch partially applied: {acked} of {total} events")]
    PartialAck { acked: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use crate::domain::{
        AckRegistry, OutboxBatchSender, SendError, SenderConfig, Transport, TransportConfig,
        TransportError,
    };
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use ingest_common::domain::{
        Action, Envelope, LocalEventBus, OutboxStreamAckPayload, Subscriber, WireEventRecord,
    };
    use parking_lot::Mutex;
    use std::{collections::HashSet, pin::pin, sync::Arc, time::Duration};

    /// Transport capturing sent envelopes; ACK behavior is driven by the test.
    #[derive(Clone, Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<Envelope>>>,
        acks: Option<AckRegistry>,
        ack: Option<OutboxStreamAckPayload>,
        fail_send: bool,
    }

    impl Transport for MockTransport {
        async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::NotConnected);
            }

            self.sent.lock().push(envelope.clone());

            // Synchronous ACK like the HTTP webhook path, keyed by the envelope's correlation id.
            if let (Some(acks), Some(ack)) = (&self.acks, &self.ack) {
                let correlation_id = envelope.correlation_id.expect("correlation id present");
                acks.resolve(&correlation_id, ack.clone());
            }

            Ok(())
        }

        fn is_online(&self) -> bool {
            true
        }

        async fn wait_for_online(&self, _deadline: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        async fn destroy(&self) {}
    }

    fn record(model_name: &str, event_type: &str, payload: &str) -> WireEventRecord {
        WireEventRecord {
            model_name: model_name.to_string(),
            event_type: event_type.to_string(),
            event_version: 1,
            request_id: "req-1".to_string(),
            block_height: 7,
            payload: payload.to_string(),
            timestamp: 1_700_000_000_000,
        }
    }

    fn sender(
        transport: MockTransport,
        bus: LocalEventBus,
        acks: AckRegistry,
        ack_timeout: Duration,
    ) -> OutboxBatchSender<MockTransport, LocalEventBus> {
        OutboxBatchSender::new(
            SenderConfig {
                system_models: HashSet::from(["sys-model".to_string()]),
            },
            &TransportConfig {
                max_message_bytes: 1_048_576,
                ack_timeout,
            },
            transport,
            bus,
            acks,
        )
    }

    #[tokio::test]
    async fn test_system_events_emitted_only_after_ack() {
        let acks = AckRegistry::new();
        let transport = MockTransport {
            acks: Some(acks.clone()),
            ack: Some(OutboxStreamAckPayload {
                all_ok: true,
                ok_indices: None,
            }),
            ..MockTransport::default()
        };
        let bus = LocalEventBus::default();
        let sender = sender(transport.clone(), bus.clone(), acks.clone(), Duration::from_secs(1));

        let mut events = pin!(bus.subscribe());

        let batch = vec![
            record("sys-model", "UserCreated", r#"{"a":1}"#),
            record("external", "Ignored", r#"{"b":2}"#),
        ];
        sender
            .publish_wire_stream_batch_with_ack(&batch)
            .await
            .expect("batch acknowledged");

        // Exactly one local event: the system-model record, with its payload parsed.
        let event = events.next().await.expect("one event emitted");
        assert_eq!(event.aggregate_id, "sys-model");
        assert_eq!(event.event_type, "UserCreated");
        assert_eq!(event.payload, serde_json::json!({ "a": 1 }));

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::OutboxStreamBatch);
        assert!(acks.is_empty());

        // No second event: the external record is not re-emitted.
        let no_more =
            tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(no_more.is_err());
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let acks = AckRegistry::new();
        // Transport never ACKs.
        let transport = MockTransport::default();
        let bus = LocalEventBus::default();
        let sender = sender(
            transport,
            bus.clone(),
            acks.clone(),
            Duration::from_millis(200),
        );

        let mut events = pin!(bus.subscribe());

        let started_at = std::time::Instant::now();
        let result = sender
            .publish_wire_stream_batch_with_ack(&[record("sys-model", "E", "{}")])
            .await;
        let elapsed = started_at.elapsed();

        assert_matches!(
            result,
            Err(SendError::Transport(TransportError::AckTimeout(_)))
        );
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(500));
        assert!(acks.is_empty());

        // No local emission on timeout.
        let no_event = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(no_event.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let acks = AckRegistry::new();
        let transport = MockTransport::default();
        let sender = sender(
            transport.clone(),
            LocalEventBus::default(),
            acks,
            Duration::from_secs(1),
        );

        sender
            .publish_wire_stream_batch_with_ack(&[])
            .await
            .expect("empty batch resolves immediately");
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_cleans_pending() {
        let acks = AckRegistry::new();
        let transport = MockTransport {
            fail_send: true,
            ..MockTransport::default()
        };
        let sender = sender(
            transport,
            LocalEventBus::default(),
            acks.clone(),
            Duration::from_secs(1),
        );

        let result = sender
            .publish_wire_stream_batch_with_ack(&[record("sys-model", "E", "{}")])
            .await;

        assert_matches!(
            result,
            Err(SendError::Transport(TransportError::NotConnected))
        );
        assert!(acks.is_empty());
    }

    #[tokio::test]
    async fn test_partial_ack_emits_subset_and_fails() {
        let acks = AckRegistry::new();
        let transport = MockTransport {
            acks: Some(acks.clone()),
            ack: Some(OutboxStreamAckPayload {
                all_ok: false,
                ok_indices: Some(vec![0]),
            }),
            ..MockTransport::default()
        };
        let bus = LocalEventBus::default();
        let sender = sender(transport, bus.clone(), acks, Duration::from_secs(1));

        let mut events = pin!(bus.subscribe());

        let batch = vec![
            record("sys-model", "Applied", r#"{"ok":true}"#),
            record("sys-model", "NotApplied", r#"{"ok":false}"#),
        ];
        let result = sender.publish_wire_stream_batch_with_ack(&batch).await;
        assert_matches!(result, Err(SendError::PartialAck { acked: 1, total: 2 }));

        let event = events.next().await.expect("acked subset emitted");
        assert_eq!(event.event_type, "Applied");
    }

    #[tokio::test]
    async fn test_rejected_ack_without_indices() {
        let acks = AckRegistry::new();
        let transport = MockTransport {
            acks: Some(acks.clone()),
            ack: Some(OutboxStreamAckPayload {
                all_ok: false,
                ok_indices: None,
            }),
            ..MockTransport::default()
        };
        let sender = sender(
            transport,
            LocalEventBus::default(),
            acks,
            Duration::from_secs(1),
        );

        let result = sender
            .publish_wire_stream_batch_with_ack(&[record("sys-model", "E", "{}")])
            .await;
        assert_matches!(result, Err(SendError::BatchRejected));
    }
}
