// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::TransportError;
use dashmap::DashMap;
use ingest_common::domain::{CorrelationId, OutboxStreamAckPayload};
use log::{debug, warn};
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, time::timeout};

/// Pending-ACK map: one waiter per in-flight correlation ID. The sender owns the lifecycle
/// (register on send, remove on resolve, timeout or close); transports only route inbound ACKs
/// through [resolve].
///
/// [resolve]: AckRegistry::resolve
#[derive(Clone, Default)]
pub struct AckRegistry {
    pending: Arc<DashMap<CorrelationId, oneshot::Sender<OutboxStreamAckPayload>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the given correlation ID.
    pub fn register(&self, correlation_id: CorrelationId) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);

        AckWaiter { rx }
    }

    /// Remove the waiter; idempotent, runs on every send-path exit.
    pub fn remove(&self, correlation_id: &CorrelationId) {
        self.pending.remove(correlation_id);
    }

    /// Route an inbound ACK to its waiter. ACKs may arrive in any order; an unknown correlation
    /// ID (late or duplicate ACK) is dropped.
    pub fn resolve(&self, correlation_id: &CorrelationId, payload: OutboxStreamAckPayload) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, tx)) => {
                let delivered = tx.send(payload).is_ok();
                debug!(correlation_id:% = correlation_id, delivered; "ACK routed");
                delivered
            }

            None => {
                warn!(correlation_id:% = correlation_id; "ACK for unknown correlation id dropped");
                false
            }
        }
    }

    /// Reject every pending waiter, e.g. when the transport closes.
    pub fn reject_all(&self) {
        // Dropping the senders wakes the receivers with a closed-channel error.
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One-shot handle resolved by the matching ACK.
pub struct AckWaiter {
    rx: oneshot::Receiver<OutboxStreamAckPayload>,
}

impl AckWaiter {
    /// Await the ACK within the deadline. Channel closure means the transport was destroyed.
    pub async fn wait(self, deadline: Duration) -> Result<OutboxStreamAckPayload, TransportError> {
        match timeout(deadline, self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::AckTimeout(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{AckRegistry, TransportError};
    use assert_matches::assert_matches;
    use ingest_common::domain::OutboxStreamAckPayload;
    use std::time::Duration;
    use uuid::Uuid;

    fn ack() -> OutboxStreamAckPayload {
        OutboxStreamAckPayload {
            all_ok: true,
            ok_indices: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_out_of_order() {
        let registry = AckRegistry::new();
        let id_a = Uuid::now_v7();
        let id_b = Uuid::now_v7();

        let waiter_a = registry.register(id_a);
        let waiter_b = registry.register(id_b);

        // ACK arrival order differs from registration order; routing stays correct.
        assert!(registry.resolve(&id_b, ack()));
        assert!(registry.resolve(&id_a, ack()));

        waiter_b.wait(Duration::from_secs(1)).await.expect("b acked");
        waiter_a.wait(Duration::from_secs(1)).await.expect("a acked");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_dropped() {
        let registry = AckRegistry::new();
        assert!(!registry.resolve(&Uuid::now_v7(), ack()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let registry = AckRegistry::new();
        let id = Uuid::now_v7();
        let waiter = registry.register(id);

        let result = waiter.wait(Duration::from_millis(50)).await;
        assert_matches!(result, Err(TransportError::AckTimeout(_)));

        registry.remove(&id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reject_all() {
        let registry = AckRegistry::new();
        let waiter = registry.register(Uuid::now_v7());

        registry.reject_all();
        assert_matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        );
    }
}
