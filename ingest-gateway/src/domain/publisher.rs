// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{OutboxBatchSender, SendError, Transport};
use futures::Stream;
use ingest_common::domain::{LocalEventBus, Subscriber, SystemEvent, WireEventRecord};

/// Façade over the outbox sender and the local system-event stream: downstream code publishes
/// batches through it and observes the locally re-emitted system events via [events].
///
/// [events]: OutboxPublisher::events
#[derive(Clone)]
pub struct OutboxPublisher<T> {
    sender: OutboxBatchSender<T, LocalEventBus>,
    bus: LocalEventBus,
}

impl<T> OutboxPublisher<T>
where
    T: Transport,
{
    pub fn new(sender: OutboxBatchSender<T, LocalEventBus>, bus: LocalEventBus) -> Self {
        Self { sender, bus }
    }

    /// The local stream of system events, live for the lifetime of this publisher.
    pub fn events(&self) -> impl Stream<Item = SystemEvent> + Send {
        self.bus.subscribe()
    }

    pub async fn publish_wire_stream_batch_with_ack(
        &self,
        events: &[WireEventRecord],
    ) -> Result<(), SendError> {
        self.sender.publish_wire_stream_batch_with_ack(events).await
    }
}
