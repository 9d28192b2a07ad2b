// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::{Block, BlockQueue};
use ingest_common::error::StdErrorExt;
use log::{debug, warn};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Notify, time::timeout};
use uuid::Uuid;

const WAIT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
pub struct IteratorConfig {
    /// Byte budget of one batch handed to the consumer.
    #[serde(with = "byte_unit_serde", default = "batch_bytes_default")]
    pub batch_bytes: u64,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            batch_bytes: batch_bytes_default(),
        }
    }
}

fn batch_bytes_default() -> u64 {
    5_242_880
}

/// Consumer of drained block batches; failures are retried with the same batch and request ID
/// (at-least-once).
#[trait_variant::make(Send)]
pub trait BlockBatchConsumer
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle_batch(&self, batch: &[Block], request_id: &str) -> Result<(), Self::Error>;
}

/// Wakes the iterator once the consumer has fully processed a batch, e.g. after an outbox ACK.
/// Created independently so the downstream side can hold it before the iterator exists.
#[derive(Clone, Default)]
pub struct IteratorWaker {
    wake: Arc<Notify>,
}

impl IteratorWaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_next_batch(&self) {
        self.wake.notify_one();
    }
}

/// Drains the queue into size-bounded batches and hands them to the consumer. A failed batch is
/// retried on the next cycle; a fresh batch is only drained once the previous one succeeded.
pub struct QueueIterator<C> {
    queue: Arc<BlockQueue>,
    consumer: C,
    batch_bytes: u64,
    waker: IteratorWaker,
    current: Option<PendingBatch>,
}

struct PendingBatch {
    blocks: Vec<Block>,
    request_id: String,
}

impl<C> QueueIterator<C>
where
    C: BlockBatchConsumer,
{
    pub fn new(config: IteratorConfig, queue: Arc<BlockQueue>, consumer: C) -> Self {
        Self::with_waker(config, queue, consumer, IteratorWaker::new())
    }

    pub fn with_waker(
        config: IteratorConfig,
        queue: Arc<BlockQueue>,
        consumer: C,
        waker: IteratorWaker,
    ) -> Self {
        Self {
            queue,
            consumer,
            batch_bytes: config.batch_bytes,
            waker,
            current: None,
        }
    }

    pub fn waker(&self) -> IteratorWaker {
        self.waker.clone()
    }

    /// Loop forever; cancellation happens by dropping the task running this future.
    pub async fn run(&mut self) {
        loop {
            match self.process_next().await {
                IterationOutcome::Processed => {}

                IterationOutcome::QueueEmpty | IterationOutcome::BatchFailed => {
                    // Wait for the external wake signal, re-checking at a steady cadence.
                    let _ = timeout(WAIT_DELAY, self.waker.wake.notified()).await;
                }
            }
        }
    }

    /// One cycle: drain a batch (or take the retried one) and hand it to the consumer.
    pub async fn process_next(&mut self) -> IterationOutcome {
        let pending = match self.current.take() {
            Some(pending) => pending,

            None => {
                let blocks = self.queue.get_batch_up_to_size(self.batch_bytes);
                if blocks.is_empty() {
                    return IterationOutcome::QueueEmpty;
                }

                PendingBatch {
                    request_id: Uuid::now_v7().to_string(),
                    blocks,
                }
            }
        };

        match self
            .consumer
            .handle_batch(&pending.blocks, &pending.request_id)
            .await
        {
            Ok(()) => {
                debug!(
                    request_id = pending.request_id,
                    blocks = pending.blocks.len();
                    "batch processed"
                );
                metrics::counter!("iterator_batches_processed").increment(1);
                IterationOutcome::Processed
            }

            Err(error) => {
                warn!(
                    request_id = pending.request_id,
                    error = error.display_chain();
                    "batch handling failed, batch will be retried"
                );
                metrics::counter!("iterator_batches_failed").increment(1);
                self.current = Some(pending);
                IterationOutcome::BatchFailed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Processed,
    QueueEmpty,
    BatchFailed,
}

/// Error type for consumers without failure modes of their own.
#[derive(Debug, Error)]
#[error("batch consumer failed")]
pub struct ConsumerError(#[source] pub ingest_common::error::BoxError);
