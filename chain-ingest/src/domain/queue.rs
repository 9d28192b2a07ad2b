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

use crate::domain::Block;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Upper bound on the summed `size` of queued blocks.
    #[serde(with = "byte_unit_serde", default = "max_queue_size_default")]
    pub max_queue_size: u64,

    /// Default slot size assumed for blocks whose upstream stats carry no size.
    #[serde(with = "byte_unit_serde", default = "block_size_default")]
    pub block_size: u64,

    /// Ingestion stops once the queue has seen this height.
    #[serde(default = "max_block_height_default")]
    pub max_block_height: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: max_queue_size_default(),
            block_size: block_size_default(),
            max_block_height: max_block_height_default(),
        }
    }
}

fn max_queue_size_default() -> u64 {
    1_073_741_824
}

fn block_size_default() -> u64 {
    1_048_576
}

fn max_block_height_default() -> u32 {
    u32::MAX
}

/// Bounded FIFO of normalized blocks, strictly height-ordered: every enqueued block must extend
/// the chain by exactly one height. Single-writer (loader) / single-reader (iterator); the size
/// counter is updated under the same critical section as the buffer.
pub struct BlockQueue {
    inner: Mutex<Inner>,
    max_queue_size: u64,
    block_size: u64,
    max_block_height: u32,
}

struct Inner {
    blocks: VecDeque<Block>,
    current_size: u64,
    last_height: Option<u32>,
}

impl BlockQueue {
    /// Create a queue continuing after `last_height`; `None` starts at genesis.
    pub fn new(config: QueueConfig, last_height: Option<u32>) -> Self {
        let QueueConfig {
            max_queue_size,
            block_size,
            max_block_height,
        } = config;

        Self {
            inner: Mutex::new(Inner {
                blocks: VecDeque::new(),
                current_size: 0,
                last_height,
            }),
            max_queue_size,
            block_size,
            max_block_height,
        }
    }

    /// Append the next block. The height must be exactly `last_height + 1` and the summed size
    /// must stay within `max_queue_size`.
    pub fn enqueue(&self, block: Block) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();

        let expected = next_height(inner.last_height);
        if Some(block.height) != expected {
            return Err(QueueError::OutOfOrder {
                expected,
                actual: block.height,
            });
        }

        if block.height > self.max_block_height {
            return Err(QueueError::BeyondMaxHeight {
                height: block.height,
                max_block_height: self.max_block_height,
            });
        }

        if inner.current_size + block.size > self.max_queue_size {
            return Err(QueueError::Full {
                current_size: inner.current_size,
                block_size: block.size,
                max_queue_size: self.max_queue_size,
            });
        }

        inner.current_size += block.size;
        inner.last_height = Some(block.height);
        inner.blocks.push_back(block);

        Ok(())
    }

    /// Drain a FIFO prefix whose total size stays within `max_bytes`. A non-empty queue always
    /// yields at least the head block, even when it alone exceeds the budget.
    pub fn get_batch_up_to_size(&self, max_bytes: u64) -> Vec<Block> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::new();
        let mut batch_size = 0;

        while let Some(head) = inner.blocks.front() {
            if !batch.is_empty() && batch_size + head.size > max_bytes {
                break;
            }

            let block = inner.blocks.pop_front().expect("head exists");
            inner.current_size -= block.size;
            batch_size += block.size;
            batch.push(block);

            if batch_size >= max_bytes {
                break;
            }
        }

        batch
    }

    /// Height of the most recently enqueued block; `None` before the first enqueue.
    pub fn last_height(&self) -> Option<u32> {
        self.inner.lock().last_height
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().blocks.is_empty()
    }

    pub fn current_size(&self) -> u64 {
        self.inner.lock().current_size
    }

    /// Default slot size for blocks without upstream size stats.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn max_queue_size(&self) -> u64 {
        self.max_queue_size
    }

    pub fn max_block_height(&self) -> u32 {
        self.max_block_height
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().current_size >= self.max_queue_size
    }

    /// Whether reserving `budget` more bytes would overflow the queue.
    pub fn is_overloaded(&self, budget: u64) -> bool {
        self.inner.lock().current_size + budget > self.max_queue_size
    }

    pub fn is_max_height_reached(&self) -> bool {
        self.inner
            .lock()
            .last_height
            .is_some_and(|height| height >= self.max_block_height)
    }
}

fn next_height(last_height: Option<u32>) -> Option<u32> {
    match last_height {
        Some(height) => height.checked_add(1),
        None => Some(0),
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Retriable: the loader backs off and re-attempts once the iterator has drained.
    #[error(
        "queue is full: {current_size} + {block_size} bytes would exceed {max_queue_size}"
    )]
    Full {
        current_size: u64,
        block_size: u64,
        max_queue_size: u64,
    },

    /// Programmer error: blocks must arrive as a dense height chain.
    #[error("block height {actual} breaks the chain, expected {expected:?}")]
    OutOfOrder {
        expected: Option<u32>,
        actual: u32,
    },

    #[error("block height {height} exceeds the configured maximum {max_block_height}")]
    BeyondMaxHeight { height: u32, max_block_height: u32 },
}

impl QueueError {
    /// Whether the caller may retry after the queue has drained.
    pub fn is_retriable(&self) -> bool {
        matches!(self, QueueError::Full { .. })
    }
}
