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

use bitcoin::BlockHash;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// Height → hash map built from genesis by the header sync. Heights are dense; requests by
/// height resolve through this index, requests by hash reverse through it.
pub struct HeaderIndex {
    inner: RwLock<Inner>,
    max_height: Option<u32>,
}

struct Inner {
    by_height: Vec<BlockHash>,
    by_hash: HashMap<BlockHash, u32>,
}

impl HeaderIndex {
    pub fn new(genesis: BlockHash, max_height: Option<u32>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_height: vec![genesis],
                by_hash: HashMap::from([(genesis, 0)]),
            }),
            max_height,
        }
    }

    pub fn tip(&self) -> (u32, BlockHash) {
        let inner = self.inner.read();
        let height = inner.by_height.len() as u32 - 1;
        (height, inner.by_height[height as usize])
    }

    pub fn tip_height(&self) -> u32 {
        self.inner.read().by_height.len() as u32 - 1
    }

    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        self.inner.read().by_height.get(height as usize).copied()
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.inner.read().by_hash.get(hash).copied()
    }

    /// Whether the configured sync ceiling has been reached.
    pub fn is_complete(&self) -> bool {
        self.max_height
            .is_some_and(|max_height| self.tip_height() >= max_height)
    }

    /// Append contiguous headers extending the current tip; returns how many were accepted.
    /// Headers beyond the configured `max_height` are ignored.
    pub fn append(&self, headers: &[bitcoin::block::Header]) -> Result<usize, HeaderSyncError> {
        let mut inner = self.inner.write();
        let mut accepted = 0;

        for header in headers {
            let height = inner.by_height.len() as u32;
            if self.max_height.is_some_and(|max_height| height > max_height) {
                break;
            }

            let tip = inner.by_height[height as usize - 1];
            if header.prev_blockhash != tip {
                return Err(HeaderSyncError::BrokenChain {
                    height,
                    expected: tip,
                    actual: header.prev_blockhash,
                });
            }

            let hash = header.block_hash();
            inner.by_height.push(hash);
            inner.by_hash.insert(hash, height);
            accepted += 1;
        }

        Ok(accepted)
    }
}

#[derive(Debug, Error)]
pub enum HeaderSyncError {
    #[error("header at height {height} does not extend the chain: expected parent {expected}, got {actual}")]
    BrokenChain {
        height: u32,
        expected: BlockHash,
        actual: BlockHash,
    },
}
