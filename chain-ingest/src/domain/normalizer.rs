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

use crate::domain::{Block, NetworkConfig, UniversalBlock, UniversalTxEntry};
use log::debug;
use thiserror::Error;

/// Size of the serialized block header in bytes.
const HEADER_SIZE: u64 = 80;

/// Pure conversion from the provider-agnostic shape into the core entity, deriving the size
/// metrics. String `tx` entries (bare txids) are filtered out; only decoded transactions survive.
#[derive(Debug, Clone)]
pub struct BlockNormalizer {
    network: NetworkConfig,
}

impl BlockNormalizer {
    pub fn new(network: NetworkConfig) -> Self {
        Self { network }
    }

    pub fn normalize_block(&self, block: &UniversalBlock) -> Result<Block, NormalizeError> {
        let height = block
            .height
            .ok_or_else(|| NormalizeError::HeightRequired(block.hash.clone()))?;

        let tx = block
            .tx
            .iter()
            .flatten()
            .filter_map(|entry| match entry {
                UniversalTxEntry::Full(tx) => Some(tx.clone()),
                UniversalTxEntry::Id(_) => None,
            })
            .collect::<Vec<_>>();

        let vsize = if block.weight > 0 {
            block.weight.div_ceil(4)
        } else {
            block.strippedsize
        };

        let witness_size = (self.network.has_segwit && block.size > block.strippedsize)
            .then(|| block.size - block.strippedsize);

        let witness_data_ratio = witness_size
            .filter(|_| block.size > 0)
            .map(|witness_size| witness_size as f64 / block.size as f64 * 100.0);

        let block_size_efficiency = if self.network.max_block_size > 0 {
            block.size as f64 / self.network.max_block_size as f64 * 100.0
        } else {
            0.0
        };

        Ok(Block {
            height,
            hash: block.hash.clone(),
            size: block.size,
            strippedsize: block.strippedsize,
            weight: block.weight,
            version: block.version,
            version_hex: block.version_hex.clone(),
            merkleroot: block.merkleroot.clone(),
            time: block.time,
            mediantime: block.mediantime,
            nonce: block.nonce,
            bits: block.bits.clone(),
            difficulty: block.difficulty,
            chainwork: block.chainwork.clone(),
            previousblockhash: block.previousblockhash.clone(),
            nextblockhash: block.nextblockhash.clone(),
            n_tx: block.n_tx.unwrap_or(tx.len() as u32),
            tx,
            vsize,
            witness_size,
            header_size: HEADER_SIZE,
            transactions_size: block.size.saturating_sub(HEADER_SIZE),
            block_size_efficiency,
            witness_data_ratio,
        })
    }

    /// Normalize a batch, preserving order and skipping blocks that fail normalization.
    pub fn normalize_many_blocks(&self, blocks: &[UniversalBlock]) -> Vec<Block> {
        blocks
            .iter()
            .filter_map(|block| match self.normalize_block(block) {
                Ok(block) => Some(block),

                Err(error) => {
                    debug!(hash:% = block.hash, error:%; "skipping block failing normalization");
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("block {0} has no height")]
    HeightRequired(String),
}
