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

use crate::domain::{UniversalBlock, UniversalTransaction};
use futures::Stream;
use ingest_common::error::BoxError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Rpc,
    P2p,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Verbosity of block queries: `Summary` yields txid strings, `Full` decoded transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Summary,
    Full,
}

/// Per-block stats used by the loader for reply-size budgeting; `total_size` is the size of the
/// binary block as the upstream reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockStats {
    pub blockhash: String,
    pub height: u32,

    #[serde(default)]
    pub total_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u32,
    pub headers: u32,
    pub bestblockhash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub version: u64,
    pub subversion: String,
    pub connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeEstimate {
    #[serde(default)]
    pub feerate: Option<f64>,

    pub blocks: u32,
}

/// A freshly announced chain tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    pub height: u32,
    pub hash: String,
}

/// Upstream node abstraction. Every batched method preserves input order and yields `None` per
/// slot for missing items; transport failures fail the whole call. Providers do not retry.
#[trait_variant::make(Send)]
pub trait NetworkProvider
where
    Self: Clone + Send + Sync + 'static,
{
    fn uniq_name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn connect(&self) -> Result<(), ProviderError>;

    async fn disconnect(&self) -> Result<(), ProviderError>;

    async fn get_block_height(&self) -> Result<u32, ProviderError>;

    async fn get_many_block_hashes_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<String>>, ProviderError>;

    async fn get_many_blocks_by_heights(
        &self,
        heights: &[u32],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError>;

    /// Fetch raw blocks and decode locally; blocks carry the request-side height.
    async fn get_many_blocks_hex_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError>;

    async fn get_many_blocks_by_hashes(
        &self,
        hashes: &[String],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError>;

    /// Fetch raw blocks by hash and decode locally; heights are resolved via a follow-up call.
    async fn get_many_blocks_hex_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError>;

    async fn get_heights_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<u32>>, ProviderError>;

    async fn get_many_blocks_stats_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError>;

    async fn get_many_blocks_stats_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError>;

    async fn get_many_transactions_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<UniversalTransaction>>, ProviderError>;

    async fn get_many_transactions_hex_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<String>>, ProviderError>;

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, ProviderError>;

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError>;

    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<FeeEstimate, ProviderError>;

    /// Infinite stream of new chain tips. Errors are yielded as items; the stream continues with
    /// subsequent valid blocks.
    fn subscribe_to_new_blocks(
        &self,
    ) -> impl Stream<Item = Result<BlockEvent, ProviderError>> + Send;
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport failure")]
    Transport(#[source] BoxError),

    #[error("cannot decode upstream reply")]
    Decode(#[source] BoxError),

    #[error("upstream node returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("provider is not connected")]
    NotConnected,

    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}
