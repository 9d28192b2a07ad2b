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

pub mod p2p;
pub mod rpc;

use crate::{
    domain::{
        BlockEvent, BlockStats, BlockchainInfo, FeeEstimate, NetworkInfo, NetworkProvider,
        ProviderError, ProviderKind, UniversalBlock, UniversalTransaction, Verbosity,
    },
    infra::{
        p2p::{P2pConfig, P2pProvider},
        rpc::{RpcConfig, RpcProvider},
    },
};
use futures::{Stream, StreamExt};
use serde::Deserialize;

/// Provider as configured: one entry per upstream node, RPC or P2P.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Rpc(RpcConfig),
    P2p(P2pConfig),
}

/// Statically dispatched provider wrapper so RPC and P2P nodes can share one connection manager.
#[derive(Clone)]
pub enum AnyProvider {
    Rpc(RpcProvider),
    P2p(P2pProvider),
}

macro_rules! delegate {
    ($self:ident, $provider:ident => $body:expr) => {
        match $self {
            AnyProvider::Rpc($provider) => $body,
            AnyProvider::P2p($provider) => $body,
        }
    };
}

impl NetworkProvider for AnyProvider {
    fn uniq_name(&self) -> &str {
        delegate!(self, provider => provider.uniq_name())
    }

    fn kind(&self) -> ProviderKind {
        delegate!(self, provider => provider.kind())
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        delegate!(self, provider => provider.connect().await)
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        delegate!(self, provider => provider.disconnect().await)
    }

    async fn get_block_height(&self) -> Result<u32, ProviderError> {
        delegate!(self, provider => provider.get_block_height().await)
    }

    async fn get_many_block_hashes_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        delegate!(self, provider => provider.get_many_block_hashes_by_heights(heights).await)
    }

    async fn get_many_blocks_by_heights(
        &self,
        heights: &[u32],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        delegate!(self, provider => provider.get_many_blocks_by_heights(heights, verbosity).await)
    }

    async fn get_many_blocks_hex_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        delegate!(self, provider => provider.get_many_blocks_hex_by_heights(heights).await)
    }

    async fn get_many_blocks_by_hashes(
        &self,
        hashes: &[String],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        delegate!(self, provider => provider.get_many_blocks_by_hashes(hashes, verbosity).await)
    }

    async fn get_many_blocks_hex_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        delegate!(self, provider => provider.get_many_blocks_hex_by_hashes(hashes).await)
    }

    async fn get_heights_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<u32>>, ProviderError> {
        delegate!(self, provider => provider.get_heights_by_hashes(hashes).await)
    }

    async fn get_many_blocks_stats_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
        delegate!(self, provider => provider.get_many_blocks_stats_by_heights(heights).await)
    }

    async fn get_many_blocks_stats_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
        delegate!(self, provider => provider.get_many_blocks_stats_by_hashes(hashes).await)
    }

    async fn get_many_transactions_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<UniversalTransaction>>, ProviderError> {
        delegate!(self, provider => provider.get_many_transactions_by_txids(txids).await)
    }

    async fn get_many_transactions_hex_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        delegate!(self, provider => provider.get_many_transactions_hex_by_txids(txids).await)
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, ProviderError> {
        delegate!(self, provider => provider.get_blockchain_info().await)
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        delegate!(self, provider => provider.get_network_info().await)
    }

    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<FeeEstimate, ProviderError> {
        delegate!(self, provider => provider.estimate_smart_fee(conf_target).await)
    }

    fn subscribe_to_new_blocks(
        &self,
    ) -> impl Stream<Item = Result<BlockEvent, ProviderError>> + Send {
        match self {
            AnyProvider::Rpc(provider) => provider.subscribe_to_new_blocks().left_stream(),
            AnyProvider::P2p(provider) => provider.subscribe_to_new_blocks().right_stream(),
        }
    }
}
