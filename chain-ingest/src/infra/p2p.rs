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

mod headers;
mod peer;

pub use headers::{HeaderIndex, HeaderSyncError};
pub use peer::{Peer, PeerError};

use crate::domain::{
    BlockEvent, BlockStats, BlockchainInfo, FeeEstimate, NetworkConfig, NetworkInfo,
    NetworkProvider, ProviderError, ProviderKind, ProviderState, UniversalBlock,
    UniversalTransaction, UniversalTxEntry, Verbosity,
};
use async_stream::stream;
use bitcoin::{BlockHash, Txid, constants::genesis_block, p2p::Magic};
use futures::Stream;
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Mutex, broadcast};

/// The protocol returns at most this many headers per `getheaders`.
const MAX_HEADERS_PER_BATCH: usize = 2_000;

const PROTOCOL_VERSION: u64 = 70_016;

#[derive(Debug, Clone, Deserialize)]
pub struct P2pConfig {
    pub uniq_name: String,

    pub peers: Vec<SocketAddr>,

    #[serde(default = "max_peers_default")]
    pub max_peers: usize,

    #[serde(with = "humantime_serde", default = "connection_timeout_default")]
    pub connection_timeout: Duration,

    #[serde(with = "humantime_serde", default = "request_timeout_default")]
    pub request_timeout: Duration,

    #[serde(default = "header_sync_enabled_default")]
    pub header_sync_enabled: bool,

    /// Headers accepted per sync round, capped by the protocol maximum.
    #[serde(default = "header_sync_batch_size_default")]
    pub header_sync_batch_size: usize,

    /// Stop header sync at this height; unset syncs to the peer's tip.
    #[serde(default)]
    pub max_height: Option<u32>,
}

fn max_peers_default() -> usize {
    8
}

fn connection_timeout_default() -> Duration {
    Duration::from_secs(5)
}

fn request_timeout_default() -> Duration {
    Duration::from_secs(20)
}

fn header_sync_enabled_default() -> bool {
    true
}

fn header_sync_batch_size_default() -> usize {
    MAX_HEADERS_PER_BATCH
}

/// Peer-to-peer provider: a pool of handshaked peers, a header-sync subsystem resolving heights
/// to hashes and a `getdata`-driven block fetcher. Requests by hash translate directly; requests
/// by height resolve via the header map.
#[derive(Clone)]
pub struct P2pProvider {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: P2pConfig,
    network: bitcoin::Network,
    magic: Magic,
    headers: HeaderIndex,
    pool: Mutex<Vec<Peer>>,
    cursor: AtomicUsize,
    inv_tx: broadcast::Sender<BlockHash>,
    state: parking_lot::RwLock<ProviderState>,
}

impl P2pProvider {
    pub fn new(config: P2pConfig, network: &NetworkConfig) -> Self {
        let genesis = genesis_block(network.network).block_hash();
        let (inv_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                name: config.uniq_name.clone(),
                network: network.network,
                magic: Magic::from(network.network),
                headers: HeaderIndex::new(genesis, config.max_height),
                config,
                pool: Mutex::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                inv_tx,
                state: parking_lot::RwLock::new(ProviderState::Disconnected),
            }),
        }
    }

    /// Next alive peer in round-robin order, reconnecting the pool when it ran empty. The clone
    /// shares the connection, so the pool lock is not held across requests.
    async fn next_peer(&self) -> Result<Peer, ProviderError> {
        let mut pool = self.inner.pool.lock().await;
        pool.retain(|peer| {
            if peer.is_alive() {
                true
            } else {
                debug!(peer:% = peer.addr(); "dropping dead peer");
                peer.shutdown();
                false
            }
        });

        if pool.is_empty() {
            self.fill_pool(&mut pool).await;
        }

        if pool.is_empty() {
            *self.inner.state.write() = ProviderState::Disconnected;
            return Err(ProviderError::NotConnected);
        }

        let index = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[index].clone())
    }

    async fn fill_pool(&self, pool: &mut Vec<Peer>) {
        for addr in &self.inner.config.peers {
            if pool.len() >= self.inner.config.max_peers {
                break;
            }

            if pool.iter().any(|peer| peer.addr() == *addr) {
                continue;
            }

            match Peer::connect(
                *addr,
                self.inner.magic,
                self.inner.config.connection_timeout,
                self.inner.config.request_timeout,
                self.inner.inv_tx.clone(),
            )
            .await
            {
                Ok(peer) => pool.push(peer),
                Err(error) => warn!(peer:% = addr, error:%; "peer connect failed"),
            }
        }
    }

    /// Extend the header map towards the tip (or the configured ceiling). Returns the tip height.
    async fn sync_headers(&self) -> Result<u32, ProviderError> {
        if !self.inner.config.header_sync_enabled || self.inner.headers.is_complete() {
            return Ok(self.inner.headers.tip_height());
        }

        let batch_size = self
            .inner
            .config
            .header_sync_batch_size
            .clamp(1, MAX_HEADERS_PER_BATCH);

        loop {
            let (_, tip_hash) = self.inner.headers.tip();
            let headers = self
                .peer_request(|peer| async move { peer.get_headers(vec![tip_hash]).await })
                .await?;

            if headers.is_empty() {
                break;
            }

            let limit = headers.len().min(batch_size);
            let accepted = self
                .inner
                .headers
                .append(&headers[..limit])
                .map_err(|error| ProviderError::Decode(error.into()))?;

            debug!(accepted, tip = self.inner.headers.tip_height(); "headers synced");

            if accepted == 0 || self.inner.headers.is_complete() {
                break;
            }

            if headers.len() < MAX_HEADERS_PER_BATCH && limit == headers.len() {
                // Peer has no more headers: caught up with its tip.
                break;
            }
        }

        Ok(self.inner.headers.tip_height())
    }

    async fn peer_request<T, F, Fut>(&self, call: F) -> Result<T, ProviderError>
    where
        F: FnOnce(Peer) -> Fut,
        Fut: Future<Output = Result<T, PeerError>>,
    {
        let peer = self.next_peer().await?;

        call(peer)
            .await
            .map_err(|error| ProviderError::Transport(error.into()))
    }

    async fn fetch_blocks(
        &self,
        hashes: &[Option<BlockHash>],
    ) -> Result<Vec<Option<bitcoin::Block>>, ProviderError> {
        let wanted = hashes.iter().flatten().copied().collect::<Vec<_>>();
        if wanted.is_empty() {
            return Ok(vec![None; hashes.len()]);
        }

        let fetched = self
            .peer_request(|peer| {
                let wanted = wanted.clone();
                async move { peer.get_blocks(wanted).await }
            })
            .await?;

        let mut fetched = fetched.into_iter();
        Ok(hashes
            .iter()
            .map(|hash| match hash {
                None => None,
                Some(_) => fetched.next().flatten(),
            })
            .collect())
    }

    fn to_universal(
        &self,
        block: &bitcoin::Block,
        height: Option<u32>,
        verbosity: Verbosity,
    ) -> UniversalBlock {
        let mut universal = UniversalBlock::from_consensus(block, height);

        if verbosity == Verbosity::Summary {
            universal.tx = Some(
                block
                    .txdata
                    .iter()
                    .map(|tx| UniversalTxEntry::Id(tx.compute_txid().to_string()))
                    .collect(),
            );
        }

        universal
    }

    fn parse_hashes(hashes: &[String]) -> Result<Vec<BlockHash>, ProviderError> {
        hashes
            .iter()
            .map(|hash| {
                BlockHash::from_str(hash).map_err(|error| ProviderError::Decode(error.into()))
            })
            .collect()
    }
}

impl NetworkProvider for P2pProvider {
    fn uniq_name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::P2p
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        *self.inner.state.write() = ProviderState::Connecting;

        let mut pool = self.inner.pool.lock().await;
        self.fill_pool(&mut pool).await;
        if pool.is_empty() {
            *self.inner.state.write() = ProviderState::Disconnected;
            return Err(ProviderError::NotConnected);
        }
        let connected = pool.len();
        drop(pool);

        let tip = self.sync_headers().await?;
        *self.inner.state.write() = ProviderState::Connected;
        info!(provider = self.inner.name, peers = connected, tip; "p2p provider connected");

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        let mut pool = self.inner.pool.lock().await;
        for peer in pool.drain(..) {
            peer.shutdown();
        }
        *self.inner.state.write() = ProviderState::Disconnected;

        Ok(())
    }

    async fn get_block_height(&self) -> Result<u32, ProviderError> {
        self.sync_headers().await
    }

    async fn get_many_block_hashes_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        Ok(heights
            .iter()
            .map(|height| {
                self.inner
                    .headers
                    .hash_at(*height)
                    .map(|hash| hash.to_string())
            })
            .collect())
    }

    async fn get_many_blocks_by_heights(
        &self,
        heights: &[u32],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        self.sync_headers().await?;

        let hashes = heights
            .iter()
            .map(|height| self.inner.headers.hash_at(*height))
            .collect::<Vec<_>>();
        let blocks = self.fetch_blocks(&hashes).await?;

        Ok(heights
            .iter()
            .zip(blocks)
            .map(|(height, block)| {
                block.map(|block| self.to_universal(&block, Some(*height), verbosity))
            })
            .collect())
    }

    async fn get_many_blocks_hex_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        // P2P always transfers raw blocks; the hex path equals the full path.
        self.get_many_blocks_by_heights(heights, Verbosity::Full)
            .await
    }

    async fn get_many_blocks_by_hashes(
        &self,
        hashes: &[String],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        let parsed = Self::parse_hashes(hashes)?;
        let slots = parsed.iter().copied().map(Some).collect::<Vec<_>>();
        let blocks = self.fetch_blocks(&slots).await?;

        Ok(parsed
            .iter()
            .zip(blocks)
            .map(|(hash, block)| {
                block.map(|block| {
                    let height = self.inner.headers.height_of(hash);
                    self.to_universal(&block, height, verbosity)
                })
            })
            .collect())
    }

    async fn get_many_blocks_hex_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        self.get_many_blocks_by_hashes(hashes, Verbosity::Full)
            .await
    }

    async fn get_heights_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<u32>>, ProviderError> {
        let parsed = Self::parse_hashes(hashes)?;

        Ok(parsed
            .iter()
            .map(|hash| self.inner.headers.height_of(hash))
            .collect())
    }

    async fn get_many_blocks_stats_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
        self.sync_headers().await?;

        let hashes = heights
            .iter()
            .map(|height| self.inner.headers.hash_at(*height))
            .collect::<Vec<_>>();
        let blocks = self.fetch_blocks(&hashes).await?;

        Ok(heights
            .iter()
            .zip(blocks)
            .map(|(height, block)| {
                block.map(|block| BlockStats {
                    blockhash: block.block_hash().to_string(),
                    height: *height,
                    total_size: Some(block.total_size() as u64),
                })
            })
            .collect())
    }

    async fn get_many_blocks_stats_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
        let parsed = Self::parse_hashes(hashes)?;
        let slots = parsed.iter().copied().map(Some).collect::<Vec<_>>();
        let blocks = self.fetch_blocks(&slots).await?;

        Ok(parsed
            .iter()
            .zip(blocks)
            .map(|(hash, block)| {
                let height = self.inner.headers.height_of(hash)?;
                block.map(|block| BlockStats {
                    blockhash: hash.to_string(),
                    height,
                    total_size: Some(block.total_size() as u64),
                })
            })
            .collect())
    }

    async fn get_many_transactions_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<UniversalTransaction>>, ProviderError> {
        let parsed = txids
            .iter()
            .map(|txid| Txid::from_str(txid).map_err(|error| ProviderError::Decode(error.into())))
            .collect::<Result<Vec<_>, _>>()?;

        let transactions = self
            .peer_request(|peer| {
                let parsed = parsed.clone();
                async move { peer.get_transactions(parsed).await }
            })
            .await?;

        Ok(transactions
            .into_iter()
            .map(|tx| tx.map(|tx| UniversalTransaction::from_consensus(&tx)))
            .collect())
    }

    async fn get_many_transactions_hex_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let parsed = txids
            .iter()
            .map(|txid| Txid::from_str(txid).map_err(|error| ProviderError::Decode(error.into())))
            .collect::<Result<Vec<_>, _>>()?;

        let transactions = self
            .peer_request(|peer| {
                let parsed = parsed.clone();
                async move { peer.get_transactions(parsed).await }
            })
            .await?;

        Ok(transactions
            .into_iter()
            .map(|tx| tx.map(|tx| const_hex::encode(bitcoin::consensus::serialize(&tx))))
            .collect())
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, ProviderError> {
        let (height, hash) = self.inner.headers.tip();

        Ok(BlockchainInfo {
            chain: self.inner.network.to_string(),
            blocks: height,
            headers: height,
            bestblockhash: hash.to_string(),
        })
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        let connections = self.inner.pool.lock().await.len() as u32;

        Ok(NetworkInfo {
            version: PROTOCOL_VERSION,
            subversion: peer::USER_AGENT.to_string(),
            connections,
        })
    }

    async fn estimate_smart_fee(&self, _conf_target: u32) -> Result<FeeEstimate, ProviderError> {
        // Fee estimation needs mempool statistics only an RPC node exposes.
        Err(ProviderError::Unsupported("estimate_smart_fee"))
    }

    fn subscribe_to_new_blocks(
        &self,
    ) -> impl Stream<Item = Result<BlockEvent, ProviderError>> + Send {
        let provider = self.clone();
        let mut inv_rx = self.inner.inv_tx.subscribe();

        stream! {
            loop {
                match inv_rx.recv().await {
                    Ok(hash) => {
                        // An announced block extends the chain; sync headers to learn its height.
                        if let Err(error) = provider.sync_headers().await {
                            yield Err(error);
                            continue;
                        }

                        if let Some(height) = provider.inner.headers.height_of(&hash) {
                            yield Ok(BlockEvent {
                                height,
                                hash: hash.to_string(),
                            });
                        }
                    }

                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped; "block announcements lagged");
                    }

                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
