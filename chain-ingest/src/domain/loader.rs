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

use crate::domain::{
    BlockInfo, BlockNormalizer, BlockQueue, ConnectionManagerError, MerkleError, NetworkConfig,
    NetworkProvider, NormalizeError, ProviderConnectionManager, ProviderError, QueueError,
    verify_block_merkle,
};
use ingest_common::error::StdErrorExt;
use log::{debug, info, warn};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};

/// Hex doubles the raw size; the envelope adds roughly another 10%.
const REPLY_SIZE_FACTOR: f64 = 2.1;

/// Ratio thresholds and factors for the latency-driven preload tuning.
const TUNE_UP_RATIO: f64 = 1.2;
const TUNE_UP_FACTOR: f64 = 1.25;
const TUNE_DOWN_RATIO: f64 = 0.8;
const TUNE_DOWN_FACTOR: f64 = 0.75;

/// Transport retries of one fetch before the error propagates to the main loop.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(50);

const IDLE_DELAY: Duration = Duration::from_secs(1);
const BACKOFF_MIN: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    /// Budget for the expected reply size of one batched hex fetch.
    #[serde(with = "byte_unit_serde", default = "max_rpc_reply_bytes_default")]
    pub max_rpc_reply_bytes: u64,

    /// Initial number of block infos preloaded per round; self-tunes at runtime.
    #[serde(default = "base_preload_count_default")]
    pub base_preload_count: usize,

    /// Hard ceiling for the self-tuned preload count to bound memory.
    #[serde(default = "max_preload_ceiling_default")]
    pub max_preload_ceiling: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_rpc_reply_bytes: max_rpc_reply_bytes_default(),
            base_preload_count: base_preload_count_default(),
            max_preload_ceiling: max_preload_ceiling_default(),
        }
    }
}

fn max_rpc_reply_bytes_default() -> u64 {
    10_485_760
}

fn base_preload_count_default() -> usize {
    100
}

fn max_preload_ceiling_default() -> usize {
    2_000
}

/// Pull-strategy block loader: preloads block stats, fetches block bodies in reply-size-budgeted
/// hex batches, verifies Merkle roots and enqueues into the bounded queue. Holds a non-owning
/// reference to the connection manager and exclusive ownership of its preload buffer.
pub struct BlockLoader<P> {
    manager: Arc<Mutex<ProviderConnectionManager<P>>>,
    queue: Arc<BlockQueue>,
    normalizer: BlockNormalizer,
    has_segwit: bool,
    max_rpc_reply_bytes: u64,
    max_preload_ceiling: usize,
    preload: Vec<BlockInfo>,
    max_preload_count: usize,
    last_load_duration: Duration,
    previous_load_duration: Duration,
}

impl<P> BlockLoader<P>
where
    P: NetworkProvider,
{
    pub fn new(
        config: LoaderConfig,
        network: NetworkConfig,
        manager: Arc<Mutex<ProviderConnectionManager<P>>>,
        queue: Arc<BlockQueue>,
    ) -> Self {
        let LoaderConfig {
            max_rpc_reply_bytes,
            base_preload_count,
            max_preload_ceiling,
        } = config;

        Self {
            manager,
            queue,
            has_segwit: network.has_segwit,
            normalizer: BlockNormalizer::new(network),
            max_rpc_reply_bytes,
            max_preload_ceiling,
            preload: Vec::new(),
            max_preload_count: base_preload_count.clamp(1, max_preload_ceiling),
            last_load_duration: Duration::ZERO,
            previous_load_duration: Duration::ZERO,
        }
    }

    /// Main loop: tick until the configured maximum height is reached, converting retriable
    /// errors (queue full, merkle mismatch, transport) into exponential-backoff waits.
    pub async fn run(&mut self) -> Result<(), LoaderError> {
        let mut backoff = BACKOFF_MIN;

        loop {
            match self.tick().await {
                Ok(TickOutcome::MaxHeightReached) => {
                    info!(
                        max_block_height = self.queue.max_block_height();
                        "maximum block height reached, loader stopping"
                    );
                    return Ok(());
                }

                Ok(_) => {
                    backoff = BACKOFF_MIN;
                    sleep(IDLE_DELAY).await;
                }

                Err(error) if error.is_retriable() => {
                    debug!(error = error.display_chain(), backoff:?; "retriable loader error");
                    metrics::counter!("loader_retries").increment(1);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }

                Err(error) => return Err(error),
            }
        }
    }

    /// One loop iteration as described by the pull strategy.
    pub async fn tick(&mut self) -> Result<TickOutcome, LoaderError> {
        if self.queue.is_max_height_reached() {
            return Ok(TickOutcome::MaxHeightReached);
        }

        if self.queue.is_full() {
            return Err(LoaderError::Queue(QueueError::Full {
                current_size: self.queue.current_size(),
                block_size: self.queue.block_size(),
                max_queue_size: self.queue.max_queue_size(),
            }));
        }

        if self.preload.is_empty() {
            let network_height = self.fetch_network_height().await?;
            self.preload_blocks_info(network_height).await?;
        }

        if self.queue.is_overloaded(self.max_rpc_reply_bytes) {
            return Ok(TickOutcome::Overloaded);
        }

        if self.preload.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        self.load_and_enqueue_blocks().await?;
        Ok(TickOutcome::Loaded)
    }

    /// Fill the preload buffer with stats for the next heights, self-tuning the preload count
    /// from the ratio of the last two observed load durations.
    async fn preload_blocks_info(&mut self, network_height: u32) -> Result<(), LoaderError> {
        self.tune_preload_count();

        let last_height = self.queue.last_height().map(i64::from).unwrap_or(-1);
        let remaining = i64::from(network_height) - last_height;
        let count = (self.max_preload_count as i64).min(remaining);
        if count <= 0 {
            return Ok(());
        }

        let from = (last_height + 1) as u32;
        let heights = (from..from + count as u32).collect::<Vec<_>>();

        let stats = self
            .fetch_with_failover("get_many_blocks_stats_by_heights", |provider| {
                let heights = heights.clone();
                async move { provider.get_many_blocks_stats_by_heights(&heights).await }
            })
            .await?;

        for (height, stat) in heights.iter().zip(stats) {
            // A missing stat for a height at or below the reported network height is a
            // programmer error on the provider side.
            let stat = stat.ok_or(LoaderError::MissingBlockStats { height: *height })?;

            self.preload.push(BlockInfo {
                hash: stat.blockhash,
                size: stat.total_size.unwrap_or_else(|| self.queue.block_size()),
                height: stat.height,
            });
        }

        debug!(
            from,
            count,
            max_preload_count = self.max_preload_count;
            "block infos preloaded"
        );

        Ok(())
    }

    fn tune_preload_count(&mut self) {
        let previous = self.previous_load_duration.as_millis() as f64;
        let current = self.last_load_duration.as_millis() as f64;
        if previous <= 0.0 || current <= 0.0 {
            return;
        }

        let ratio = current / previous;
        let tuned = if ratio > TUNE_UP_RATIO {
            (self.max_preload_count as f64 * TUNE_UP_FACTOR).round() as usize
        } else if ratio < TUNE_DOWN_RATIO {
            ((self.max_preload_count as f64 * TUNE_DOWN_FACTOR).round() as usize).max(1)
        } else {
            return;
        };

        self.max_preload_count = tuned.clamp(1, self.max_preload_ceiling);
    }

    /// Fetch one reply-size-budgeted batch via the hex path, verify Merkle roots and enqueue in
    /// ascending height order. On verification failure or missing blocks the whole batch returns
    /// to the preload buffer for a fresh fetch.
    async fn load_and_enqueue_blocks(&mut self) -> Result<(), LoaderError> {
        let started_at = Instant::now();

        // Descending by height so that pop() hands out the next-earliest height.
        self.preload
            .sort_by(|a, b| b.height.cmp(&a.height));

        let mut batch = Vec::new();
        let mut predicted = 0u64;
        while let Some(info) = self.preload.pop() {
            let predicted_info = (info.size as f64 * REPLY_SIZE_FACTOR) as u64;

            if !batch.is_empty() && predicted + predicted_info > self.max_rpc_reply_bytes {
                self.preload.push(info);
                break;
            }

            predicted += predicted_info;
            batch.push(info);
        }

        if batch.is_empty() {
            return Ok(());
        }

        let heights = batch.iter().map(|info| info.height).collect::<Vec<_>>();
        let blocks = match self
            .fetch_with_failover("get_many_blocks_hex_by_heights", |provider| {
                let heights = heights.clone();
                async move { provider.get_many_blocks_hex_by_heights(&heights).await }
            })
            .await
        {
            Ok(blocks) => blocks,

            Err(error) => {
                self.restore_preload(&batch);
                return Err(error);
            }
        };

        let mut loaded = Vec::with_capacity(batch.len());
        for (info, block) in batch.iter().zip(blocks) {
            let Some(block) = block else {
                warn!(height = info.height; "block missing upstream, batch will be refetched");
                self.restore_preload(&batch);
                return Ok(());
            };

            if let Err(error) = verify_block_merkle(&block, self.has_segwit) {
                self.restore_preload(&batch);
                return Err(error.into());
            }

            loaded.push(self.normalizer.normalize_block(&block)?);
        }

        loaded.sort_by_key(|block| block.height);

        let mut enqueued = 0usize;
        for block in loaded {
            // Skip already-covered heights, e.g. after a partial batch retry.
            if self
                .queue
                .last_height()
                .is_some_and(|last| block.height <= last)
            {
                continue;
            }

            let height = block.height;
            if let Err(error) = self.queue.enqueue(block) {
                if error.is_retriable() {
                    // Queue filled up mid-batch: keep the rest for the next round.
                    let not_enqueued = batch
                        .iter()
                        .filter(|info| info.height >= height)
                        .cloned()
                        .collect::<Vec<_>>();
                    self.restore_preload(&not_enqueued);
                }
                return Err(error.into());
            }
            enqueued += 1;
        }

        self.previous_load_duration = self.last_load_duration;
        self.last_load_duration = started_at.elapsed();

        metrics::counter!("loader_blocks_loaded").increment(enqueued as u64);
        metrics::gauge!("block_queue_bytes").set(self.queue.current_size() as f64);
        metrics::gauge!("block_queue_length").set(self.queue.len() as f64);

        info!(
            enqueued,
            last_height:? = self.queue.last_height(),
            load_duration_ms = self.last_load_duration.as_millis() as u64;
            "blocks loaded and enqueued"
        );

        Ok(())
    }

    fn restore_preload(&mut self, infos: &[BlockInfo]) {
        self.preload.extend(infos.iter().cloned());
    }

    async fn fetch_network_height(&self) -> Result<u32, LoaderError> {
        self.fetch_with_failover("get_block_height", |provider| async move {
            provider.get_block_height().await
        })
        .await
    }

    /// Run the given provider call, reporting failures to the connection manager and retrying
    /// with the recovered or switched-to provider.
    async fn fetch_with_failover<T, F, Fut>(
        &self,
        method_name: &'static str,
        call: F,
    ) -> Result<T, LoaderError>
    where
        F: Fn(P) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut provider = self.manager.lock().await.get_active_provider()?;

        for attempt in 1..=FETCH_ATTEMPTS {
            match call(provider.clone()).await {
                Ok(value) => return Ok(value),

                Err(error) => {
                    warn!(
                        provider = provider.uniq_name(),
                        method_name,
                        attempt,
                        error = error.display_chain();
                        "provider call failed"
                    );

                    if attempt == FETCH_ATTEMPTS {
                        return Err(error.into());
                    }

                    let name = provider.uniq_name().to_string();
                    provider = self
                        .manager
                        .lock()
                        .await
                        .handle_provider_failure(&name, method_name)
                        .await?;
                    sleep(FETCH_RETRY_DELAY).await;
                }
            }
        }

        unreachable!("loop either returns a value or propagates the last error")
    }

    #[cfg(test)]
    fn preload_heights(&self) -> Vec<u32> {
        self.preload.iter().map(|info| info.height).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Loaded,
    Idle,
    Overloaded,
    MaxHeightReached,
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("provider call failed after repeated attempts")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    ConnectionManager(#[from] ConnectionManagerError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("no stats for block at height {height} although below network height")]
    MissingBlockStats { height: u32 },
}

impl LoaderError {
    /// Queue-full, merkle and transport failures resolve on retry; the rest are fatal.
    pub fn is_retriable(&self) -> bool {
        match self {
            LoaderError::Queue(error) => error.is_retriable(),
            LoaderError::Merkle(_) | LoaderError::Provider(_) => true,
            LoaderError::ConnectionManager(_)
            | LoaderError::Normalize(_)
            | LoaderError::MissingBlockStats { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{
        BlockEvent, BlockLoader, BlockQueue, BlockStats, BlockchainInfo, FeeEstimate, LoaderConfig,
        LoaderError, NetworkConfig, NetworkInfo, NetworkProvider, ProviderConnectionManager,
        ProviderError, ProviderKind, QueueConfig, QueueError, TickOutcome, UniversalBlock,
        UniversalTransaction, Verbosity,
    };
    use assert_matches::assert_matches;
    use bitcoin::hashes::Hash;
    use futures::Stream;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use tokio::sync::Mutex;

    fn make_chain(len: u32, block_size: u64) -> Vec<UniversalBlock> {
        let mut prev = bitcoin::BlockHash::all_zeros();
        let mut chain = Vec::new();

        for height in 0..len {
            let tx = bitcoin::Transaction {
                version: bitcoin::transaction::Version(2),
                lock_time: bitcoin::absolute::LockTime::ZERO,
                input: vec![bitcoin::TxIn {
                    previous_output: bitcoin::OutPoint::null(),
                    script_sig: bitcoin::script::Builder::new()
                        .push_int(height as i64)
                        .into_script(),
                    sequence: bitcoin::Sequence::MAX,
                    witness: bitcoin::Witness::new(),
                }],
                output: vec![bitcoin::TxOut {
                    value: bitcoin::Amount::from_sat(50),
                    script_pubkey: bitcoin::ScriptBuf::new(),
                }],
            };

            let block = bitcoin::Block {
                header: bitcoin::block::Header {
                    version: bitcoin::block::Version::from_consensus(2),
                    prev_blockhash: prev,
                    merkle_root: bitcoin::TxMerkleNode::from_raw_hash(
                        tx.compute_txid().to_raw_hash(),
                    ),
                    time: 1_600_000_000 + height,
                    bits: bitcoin::CompactTarget::from_consensus(0x1d00_ffff),
                    nonce: height,
                },
                txdata: vec![tx],
            };

            prev = block.block_hash();

            let mut universal = UniversalBlock::from_consensus(&block, Some(height));
            universal.size = block_size;
            universal.strippedsize = block_size;
            universal.weight = block_size * 4;
            chain.push(universal);
        }

        chain
    }

    #[derive(Clone)]
    struct ChainProvider {
        blocks: Arc<Vec<UniversalBlock>>,
        tamper_height: Option<u32>,
        failures_left: Arc<AtomicU32>,
    }

    impl ChainProvider {
        fn new(blocks: Vec<UniversalBlock>) -> Self {
            Self {
                blocks: Arc::new(blocks),
                tamper_height: None,
                failures_left: Arc::new(AtomicU32::new(0)),
            }
        }

        fn check_failure(&self) -> Result<(), ProviderError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ProviderError::Transport("injected".into()));
            }
            Ok(())
        }
    }

    impl NetworkProvider for ChainProvider {
        fn uniq_name(&self) -> &str {
            "chain"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Rpc
        }

        async fn connect(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn get_block_height(&self) -> Result<u32, ProviderError> {
            self.check_failure()?;
            Ok(self.blocks.len() as u32 - 1)
        }

        async fn get_many_blocks_stats_by_heights(
            &self,
            heights: &[u32],
        ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
            self.check_failure()?;

            Ok(heights
                .iter()
                .map(|&height| {
                    self.blocks.get(height as usize).map(|block| BlockStats {
                        blockhash: block.hash.clone(),
                        height,
                        total_size: Some(block.size),
                    })
                })
                .collect())
        }

        async fn get_many_blocks_hex_by_heights(
            &self,
            heights: &[u32],
        ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
            self.check_failure()?;

            Ok(heights
                .iter()
                .map(|&height| {
                    self.blocks.get(height as usize).map(|block| {
                        let mut block = block.clone();
                        if self.tamper_height == Some(height) {
                            block.merkleroot = "11".repeat(32);
                        }
                        block
                    })
                })
                .collect())
        }

        async fn get_many_block_hashes_by_heights(
            &self,
            _heights: &[u32],
        ) -> Result<Vec<Option<String>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_many_blocks_by_heights(
            &self,
            _heights: &[u32],
            _verbosity: Verbosity,
        ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_many_blocks_by_hashes(
            &self,
            _hashes: &[String],
            _verbosity: Verbosity,
        ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_many_blocks_hex_by_hashes(
            &self,
            _hashes: &[String],
        ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_heights_by_hashes(
            &self,
            _hashes: &[String],
        ) -> Result<Vec<Option<u32>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_many_blocks_stats_by_hashes(
            &self,
            _hashes: &[String],
        ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_many_transactions_by_txids(
            &self,
            _txids: &[String],
        ) -> Result<Vec<Option<UniversalTransaction>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_many_transactions_hex_by_txids(
            &self,
            _txids: &[String],
        ) -> Result<Vec<Option<String>>, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_blockchain_info(&self) -> Result<BlockchainInfo, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        async fn estimate_smart_fee(
            &self,
            _conf_target: u32,
        ) -> Result<FeeEstimate, ProviderError> {
            unimplemented!("not used by loader tests")
        }

        fn subscribe_to_new_blocks(
            &self,
        ) -> impl Stream<Item = Result<BlockEvent, ProviderError>> + Send {
            futures::stream::empty()
        }
    }

    async fn loader(
        provider: ChainProvider,
        queue_config: QueueConfig,
        loader_config: LoaderConfig,
    ) -> (BlockLoader<ChainProvider>, Arc<BlockQueue>) {
        let mut manager = ProviderConnectionManager::new(vec![provider]).expect("manager");
        manager.connect().await.expect("provider connects");

        let queue = Arc::new(BlockQueue::new(queue_config, None));
        let loader = BlockLoader::new(
            loader_config,
            NetworkConfig::default(),
            Arc::new(Mutex::new(manager)),
            queue.clone(),
        );

        (loader, queue)
    }

    #[tokio::test]
    async fn test_load_until_caught_up() {
        let provider = ChainProvider::new(make_chain(5, 400));
        let (mut loader, queue) = loader(
            provider,
            QueueConfig::default(),
            LoaderConfig::default(),
        )
        .await;

        assert_matches!(loader.tick().await, Ok(TickOutcome::Loaded));
        assert_eq!(queue.last_height(), Some(4));
        assert_eq!(queue.len(), 5);

        // Caught up: nothing left to preload.
        assert_matches!(loader.tick().await, Ok(TickOutcome::Idle));
    }

    #[tokio::test]
    async fn test_queue_full_backpressure() {
        // Three 400 byte blocks against a 1000 byte queue: two fit, the third needs a drain.
        let provider = ChainProvider::new(make_chain(3, 400));
        let queue_config = QueueConfig {
            max_queue_size: 1_000,
            block_size: 400,
            max_block_height: u32::MAX,
        };
        let loader_config = LoaderConfig {
            max_rpc_reply_bytes: 3_000,
            ..LoaderConfig::default()
        };
        let (mut loader, queue) = loader(provider, queue_config, loader_config).await;

        loader.preload_blocks_info(2).await.expect("stats preload");
        let error = loader
            .load_and_enqueue_blocks()
            .await
            .expect_err("third block exceeds the queue budget");
        assert_matches!(&error, LoaderError::Queue(QueueError::Full { .. }));
        assert!(error.is_retriable());
        assert_eq!(queue.last_height(), Some(1));
        assert_eq!(loader.preload_heights(), vec![2]);

        // Drain one block, then the retry succeeds.
        let drained = queue.get_batch_up_to_size(400);
        assert_eq!(drained.len(), 1);

        loader
            .load_and_enqueue_blocks()
            .await
            .expect("third block fits after drain");
        assert_eq!(queue.last_height(), Some(2));
    }

    #[tokio::test]
    async fn test_merkle_mismatch_rejects_batch() {
        let mut provider = ChainProvider::new(make_chain(3, 400));
        provider.tamper_height = Some(1);

        let (mut loader, queue) = loader(
            provider,
            QueueConfig::default(),
            LoaderConfig::default(),
        )
        .await;

        loader.preload_blocks_info(2).await.expect("stats preload");
        let error = loader
            .load_and_enqueue_blocks()
            .await
            .expect_err("tampered block fails verification");
        assert_matches!(&error, LoaderError::Merkle(_));
        assert!(error.is_retriable());

        // Nothing enqueued, the whole batch returns to the preload buffer for a fresh fetch.
        assert_eq!(queue.last_height(), None);
        let mut heights = loader.preload_heights();
        heights.sort_unstable();
        assert_eq!(heights, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_reply_size_budget_bounds_batch() {
        // 400 byte blocks predict 840 bytes each; a 1000 byte budget holds exactly one.
        let provider = ChainProvider::new(make_chain(3, 400));
        let loader_config = LoaderConfig {
            max_rpc_reply_bytes: 1_000,
            ..LoaderConfig::default()
        };
        let (mut loader, queue) = loader(provider, QueueConfig::default(), loader_config).await;

        loader.preload_blocks_info(2).await.expect("stats preload");
        loader.load_and_enqueue_blocks().await.expect("one block loads");

        assert_eq!(queue.last_height(), Some(0));
        assert_eq!(loader.preload_heights(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_transport_failure_recovers_via_manager() {
        let provider = ChainProvider::new(make_chain(2, 400));
        provider.failures_left.store(2, Ordering::SeqCst);

        let (loader, _queue) = loader(
            provider,
            QueueConfig::default(),
            LoaderConfig::default(),
        )
        .await;

        // Two injected transport failures are absorbed by reconnect-and-retry.
        let height = loader.fetch_network_height().await.expect("height fetched");
        assert_eq!(height, 1);
    }

    #[tokio::test]
    async fn test_preload_tuning() {
        let provider = ChainProvider::new(make_chain(2, 400));
        let (mut loader, _queue) = loader(
            provider,
            QueueConfig::default(),
            LoaderConfig {
                max_preload_ceiling: 110,
                ..LoaderConfig::default()
            },
        )
        .await;

        // Slower than before: grow by 25%.
        loader.previous_load_duration = std::time::Duration::from_millis(100);
        loader.last_load_duration = std::time::Duration::from_millis(150);
        loader.tune_preload_count();
        assert_eq!(loader.max_preload_count, 110); // 125 clamped to the ceiling

        // Faster than before: shrink by 25%.
        loader.previous_load_duration = std::time::Duration::from_millis(150);
        loader.last_load_duration = std::time::Duration::from_millis(100);
        loader.tune_preload_count();
        assert_eq!(loader.max_preload_count, 83);

        // Stable ratio: unchanged.
        loader.previous_load_duration = std::time::Duration::from_millis(100);
        loader.last_load_duration = std::time::Duration::from_millis(100);
        loader.tune_preload_count();
        assert_eq!(loader.max_preload_count, 83);
    }
}
