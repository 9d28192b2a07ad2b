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
    BlockBatchConsumer, BlockLoader, BlockQueue, IteratorConfig, IteratorWaker, LoaderConfig,
    NetworkConfig, NetworkProvider, ProviderConnectionManager, QueueConfig, QueueIterator,
};
use anyhow::Context;
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use tokio::{select, signal::unix::Signal, sync::Mutex, task};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    /// First height to ingest; unset starts at genesis.
    #[serde(default)]
    pub start_height: Option<u32>,

    #[serde(rename = "queue", default)]
    pub queue_config: QueueConfig,

    #[serde(rename = "loader", default)]
    pub loader_config: LoaderConfig,

    #[serde(rename = "iterator", default)]
    pub iterator_config: IteratorConfig,
}

/// Run the ingestion pipeline: connect the provider manager, then drive the loader (provider →
/// queue) and the iterator (queue → consumer) until one of them stops or SIGTERM arrives.
pub async fn run<P, C>(
    config: Config,
    providers: Vec<P>,
    consumer: C,
    waker: IteratorWaker,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    P: NetworkProvider,
    C: BlockBatchConsumer,
{
    let Config {
        network,
        start_height,
        queue_config,
        loader_config,
        iterator_config,
    } = config;

    // Startup fails fast if no provider connects.
    let mut manager =
        ProviderConnectionManager::new(providers).context("create provider connection manager")?;
    manager
        .connect()
        .await
        .context("connect to an upstream provider")?;
    let manager = Arc::new(Mutex::new(manager));

    let last_height = start_height.and_then(|height| height.checked_sub(1));
    let queue = Arc::new(BlockQueue::new(queue_config, last_height));
    info!(start_height:?, last_height:?; "starting block ingestion");

    let loader_task = task::spawn({
        let mut loader = BlockLoader::new(loader_config, network, manager, queue.clone());

        async move {
            loader.run().await.context("block loader failed")?;

            // Normal completion only happens once the configured max height is reached.
            info!("loader_task completed");
            Ok::<_, anyhow::Error>(())
        }
    });

    let iterator_task = task::spawn({
        let mut iterator = QueueIterator::with_waker(iterator_config, queue, consumer, waker);

        async move {
            iterator.run().await;

            warn!("iterator_task completed");
            Ok::<_, anyhow::Error>(())
        }
    });

    select! {
        result = loader_task => result
            .context("loader_task panicked")
            .and_then(|r| r.context("loader_task failed")),

        result = iterator_task => result
            .context("iterator_task panicked")
            .and_then(|r| r.context("iterator_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}
