// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    domain::{SenderConfig, SubscriberBridge, TransportConfig},
    infra::TransportSelection,
};
use anyhow::Context;
use ingest_common::domain::Subscriber;
use log::warn;
use serde::Deserialize;
use tokio::{select, signal::unix::Signal, task};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "transport", default)]
    pub transport_config: TransportConfig,

    #[serde(rename = "sender", default)]
    pub sender_config: SenderConfig,

    /// The one transport binding the downstream consumer.
    pub endpoint: TransportSelection,
}

/// Run the gateway side: forward locally re-emitted system events to the registered handlers
/// until SIGTERM. The transports themselves serve on their own tasks, started during wiring.
pub async fn run<S>(bridge: SubscriberBridge<S>, mut sigterm: Signal) -> anyhow::Result<()>
where
    S: Subscriber,
{
    let bridge_task = task::spawn(async move {
        bridge.run().await;

        warn!("bridge_task completed");
        Ok::<_, anyhow::Error>(())
    });

    select! {
        result = bridge_task => result
            .context("bridge_task panicked")
            .and_then(|r| r.context("bridge_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}
