// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use chain_ingest::{
    domain::{Block, BlockBatchConsumer, ConsumerError, IteratorWaker},
    infra::{AnyProvider, ProviderConfig},
};
use ingest_common::{
    config::ConfigExt,
    domain::{LocalEventBus, QueryBus, WireEventRecord, now_millis},
    telemetry,
};
use ingest_gateway::{
    domain::{
        AckRegistry, OutboxBatchSender, OutboxPublisher, SubscriberBridge, Transport,
    },
    infra::{TransportSelection, http::HttpTransport, ipc::IpcTransport, ws::WsTransport},
};
use log::{error, info};
use serde::Deserialize;
use std::{panic, time::Duration};
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() {
    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run().await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Config {
    #[serde(rename = "chain")]
    chain_config: chain_ingest::application::Config,

    #[serde(rename = "gateway")]
    gateway_config: ingest_gateway::application::Config,

    providers: Vec<ProviderConfig>,

    /// The `model_name` outgoing block events are filed under.
    #[serde(default = "block_model_name_default")]
    block_model_name: String,

    #[serde(rename = "telemetry")]
    telemetry_config: telemetry::Config,
}

fn block_model_name_default() -> String {
    "blocks".to_string()
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load().context("load configuration")?;
    info!(config:?; "starting");
    let Config {
        chain_config,
        gateway_config,
        providers,
        block_model_name,
        telemetry_config,
    } = config;

    telemetry::init_metrics(telemetry_config.metrics_config);

    let providers = providers
        .into_iter()
        .map(|provider_config| match provider_config {
            ProviderConfig::Rpc(rpc_config) => {
                chain_ingest::infra::rpc::RpcProvider::new(rpc_config)
                    .map(AnyProvider::Rpc)
                    .map_err(anyhow::Error::from)
            }

            ProviderConfig::P2p(p2p_config) => Ok(AnyProvider::P2p(
                chain_ingest::infra::p2p::P2pProvider::new(p2p_config, &chain_config.network),
            )),
        })
        .collect::<Result<Vec<_>, _>>()
        .context("create network providers")?;

    let bus = LocalEventBus::default();
    let acks = AckRegistry::new();
    let query_bus = QueryBus::new();
    query_bus.register("HealthCheck", |_| async move {
        Ok(serde_json::json!({ "status": "ok" }))
    });

    let ingest_gateway::application::Config {
        transport_config,
        sender_config,
        endpoint,
    } = gateway_config;

    match endpoint {
        TransportSelection::Http(http_config) => {
            let transport =
                HttpTransport::new(http_config, &transport_config, query_bus, acks.clone())
                    .context("create HTTP transport")?;
            transport.serve().await.context("serve HTTP transport")?;

            run_pipeline(
                transport,
                chain_config,
                providers,
                sender_config,
                transport_config,
                block_model_name,
                bus,
                acks,
            )
            .await
        }

        TransportSelection::Ws(ws_config) => {
            let transport =
                WsTransport::new(ws_config, &transport_config, query_bus, acks.clone());
            transport
                .serve()
                .await
                .context("serve WebSocket transport")?;

            run_pipeline(
                transport,
                chain_config,
                providers,
                sender_config,
                transport_config,
                block_model_name,
                bus,
                acks,
            )
            .await
        }

        TransportSelection::Ipc(ipc_config) => {
            let transport =
                IpcTransport::spawn_child(ipc_config, &transport_config, query_bus, acks.clone())
                    .context("spawn IPC consumer")?;

            run_pipeline(
                transport,
                chain_config,
                providers,
                sender_config,
                transport_config,
                block_model_name,
                bus,
                acks,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline<T>(
    transport: T,
    chain_config: chain_ingest::application::Config,
    providers: Vec<AnyProvider>,
    sender_config: ingest_gateway::domain::SenderConfig,
    transport_config: ingest_gateway::domain::TransportConfig,
    block_model_name: String,
    bus: LocalEventBus,
    acks: AckRegistry,
) -> anyhow::Result<()>
where
    T: Transport,
{
    let sender = OutboxBatchSender::new(
        sender_config,
        &transport_config,
        transport.clone(),
        bus.clone(),
        acks,
    );
    let publisher = OutboxPublisher::new(sender.clone(), bus.clone());

    let waker = IteratorWaker::new();
    let consumer = OutboxBlockConsumer {
        transport,
        publisher,
        waker: waker.clone(),
        block_model_name,
    };

    let bridge = SubscriberBridge::new(bus);
    bridge.on_event(|event| async move {
        info!(
            event_type = event.event_type,
            block_height = event.block_height;
            "system event observed"
        );
        Ok::<_, ingest_common::error::BoxError>(())
    });

    let sigterm_chain =
        signal(SignalKind::terminate()).context("SIGTERM handler can be registered")?;
    let sigterm_gateway =
        signal(SignalKind::terminate()).context("SIGTERM handler can be registered")?;

    tokio::try_join!(
        chain_ingest::application::run(chain_config, providers, consumer, waker, sigterm_chain),
        ingest_gateway::application::run(bridge, sigterm_gateway),
    )?;

    Ok(())
}

/// Turns drained block batches into outbox wire records and streams them with ACK; the iterator
/// is woken once the batch is acknowledged.
#[derive(Clone)]
struct OutboxBlockConsumer<T> {
    transport: T,
    publisher: OutboxPublisher<T>,
    waker: IteratorWaker,
    block_model_name: String,
}

const ONLINE_DEADLINE: Duration = Duration::from_secs(30);

impl<T> BlockBatchConsumer for OutboxBlockConsumer<T>
where
    T: Transport,
{
    type Error = ConsumerError;

    async fn handle_batch(&self, batch: &[Block], request_id: &str) -> Result<(), Self::Error> {
        self.transport
            .wait_for_online(ONLINE_DEADLINE)
            .await
            .map_err(|error| ConsumerError(error.into()))?;

        let events = batch
            .iter()
            .map(|block| {
                Ok(WireEventRecord {
                    model_name: self.block_model_name.clone(),
                    event_type: "BlockAdded".to_string(),
                    event_version: 1,
                    request_id: request_id.to_string(),
                    block_height: block.height,
                    payload: serde_json::to_string(block)?,
                    timestamp: now_millis(),
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .map_err(|error| ConsumerError(error.into()))?;

        self.publisher
            .publish_wire_stream_batch_with_ack(&events)
            .await
            .map_err(|error| ConsumerError(error.into()))?;

        self.waker.resolve_next_batch();
        Ok(())
    }
}
