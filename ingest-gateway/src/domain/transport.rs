// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use ingest_common::{domain::Envelope, error::BoxError};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Settings shared by all transports.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Upper bound on one serialized outbound envelope.
    #[serde(with = "byte_unit_serde", default = "max_message_bytes_default")]
    pub max_message_bytes: u64,

    /// How long the sender waits for an outbox batch ACK.
    #[serde(with = "humantime_serde", default = "ack_timeout_default")]
    pub ack_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: max_message_bytes_default(),
            ack_timeout: ack_timeout_default(),
        }
    }
}

fn max_message_bytes_default() -> u64 {
    8_388_608
}

fn ack_timeout_default() -> Duration {
    Duration::from_secs(10)
}

/// Contract shared by the HTTP, WebSocket and IPC transports: deliver envelopes to the one bound
/// downstream consumer and report its heartbeat-derived liveness. Inbound ACK and query frames
/// are routed internally to the ACK registry and the query bus.
#[trait_variant::make(Send)]
pub trait Transport
where
    Self: Clone + Send + Sync + 'static,
{
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    fn is_online(&self) -> bool;

    /// Busy-poll until the consumer is online or the deadline passes, accelerating the heartbeat
    /// while waiting.
    async fn wait_for_online(&self, deadline: Duration) -> Result<(), TransportError>;

    /// Stop background tasks and reject all pending ACK waiters.
    async fn destroy(&self);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o failed")]
    Io(#[source] BoxError),

    #[error("no consumer connected")]
    NotConnected,

    #[error("message of {size} bytes exceeds the {max_bytes} byte limit")]
    OversizedMessage { size: u64, max_bytes: u64 },

    #[error("no ACK within {0:?}")]
    AckTimeout(Duration),

    #[error("transport closed")]
    Closed,

    #[error("consumer not online within {0:?}")]
    NotOnline(Duration),

    #[error("invalid transport configuration: {0}")]
    Config(String),
}
