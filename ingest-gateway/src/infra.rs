// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

pub mod http;
pub mod ipc;
pub mod ws;

use serde::Deserialize;

/// Which transport binds the downstream consumer; exactly one per process.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSelection {
    Http(http::HttpConfig),
    Ws(ws::WsConfig),
    Ipc(ipc::IpcConfig),
}
