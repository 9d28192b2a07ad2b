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

use serde::{Deserialize, Serialize};

/// One outbox unit on the wire. The payload is an already-serialized JSON string; the record is
/// immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEventRecord {
    pub model_name: String,
    pub event_type: String,
    pub event_version: u32,
    pub request_id: String,
    pub block_height: u32,
    pub payload: String,
    pub timestamp: u64,
}

/// A system event re-emitted on the local bus after the carrying batch has been acknowledged.
/// Carries `event_type` as a plain field so downstream routing can switch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub event_version: u32,
    pub request_id: String,
    pub block_height: u32,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

impl SystemEvent {
    /// Build a system event from an acknowledged wire record by parsing its payload.
    pub fn from_wire(record: &WireEventRecord) -> Result<Self, serde_json::Error> {
        let payload = serde_json::from_str(&record.payload)?;

        Ok(Self {
            aggregate_id: record.model_name.clone(),
            event_type: record.event_type.clone(),
            event_version: record.event_version,
            request_id: record.request_id.clone(),
            block_height: record.block_height,
            timestamp: record.timestamp,
            payload,
        })
    }
}
