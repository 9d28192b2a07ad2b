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

use crate::domain::WireEventRecord;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Wire actions. Responses mirror the request's correlation ID; the request ID is an opaque echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    QueryRequest,
    QueryResponse,
    OutboxStreamBatch,
    OutboxStreamAck,
    Ping,
    Pong,
    RpcRequest,
    RpcResponse,
    RegisterStreamConsumer,
}

/// Sender-minted opaque ID a receiver must mirror on the matching response frame.
pub type CorrelationId = Uuid;

/// The wire message: JSON object with an action, an action-specific payload and optional IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,

    pub timestamp: u64,
}

impl Envelope {
    /// Create an envelope with a freshly minted correlation ID.
    pub fn request(
        action: Action,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            action,
            payload: Some(serde_json::to_value(payload)?),
            request_id: None,
            correlation_id: Some(Uuid::now_v7()),
            timestamp: now_millis(),
        })
    }

    /// Create an envelope answering the given one, mirroring its request and correlation IDs.
    pub fn response_to(
        request: &Envelope,
        action: Action,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            action,
            payload: Some(serde_json::to_value(payload)?),
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id,
            timestamp: now_millis(),
        })
    }

    /// Deserialize the payload into the action-specific type.
    pub fn payload_as<T>(&self) -> Result<T, EnvelopeError>
    where
        T: DeserializeOwned,
    {
        let payload = self.payload.clone().ok_or(EnvelopeError::MissingPayload)?;
        serde_json::from_value(payload).map_err(EnvelopeError::InvalidPayload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope has no payload")]
    MissingPayload,

    #[error("envelope payload has invalid shape")]
    InvalidPayload(#[source] serde_json::Error),
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequestPayload {
    pub name: String,

    #[serde(default)]
    pub dto: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponsePayload {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStreamBatchPayload {
    pub events: Vec<WireEventRecord>,
}

/// ACK for an outbox batch. `all_ok = false` without `ok_indices` means a total batch failure.
/// The `ok` alias covers the service-layer shape `{ok, okIndices}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStreamAckPayload {
    #[serde(alias = "ok")]
    pub all_ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok_indices: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub ts: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequestPayload {
    pub method: String,

    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponsePayload {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[cfg(test)]
mod tests {
    use crate::domain::{
        Action, Envelope, OutboxStreamAckPayload, QueryRequestPayload, QueryResponsePayload,
    };
    use assert_matches::assert_matches;

    #[test]
    fn test_response_mirrors_ids() {
        let request = Envelope {
            action: Action::QueryRequest,
            payload: Some(serde_json::json!({ "name": "GetBlock", "dto": { "height": 7 } })),
            request_id: Some("req-1".to_string()),
            correlation_id: Some(uuid::Uuid::now_v7()),
            timestamp: 1,
        };

        let response = Envelope::response_to(
            &request,
            Action::QueryResponse,
            &QueryResponsePayload {
                ok: true,
                data: None,
                err: None,
            },
        )
        .expect("response can be built");

        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.action, Action::QueryResponse);
    }

    #[test]
    fn test_payload_as() {
        let envelope = Envelope {
            action: Action::QueryRequest,
            payload: Some(serde_json::json!({ "name": "GetBlock" })),
            request_id: None,
            correlation_id: None,
            timestamp: 0,
        };

        let payload = envelope.payload_as::<QueryRequestPayload>();
        assert_matches!(payload, Ok(p) if p.name == "GetBlock" && p.dto.is_null());
    }

    #[test]
    fn test_ack_service_layer_shape() {
        let ack =
            serde_json::from_str::<OutboxStreamAckPayload>(r#"{"ok": true, "okIndices": [0, 1]}"#)
                .expect("service-layer ACK shape can be parsed");

        assert!(ack.all_ok);
        assert_eq!(ack.ok_indices, Some(vec![0, 1]));
    }

    #[test]
    fn test_wire_action_names() {
        let json = serde_json::to_string(&Action::OutboxStreamAck).expect("action serializes");
        assert_eq!(json, r#""OutboxStreamAck""#);
    }
}
