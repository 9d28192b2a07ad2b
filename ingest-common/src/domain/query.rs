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

use crate::{
    domain::{Action, Envelope, QueryRequestPayload, QueryResponsePayload},
    error::{BoxError, StdErrorExt},
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::{collections::HashMap, future::Future, sync::Arc};
use thiserror::Error;

type HandlerFn =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, BoxError>> + Send + Sync>;

/// Local query bus: named handlers registered at startup, dispatched by transports.
#[derive(Clone, Default)]
pub struct QueryBus {
    handlers: Arc<RwLock<HashMap<String, HandlerFn>>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the given query name. A later registration under the same name
    /// replaces the earlier one.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |dto| Box::pin(handler(dto)));
        self.handlers.write().insert(name.into(), handler);
    }

    /// Execute the named query with the given DTO.
    pub async fn execute(
        &self,
        name: &str,
        dto: serde_json::Value,
    ) -> Result<serde_json::Value, QueryError> {
        let handler = self
            .handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::HandlerNotFound(name.to_string()))?;

        handler(dto).await.map_err(QueryError::Handler)
    }

    /// Bridge a wire envelope to the bus, producing the response envelope with mirrored IDs.
    /// Invalid shapes and handler failures map to `{ok: false, err}` responses.
    pub async fn execute_envelope(&self, request: &Envelope) -> Envelope {
        let payload = match self.parse_request(request) {
            Ok(payload) => payload,
            Err(error) => return query_error_response(request, &error),
        };

        match self.execute(&payload.name, payload.dto).await {
            Ok(data) => Envelope::response_to(
                request,
                Action::QueryResponse,
                &QueryResponsePayload {
                    ok: true,
                    data: Some(data),
                    err: None,
                },
            )
            .unwrap_or_else(|_| {
                let error = QueryError::BadRequest("unserializable response".to_string());
                query_error_response(request, &error)
            }),

            Err(error) => query_error_response(request, &error),
        }
    }

    fn parse_request(&self, request: &Envelope) -> Result<QueryRequestPayload, QueryError> {
        if request.action != Action::QueryRequest {
            return Err(QueryError::BadRequest(format!(
                "expected QueryRequest, got {:?}",
                request.action
            )));
        }

        request
            .payload_as::<QueryRequestPayload>()
            .map_err(|error| QueryError::BadRequest(error.display_chain()))
    }
}

fn query_error_response(request: &Envelope, error: &QueryError) -> Envelope {
    let payload = QueryResponsePayload {
        ok: false,
        data: None,
        err: Some(error.display_chain()),
    };

    // QueryResponsePayload serialization is infallible.
    Envelope::response_to(request, Action::QueryResponse, &payload)
        .expect("query response payload serializes")
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query payload is invalid: {0}")]
    BadRequest(String),

    #[error("query handler not found: {0}")]
    HandlerNotFound(String),

    #[error("query handler failed")]
    Handler(#[source] BoxError),
}

#[cfg(test)]
mod tests {
    use crate::domain::{
        Action, Envelope, QueryBus, QueryError, QueryResponsePayload,
    };
    use assert_matches::assert_matches;

    fn bus_with_echo() -> QueryBus {
        let bus = QueryBus::new();
        bus.register("Echo", |dto| async move { Ok(dto) });
        bus
    }

    #[tokio::test]
    async fn test_execute() {
        let bus = bus_with_echo();

        let result = bus.execute("Echo", serde_json::json!({ "a": 1 })).await;
        assert_matches!(result, Ok(v) if v == serde_json::json!({ "a": 1 }));

        let result = bus.execute("Nope", serde_json::Value::Null).await;
        assert_matches!(result, Err(QueryError::HandlerNotFound(name)) if name == "Nope");
    }

    #[tokio::test]
    async fn test_execute_envelope() {
        let bus = bus_with_echo();

        let request = Envelope::request(
            Action::QueryRequest,
            &serde_json::json!({ "name": "Echo", "dto": { "x": true } }),
        )
        .expect("request can be built");

        let response = bus.execute_envelope(&request).await;
        assert_eq!(response.action, Action::QueryResponse);
        assert_eq!(response.correlation_id, request.correlation_id);

        let payload = response
            .payload_as::<QueryResponsePayload>()
            .expect("payload has response shape");
        assert!(payload.ok);
        assert_eq!(payload.data, Some(serde_json::json!({ "x": true })));
    }

    #[tokio::test]
    async fn test_execute_envelope_handler_not_found() {
        let bus = bus_with_echo();

        let request = Envelope::request(
            Action::QueryRequest,
            &serde_json::json!({ "name": "Unknown", "dto": null }),
        )
        .expect("request can be built");

        let response = bus.execute_envelope(&request).await;
        let payload = response
            .payload_as::<QueryResponsePayload>()
            .expect("payload has response shape");

        assert!(!payload.ok);
        assert_matches!(payload.err, Some(err) if err.contains("handler not found"));
    }
}
