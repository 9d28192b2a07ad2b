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
    BlockEvent, BlockStats, BlockchainInfo, FeeEstimate, NetworkInfo, NetworkProvider,
    ProviderError, ProviderKind, ProviderState, UniversalBlock, UniversalTransaction, Verbosity,
};
use async_stream::stream;
use futures::Stream;
use log::debug;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, sleep, sleep_until};

/// Upstream error codes for items that simply do not exist: `RPC_INVALID_ADDRESS_OR_KEY` and
/// `RPC_INVALID_PARAMETER` (height out of range).
const MISSING_ITEM_CODES: [i64; 2] = [-5, -8];

/// The stats fields the loader budgets with.
const BLOCK_STATS_FIELDS: [&str; 3] = ["blockhash", "height", "total_size"];

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub uniq_name: String,

    /// Base URL of the JSON-RPC endpoint, e.g. `http://127.0.0.1:8332`.
    pub base_url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<SecretString>,

    #[serde(with = "humantime_serde", default = "response_timeout_default")]
    pub response_timeout: Duration,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Cadence of the new-block polling subscription.
    #[serde(with = "humantime_serde", default = "poll_interval_default")]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "max_batch_size_default")]
    pub max_batch_size: usize,

    #[serde(with = "humantime_serde", default = "min_request_interval_default")]
    pub min_request_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_batch_size: max_batch_size_default(),
            min_request_interval: min_request_interval_default(),
        }
    }
}

fn response_timeout_default() -> Duration {
    Duration::from_secs(30)
}

fn poll_interval_default() -> Duration {
    Duration::from_secs(2)
}

fn max_batch_size_default() -> usize {
    50
}

fn min_request_interval_default() -> Duration {
    Duration::from_millis(20)
}

/// Batched JSON-RPC provider over HTTP(S). Stateless per call; `connect` probes the node and the
/// rate limit chunks batches and spaces HTTP requests.
#[derive(Clone)]
pub struct RpcProvider {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    client: reqwest::Client,
    url: String,
    username: Option<String>,
    password: Option<SecretString>,
    max_batch_size: usize,
    min_request_interval: Duration,
    next_request_at: tokio::sync::Mutex<Option<Instant>>,
    poll_interval: Duration,
    state: parking_lot::RwLock<ProviderState>,
}

impl RpcProvider {
    pub fn new(config: RpcConfig) -> Result<Self, ProviderError> {
        let RpcConfig {
            uniq_name,
            base_url,
            username,
            password,
            response_timeout,
            rate_limit,
            poll_interval,
        } = config;

        let client = reqwest::Client::builder()
            .timeout(response_timeout)
            .build()
            .map_err(|error| ProviderError::Transport(error.into()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: uniq_name,
                client,
                url: base_url,
                username,
                password,
                max_batch_size: rate_limit.max_batch_size.max(1),
                min_request_interval: rate_limit.min_request_interval,
                next_request_at: tokio::sync::Mutex::new(None),
                poll_interval,
                state: parking_lot::RwLock::new(ProviderState::Disconnected),
            }),
        })
    }

    /// Issue a batch of calls, preserving input order; a missing item yields `None` in its slot,
    /// every other upstream error fails the whole batch.
    async fn rpc_batch(
        &self,
        calls: &[(&str, serde_json::Value)],
    ) -> Result<Vec<Option<serde_json::Value>>, ProviderError> {
        let mut slots = Vec::with_capacity(calls.len());

        for chunk in calls.chunks(self.inner.max_batch_size) {
            self.throttle().await;

            let body = chunk
                .iter()
                .enumerate()
                .map(|(id, (method, params))| {
                    json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params })
                })
                .collect::<Vec<_>>();

            let mut request = self.inner.client.post(&self.inner.url).json(&body);
            if let Some(username) = &self.inner.username {
                request = request.basic_auth(
                    username,
                    self.inner
                        .password
                        .as_ref()
                        .map(|password| password.expose_secret()),
                );
            }

            let response = request
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|error| ProviderError::Transport(error.into()))?;

            let replies = response
                .json::<Vec<RpcReply>>()
                .await
                .map_err(|error| ProviderError::Decode(error.into()))?;

            // Replies may arrive out of order; re-slot by id.
            let mut chunk_slots: Vec<Option<serde_json::Value>> = vec![None; chunk.len()];
            for reply in replies {
                let slot = chunk_slots
                    .get_mut(reply.id as usize)
                    .ok_or_else(|| ProviderError::Decode("reply id out of range".into()))?;

                match reply.error {
                    None => *slot = Some(reply.result),

                    Some(error) if MISSING_ITEM_CODES.contains(&error.code) => *slot = None,

                    Some(error) => {
                        return Err(ProviderError::Rpc {
                            code: error.code,
                            message: error.message,
                        });
                    }
                }
            }

            slots.append(&mut chunk_slots);
        }

        Ok(slots)
    }

    async fn rpc_call<T>(&self, method: &str, params: serde_json::Value) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
    {
        let slots = self.rpc_batch(&[(method, params)]).await?;
        let value = slots
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| ProviderError::Rpc {
                code: -5,
                message: format!("{method}: no result"),
            })?;

        serde_json::from_value(value).map_err(|error| ProviderError::Decode(error.into()))
    }

    /// Space HTTP requests by the configured minimum interval.
    async fn throttle(&self) {
        if self.inner.min_request_interval.is_zero() {
            return;
        }

        let mut next_request_at = self.inner.next_request_at.lock().await;
        if let Some(at) = *next_request_at {
            sleep_until(at).await;
        }
        *next_request_at = Some(Instant::now() + self.inner.min_request_interval);
    }

    async fn hashes_for_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let calls = heights
            .iter()
            .map(|height| ("getblockhash", json!([height])))
            .collect::<Vec<_>>();

        let slots = self.rpc_batch(&calls).await?;
        slots
            .into_iter()
            .map(|slot| {
                slot.map(|value| {
                    serde_json::from_value::<String>(value)
                        .map_err(|error| ProviderError::Decode(error.into()))
                })
                .transpose()
            })
            .collect()
    }

    /// Fetch blocks for the given hash slots, keeping `None` slots aligned.
    async fn blocks_for_hashes<T>(
        &self,
        hashes: &[Option<String>],
        verbosity: i64,
        decode: impl Fn(serde_json::Value) -> Result<T, ProviderError>,
    ) -> Result<Vec<Option<T>>, ProviderError> {
        let calls = hashes
            .iter()
            .flatten()
            .map(|hash| ("getblock", json!([hash, verbosity])))
            .collect::<Vec<_>>();

        let mut fetched = self.rpc_batch(&calls).await?.into_iter();

        hashes
            .iter()
            .map(|hash| match hash {
                None => Ok(None),
                Some(_) => match fetched.next() {
                    Some(Some(value)) => decode(value).map(Some),
                    _ => Ok(None),
                },
            })
            .collect()
    }
}

impl NetworkProvider for RpcProvider {
    fn uniq_name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Rpc
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        *self.inner.state.write() = ProviderState::Connecting;

        let info = self.get_blockchain_info().await.inspect_err(|_| {
            *self.inner.state.write() = ProviderState::Disconnected;
        })?;

        debug!(provider = self.inner.name, chain = info.chain, blocks = info.blocks; "connected");
        *self.inner.state.write() = ProviderState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        *self.inner.state.write() = ProviderState::Disconnected;
        Ok(())
    }

    async fn get_block_height(&self) -> Result<u32, ProviderError> {
        self.rpc_call("getblockcount", json!([])).await
    }

    async fn get_many_block_hashes_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        self.hashes_for_heights(heights).await
    }

    async fn get_many_blocks_by_heights(
        &self,
        heights: &[u32],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        let hashes = self.hashes_for_heights(heights).await?;
        let verbosity = match verbosity {
            Verbosity::Summary => 1,
            Verbosity::Full => 2,
        };

        self.blocks_for_hashes(&hashes, verbosity, |value| {
            serde_json::from_value(value).map_err(|error| ProviderError::Decode(error.into()))
        })
        .await
    }

    async fn get_many_blocks_hex_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        let hashes = self.hashes_for_heights(heights).await?;
        let raw = self
            .blocks_for_hashes(&hashes, 0, |value| {
                serde_json::from_value::<String>(value)
                    .map_err(|error| ProviderError::Decode(error.into()))
            })
            .await?;

        heights
            .iter()
            .zip(raw)
            .map(|(height, hex)| {
                hex.map(|hex| decode_raw_block(&hex, Some(*height))).transpose()
            })
            .collect()
    }

    async fn get_many_blocks_by_hashes(
        &self,
        hashes: &[String],
        verbosity: Verbosity,
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        let hashes = hashes.iter().cloned().map(Some).collect::<Vec<_>>();
        let verbosity = match verbosity {
            Verbosity::Summary => 1,
            Verbosity::Full => 2,
        };

        self.blocks_for_hashes(&hashes, verbosity, |value| {
            serde_json::from_value(value).map_err(|error| ProviderError::Decode(error.into()))
        })
        .await
    }

    async fn get_many_blocks_hex_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<UniversalBlock>>, ProviderError> {
        let slots = hashes.iter().cloned().map(Some).collect::<Vec<_>>();
        let raw = self
            .blocks_for_hashes(&slots, 0, |value| {
                serde_json::from_value::<String>(value)
                    .map_err(|error| ProviderError::Decode(error.into()))
            })
            .await?;

        // Raw bytes carry no height; resolve via a follow-up header call.
        let heights = self.get_heights_by_hashes(hashes).await?;

        raw.into_iter()
            .zip(heights)
            .map(|(hex, height)| hex.map(|hex| decode_raw_block(&hex, height)).transpose())
            .collect()
    }

    async fn get_heights_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<u32>>, ProviderError> {
        let calls = hashes
            .iter()
            .map(|hash| ("getblockheader", json!([hash, true])))
            .collect::<Vec<_>>();

        let slots = self.rpc_batch(&calls).await?;
        slots
            .into_iter()
            .map(|slot| {
                slot.map(|value| {
                    serde_json::from_value::<BlockHeaderReply>(value)
                        .map(|header| header.height)
                        .map_err(|error| ProviderError::Decode(error.into()))
                })
                .transpose()
            })
            .collect()
    }

    async fn get_many_blocks_stats_by_heights(
        &self,
        heights: &[u32],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
        let calls = heights
            .iter()
            .map(|height| ("getblockstats", json!([height, BLOCK_STATS_FIELDS])))
            .collect::<Vec<_>>();

        decode_slots(self.rpc_batch(&calls).await?)
    }

    async fn get_many_blocks_stats_by_hashes(
        &self,
        hashes: &[String],
    ) -> Result<Vec<Option<BlockStats>>, ProviderError> {
        let calls = hashes
            .iter()
            .map(|hash| ("getblockstats", json!([hash, BLOCK_STATS_FIELDS])))
            .collect::<Vec<_>>();

        decode_slots(self.rpc_batch(&calls).await?)
    }

    async fn get_many_transactions_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<UniversalTransaction>>, ProviderError> {
        let calls = txids
            .iter()
            .map(|txid| ("getrawtransaction", json!([txid, true])))
            .collect::<Vec<_>>();

        decode_slots(self.rpc_batch(&calls).await?)
    }

    async fn get_many_transactions_hex_by_txids(
        &self,
        txids: &[String],
    ) -> Result<Vec<Option<String>>, ProviderError> {
        let calls = txids
            .iter()
            .map(|txid| ("getrawtransaction", json!([txid, false])))
            .collect::<Vec<_>>();

        decode_slots(self.rpc_batch(&calls).await?)
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, ProviderError> {
        self.rpc_call("getblockchaininfo", json!([])).await
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        self.rpc_call("getnetworkinfo", json!([])).await
    }

    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<FeeEstimate, ProviderError> {
        self.rpc_call("estimatesmartfee", json!([conf_target])).await
    }

    fn subscribe_to_new_blocks(
        &self,
    ) -> impl Stream<Item = Result<BlockEvent, ProviderError>> + Send {
        let provider = self.clone();

        stream! {
            let mut last_height: Option<u32> = None;

            loop {
                match provider.get_block_height().await {
                    Ok(height) => {
                        let from = match last_height {
                            Some(last) if height > last => last + 1,
                            None => height,
                            _ => {
                                sleep(provider.inner.poll_interval).await;
                                continue;
                            }
                        };

                        for height in from..=height {
                            match provider.hashes_for_heights(&[height]).await {
                                Ok(hashes) => {
                                    if let Some(hash) = hashes.into_iter().next().flatten() {
                                        last_height = Some(height);
                                        yield Ok(BlockEvent { height, hash });
                                    }
                                }

                                Err(error) => yield Err(error),
                            }
                        }
                    }

                    Err(error) => yield Err(error),
                }

                sleep(provider.inner.poll_interval).await;
            }
        }
    }
}

fn decode_raw_block(hex: &str, height: Option<u32>) -> Result<UniversalBlock, ProviderError> {
    let bytes = const_hex::decode(hex).map_err(|error| ProviderError::Decode(error.into()))?;
    let block = bitcoin::consensus::deserialize::<bitcoin::Block>(&bytes)
        .map_err(|error| ProviderError::Decode(error.into()))?;

    Ok(UniversalBlock::from_consensus(&block, height))
}

fn decode_slots<T>(
    slots: Vec<Option<serde_json::Value>>,
) -> Result<Vec<Option<T>>, ProviderError>
where
    T: DeserializeOwned,
{
    slots
        .into_iter()
        .map(|slot| {
            slot.map(|value| {
                serde_json::from_value(value).map_err(|error| ProviderError::Decode(error.into()))
            })
            .transpose()
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: serde_json::Value,

    #[serde(default)]
    error: Option<RpcErrorObject>,

    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockHeaderReply {
    height: u32,
}

#[cfg(test)]
mod tests {
    use super::{RpcErrorObject, RpcReply};

    #[test]
    fn test_reply_shapes() {
        let reply = serde_json::from_str::<RpcReply>(r#"{"result": 840000, "error": null, "id": 0}"#)
            .expect("success reply parses");
        assert_eq!(reply.result, serde_json::json!(840_000));
        assert!(reply.error.is_none());

        let reply = serde_json::from_str::<RpcReply>(
            r#"{"result": null, "error": {"code": -5, "message": "Block not found"}, "id": 3}"#,
        )
        .expect("error reply parses");
        assert!(matches!(reply.error, Some(RpcErrorObject { code: -5, .. })));
        assert_eq!(reply.id, 3);
    }
}
