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

use crate::domain::{NetworkProvider, ProviderState};
use ingest_common::error::StdErrorExt;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Number of reconnect attempts against the same provider before switching to the next one.
const MAX_RECONNECTION_ATTEMPTS: u32 = 3;

/// Maintains exactly one active provider among the configured set, fails over on repeated
/// failures and tracks per-provider reconnect attempts. The manager exclusively owns its
/// provider set; readers obtain the active provider via [get_active_provider].
///
/// [get_active_provider]: ProviderConnectionManager::get_active_provider
pub struct ProviderConnectionManager<P> {
    providers: Vec<Slot<P>>,
    active_index: Option<usize>,
    reconnection_attempts: HashMap<String, u32>,
    failed: HashSet<String>,
}

struct Slot<P> {
    provider: P,
    state: ProviderState,
}

impl<P> ProviderConnectionManager<P>
where
    P: NetworkProvider,
{
    pub fn new(providers: Vec<P>) -> Result<Self, ConnectionManagerError> {
        if providers.is_empty() {
            return Err(ConnectionManagerError::NoProvidersConfigured);
        }

        let mut names = HashSet::new();
        for provider in &providers {
            if !names.insert(provider.uniq_name().to_string()) {
                return Err(ConnectionManagerError::DuplicateProviderName(
                    provider.uniq_name().to_string(),
                ));
            }
        }

        Ok(Self {
            providers: providers
                .into_iter()
                .map(|provider| Slot {
                    provider,
                    state: ProviderState::Disconnected,
                })
                .collect(),
            active_index: None,
            reconnection_attempts: HashMap::new(),
            failed: HashSet::new(),
        })
    }

    /// Connect the first reachable provider in declaration order and make it active.
    pub async fn connect(&mut self) -> Result<(), ConnectionManagerError> {
        for index in 0..self.providers.len() {
            if self.try_connect(index).await {
                self.active_index = Some(index);
                return Ok(());
            }
        }

        Err(ConnectionManagerError::NoProvidersAvailable)
    }

    /// The provider all network calls are currently routed to.
    pub fn get_active_provider(&self) -> Result<P, ConnectionManagerError> {
        let index = self
            .active_index
            .ok_or(ConnectionManagerError::NotConnected)?;

        Ok(self.providers[index].provider.clone())
    }

    /// React to a failed call against the named provider: reconnect it while it has attempts
    /// left, otherwise switch round-robin to the next reachable provider. Returns the provider
    /// subsequent calls should use.
    pub async fn handle_provider_failure(
        &mut self,
        name: &str,
        method_name: &str,
    ) -> Result<P, ConnectionManagerError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| ConnectionManagerError::UnknownProvider(name.to_string()))?;

        self.failed.insert(name.to_string());
        let attempts = *self
            .reconnection_attempts
            .entry(name.to_string())
            .and_modify(|attempts| *attempts += 1)
            .or_insert(1);
        debug!(provider = name, method_name, attempts; "provider call failed");

        if attempts < MAX_RECONNECTION_ATTEMPTS {
            // Reconnect the same provider. A failed reconnect is not a reason to switch yet; the
            // caller retries and failures keep counting towards the switch threshold.
            let _ = self.providers[index].provider.disconnect().await;

            if self.try_connect(index).await {
                self.clear_failure_state(name);
                self.active_index = Some(index);
                info!(provider = name; "provider reconnected");
            } else {
                warn!(provider = name, attempts; "provider reconnect failed");
            }

            return Ok(self.providers[index].provider.clone());
        }

        self.switch_to_next().await
    }

    /// Round-robin starting after the active provider, skipping currently failed providers. Once
    /// every provider is marked failed, the whole failure set is cleared and each provider gets
    /// one more chance starting from the first.
    async fn switch_to_next(&mut self) -> Result<P, ConnectionManagerError> {
        let n = self.providers.len();
        let start = (self.active_index.unwrap_or(0) + 1) % n;

        if self.failed.len() < n {
            for offset in 0..n {
                let index = (start + offset) % n;
                let name = self.providers[index].provider.uniq_name().to_string();

                if self.failed.contains(&name) {
                    continue;
                }

                if self.try_connect(index).await {
                    self.activate(index, &name);
                    return Ok(self.providers[index].provider.clone());
                }

                self.failed.insert(name);
            }
        }

        // Every provider has failed at least once: reset and retry the whole set once.
        warn!("all providers failed, clearing failure set and retrying");
        self.failed.clear();
        self.reconnection_attempts.clear();

        for index in 0..n {
            if self.try_connect(index).await {
                let name = self.providers[index].provider.uniq_name().to_string();
                self.activate(index, &name);
                return Ok(self.providers[index].provider.clone());
            }
        }

        Err(ConnectionManagerError::NoProvidersAvailable)
    }

    /// Make the named provider active, connecting it first.
    pub async fn switch_provider(&mut self, name: &str) -> Result<P, ConnectionManagerError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| ConnectionManagerError::UnknownProvider(name.to_string()))?;

        if !self.try_connect(index).await {
            return Err(ConnectionManagerError::ProviderUnreachable(name.to_string()));
        }

        self.activate(index, name);
        Ok(self.providers[index].provider.clone())
    }

    pub async fn remove_provider(&mut self, name: &str) -> Result<(), ConnectionManagerError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| ConnectionManagerError::UnknownProvider(name.to_string()))?;

        let slot = self.providers.remove(index);
        let _ = slot.provider.disconnect().await;
        self.clear_failure_state(name);

        self.active_index = match self.active_index {
            Some(active) if active == index => None,
            Some(active) if active > index => Some(active - 1),
            other => other,
        };

        Ok(())
    }

    pub async fn disconnect(&mut self) {
        for slot in &mut self.providers {
            let _ = slot.provider.disconnect().await;
            slot.state = ProviderState::Disconnected;
        }

        self.active_index = None;
    }

    pub fn provider_states(&self) -> Vec<(String, ProviderState)> {
        self.providers
            .iter()
            .map(|slot| (slot.provider.uniq_name().to_string(), slot.state))
            .collect()
    }

    async fn try_connect(&mut self, index: usize) -> bool {
        self.providers[index].state = ProviderState::Connecting;

        match self.providers[index].provider.connect().await {
            Ok(()) => {
                self.providers[index].state = ProviderState::Connected;
                true
            }

            Err(error) => {
                debug!(
                    provider = self.providers[index].provider.uniq_name(),
                    error = error.display_chain();
                    "provider connect failed"
                );
                self.providers[index].state = ProviderState::Disconnected;
                false
            }
        }
    }

    fn activate(&mut self, index: usize, name: &str) {
        self.active_index = Some(index);
        self.clear_failure_state(name);
        metrics::counter!("provider_switches").increment(1);
        info!(provider = name; "active provider switched");
    }

    fn clear_failure_state(&mut self, name: &str) {
        self.failed.remove(name);
        self.reconnection_attempts.remove(name);
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.providers
            .iter()
            .position(|slot| slot.provider.uniq_name() == name)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("no providers configured")]
    NoProvidersConfigured,

    #[error("duplicate provider name: {0}")]
    DuplicateProviderName(String),

    #[error("no providers available")]
    NoProvidersAvailable,

    #[error("no active provider, connect first")]
    NotConnected,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {0} cannot be reached")]
    ProviderUnreachable(String),
}
