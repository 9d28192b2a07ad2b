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

use crate::domain::SystemEvent;
use futures::{Stream, StreamExt};
use log::warn;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Publisher for local system events.
#[trait_variant::make(Send)]
pub trait Publisher
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, event: &SystemEvent) -> Result<(), Self::Error>;
}

/// Subscriber for local system events.
pub trait Subscriber
where
    Self: Clone + Send + Sync + 'static,
{
    fn subscribe(&self) -> impl Stream<Item = SystemEvent> + Send;
}

/// Single-producer/multi-consumer in-process topic with process-wide lifetime tied to the
/// publisher. Slow subscribers observe a lag warning and continue with the next event.
#[derive(Clone)]
pub struct LocalEventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl Publisher for LocalEventBus {
    type Error = Infallible;

    async fn publish(&self, event: &SystemEvent) -> Result<(), Self::Error> {
        // A send error only signals that there are currently no subscribers.
        let _ = self.sender.send(event.to_owned());
        Ok(())
    }
}

impl Subscriber for LocalEventBus {
    fn subscribe(&self) -> impl Stream<Item = SystemEvent> + Send {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| {
            std::future::ready(match event {
                Ok(event) => Some(event),

                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped; "subscriber lagging, events skipped");
                    None
                }
            })
        })
    }
}
