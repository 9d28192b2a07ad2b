// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

use futures::{StreamExt, future::BoxFuture};
use ingest_common::{
    domain::{Subscriber, SystemEvent},
    error::{BoxError, StdErrorExt},
};
use log::{debug, warn};
use parking_lot::RwLock;
use std::{future::Future, pin::pin, sync::Arc};

type EventHandler =
    Arc<dyn Fn(SystemEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Bridges the local system-event stream to registered handlers with single-concurrency
/// ordering: handlers for one event are started (and awaited) before the next event is taken.
/// Handlers doing fire-and-forget work internally may still complete out of order across
/// events; callers must not depend on cross-event completion ordering.
#[derive(Clone)]
pub struct SubscriberBridge<S> {
    subscriber: S,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl<S> SubscriberBridge<S>
where
    S: Subscriber,
{
    pub fn new(subscriber: S) -> Self {
        Self {
            subscriber,
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn on_event<F, Fut>(&self, handler: F)
    where
        F: Fn(SystemEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.handlers
            .write()
            .push(Arc::new(move |event| Box::pin(handler(event))));
    }

    /// Forward events until the stream ends. Handler failures are logged; subsequent events keep
    /// flowing.
    pub async fn run(&self) {
        let mut events = pin!(self.subscriber.subscribe());

        while let Some(event) = events.next().await {
            let handlers = self.handlers.read().clone();
            debug!(
                event_type = event.event_type,
                handlers = handlers.len();
                "dispatching system event"
            );

            for handler in handlers {
                if let Err(error) = handler(event.clone()).await {
                    warn!(
                        event_type = event.event_type,
                        error = error.display_chain();
                        "system event handler failed"
                    );
                }
            }
        }

        debug!("local event stream ended");
    }
}
