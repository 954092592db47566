// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Channel;
use crate::error::Result;
use crate::event::Event;

/// Result of handing one event to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Malformed or unroutable. Terminal for the event.
    Rejected(String),
    /// The sink gave up after its own bounded retries. The event is dropped.
    Retryable(String),
}

/// A sink for validated events of the kinds it routes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> DispatchOutcome;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

pub struct EventConsumer {
    channel: Arc<dyn Channel>,
    handler: Arc<dyn EventHandler>,
    poll_interval: Duration,
    error_delay: Duration,
    counters: Counters,
}

impl EventConsumer {
    pub fn new(
        channel: Arc<dyn Channel>,
        handler: Arc<dyn EventHandler>,
        poll_interval: Duration,
        error_delay: Duration,
    ) -> Self {
        Self {
            channel,
            handler,
            poll_interval,
            error_delay,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Decode, validate and route one raw event. Never fails: every problem
    /// becomes an outcome and a log line.
    pub async fn dispatch(&self, raw: &str) -> DispatchOutcome {
        let outcome = match Event::from_json(raw).and_then(|event| {
            event.validate()?;
            Ok(event)
        }) {
            Ok(event) => {
                debug!(kind = %event.kind, handler = self.handler.name(), "dispatching event");
                self.handler.handle(&event).await
            }
            Err(e) => DispatchOutcome::Rejected(e.to_string()),
        };

        match &outcome {
            DispatchOutcome::Delivered => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                info!(handler = self.handler.name(), "event delivered");
            }
            DispatchOutcome::Rejected(reason) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(handler = self.handler.name(), %reason, event = raw, "event rejected");
            }
            DispatchOutcome::Retryable(reason) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    handler = self.handler.name(),
                    %reason,
                    event = raw,
                    "delivery failed after retries, event dropped"
                );
            }
        }

        outcome
    }

    /// Take at most one event off the channel. `Ok(None)` when it was empty.
    pub async fn poll_once(&self) -> Result<Option<DispatchOutcome>> {
        match self.channel.get().await? {
            Some(raw) => Ok(Some(self.dispatch(&raw).await)),
            None => Ok(None),
        }
    }

    /// Poll until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            channel = self.channel.name(),
            handler = self.handler.name(),
            "consumer started"
        );

        loop {
            let pause = match self.poll_once().await {
                Ok(Some(_)) => Duration::ZERO,
                Ok(None) => self.poll_interval,
                Err(e) => {
                    error!(
                        channel = self.channel.name(),
                        error = %e,
                        retry_in = ?self.error_delay,
                        "failed to poll channel"
                    );
                    self.error_delay
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            if !pause.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        let stats = self.stats();
        info!(
            delivered = stats.delivered,
            rejected = stats.rejected,
            failed = stats.failed,
            "consumer stopped"
        );
    }
}
