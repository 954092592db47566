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
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::Channel;
use crate::error::{PipelineError, Result};

/// Broker-owned FIFO of opaque event records.
///
/// Each channel has its own lock, so traffic on one channel never waits on
/// another.
pub struct EventChannel {
    name: String,
    queue: Mutex<VecDeque<String>>,

    // Statistics
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
}

impl EventChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, event: String) {
        let depth = {
            let mut queue = self.queue.lock().await;
            queue.push_back(event);
            queue.len()
        };
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %self.name, depth, "event enqueued");
    }

    /// Remove the oldest event, or `None` when the channel is empty.
    pub async fn dequeue(&self) -> Option<String> {
        let event = self.queue.lock().await.pop_front();
        if event.is_some() {
            self.total_dequeued.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// (enqueued, dequeued) since broker start
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_enqueued.load(Ordering::Relaxed),
            self.total_dequeued.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Channel for EventChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, event: String) -> Result<()> {
        self.enqueue(event).await;
        Ok(())
    }

    async fn get(&self) -> Result<Option<String>> {
        Ok(self.dequeue().await)
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(EventChannel::is_empty(self).await)
    }
}

/// The fixed set of channels a broker serves. Built once at startup and
/// never modified, so lookups need no lock.
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<EventChannel>>,
    order: Vec<String>,
}

impl ChannelRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut channels = HashMap::new();
        let mut order = Vec::new();
        for name in names {
            let name = name.into();
            if channels.contains_key(&name) {
                continue;
            }
            channels.insert(name.clone(), Arc::new(EventChannel::new(name.clone())));
            order.push(name);
        }
        Self { channels, order }
    }

    pub fn get(&self, name: &str) -> Result<Arc<EventChannel>> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::ChannelNotFound(name.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }
}
