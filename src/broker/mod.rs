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

// Event broker module
//
// A single broker process owns a fixed set of named FIFO channels and serves
// them over TCP to the sampler, uploader and telemetry processes. Clients
// never share memory with the broker; they hold a `ChannelHandle` and poll.

pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;

pub use channel::{ChannelRegistry, EventChannel};
pub use client::{BrokerClient, ChannelHandle};
pub use protocol::{BrokerRequest, BrokerResponse, ErrorKind};
pub use server::BrokerServer;

use async_trait::async_trait;

use crate::error::Result;

/// Enqueue/dequeue surface shared by broker-local channels and remote
/// handles, so producers and consumers run unchanged over either.
///
/// Dequeue never blocks: callers poll and back off themselves.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Append an event record to the tail of the channel.
    async fn put(&self, event: String) -> Result<()>;

    /// Remove the oldest record, `None` when the channel is empty.
    async fn get(&self) -> Result<Option<String>>;

    async fn is_empty(&self) -> Result<bool>;
}
