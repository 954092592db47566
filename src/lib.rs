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

// Edge device event pipeline
//
// Independent processes coordinated through a small event broker:
// - Broker: named FIFO channels behind an authenticated TCP service
// - Sampler: fixed-rate voltage sampling into numbered CSV batches
// - Uploader: drains batch events into an object store (S3 or filesystem)
// - Telemetry: MQTT device shadow updates and remote start/stop of the sampler

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod logging;
pub mod sampler;
pub mod storage;
pub mod telemetry;

// Re-export main types
pub use broker::{BrokerClient, BrokerServer, Channel, ChannelHandle, ChannelRegistry, EventChannel};
pub use config::{load_config, load_config_with_env, PipelineConfig};
pub use consumer::{DispatchOutcome, EventConsumer, EventHandler, UploadHandler};
pub use error::{PipelineError, Result};
pub use event::{Event, EventKind};
pub use sampler::{BatchFileName, BatchProducer, VoltageSource};
pub use storage::{BackendFactory, ObjectStore};
pub use telemetry::{ControlCommand, ProducerSupervisor, TelemetryBridge, TelemetrySession};
