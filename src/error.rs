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

// Error taxonomy shared by the broker, sampler, consumers and telemetry bridge

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Broker or network unreachable. Retried by the caller after a delay.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel not found: '{0}'")]
    ChannelNotFound(String),

    #[error("broker refused connection: authentication failed")]
    Unauthorized,

    /// The peer sent something that does not follow the broker wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed event payload. Terminal for that event.
    #[error("invalid event: {0}")]
    Validation(String),

    /// Filesystem or sensor failure.
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("initialization failed: {0}")]
    FatalInit(String),

    #[error("server rejected resubscribe to topic '{0}'")]
    ResubscribeRejected(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Resource {
            context: context.into(),
            source,
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        PipelineError::Transport(err.to_string())
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(_) | PipelineError::Resource { .. }
        )
    }
}
