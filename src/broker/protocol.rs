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

// Broker wire protocol: one JSON document per line in each direction.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Request frames sent by clients. `Hello` must be the first frame.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerRequest {
    Hello { authkey: String },
    Lookup { channel: String },
    Put { channel: String, event: String },
    Get { channel: String },
    Empty { channel: String },
    Channels,
}

impl BrokerRequest {
    pub fn op(&self) -> &'static str {
        match self {
            BrokerRequest::Hello { .. } => "hello",
            BrokerRequest::Lookup { .. } => "lookup",
            BrokerRequest::Put { .. } => "put",
            BrokerRequest::Get { .. } => "get",
            BrokerRequest::Empty { .. } => "empty",
            BrokerRequest::Channels => "channels",
        }
    }
}

// Never print the shared secret.
impl std::fmt::Debug for BrokerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerRequest::Hello { .. } => f.write_str("Hello { authkey: <redacted> }"),
            BrokerRequest::Lookup { channel } => write!(f, "Lookup {{ channel: {:?} }}", channel),
            BrokerRequest::Put { channel, event } => write!(
                f,
                "Put {{ channel: {:?}, event: {} bytes }}",
                channel,
                event.len()
            ),
            BrokerRequest::Get { channel } => write!(f, "Get {{ channel: {:?} }}", channel),
            BrokerRequest::Empty { channel } => write!(f, "Empty {{ channel: {:?} }}", channel),
            BrokerRequest::Channels => f.write_str("Channels"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    ChannelNotFound,
    BadRequest,
}

/// Response frames sent by the broker, one per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BrokerResponse {
    Ok,
    Event { event: Option<String> },
    Empty { empty: bool },
    Channels { names: Vec<String> },
    Error { kind: ErrorKind, message: String },
}

impl BrokerResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        BrokerResponse::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(err: &PipelineError) -> Self {
        match err {
            PipelineError::ChannelNotFound(name) => {
                BrokerResponse::error(ErrorKind::ChannelNotFound, name.clone())
            }
            PipelineError::Unauthorized => {
                BrokerResponse::error(ErrorKind::Unauthorized, "authentication failed")
            }
            other => BrokerResponse::error(ErrorKind::BadRequest, other.to_string()),
        }
    }

    /// Turn an error frame back into the matching client-side error.
    pub fn into_result(self) -> Result<BrokerResponse, PipelineError> {
        match self {
            BrokerResponse::Error { kind, message } => Err(match kind {
                ErrorKind::Unauthorized => PipelineError::Unauthorized,
                ErrorKind::ChannelNotFound => PipelineError::ChannelNotFound(message),
                ErrorKind::BadRequest => PipelineError::Protocol(message),
            }),
            ok => Ok(ok),
        }
    }
}
