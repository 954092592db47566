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
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{BrokerRequest, BrokerResponse};
use super::Channel;
use crate::config::BrokerConfig;
use crate::error::{PipelineError, Result};

/// Remote handle to a broker.
///
/// Cheap to clone; all clones share one connection and their calls are
/// serialized on it. A transport failure drops the connection and the next
/// call dials and authenticates again.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    address: String,
    authkey: String,
    request_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn round_trip(&mut self, request: &BrokerRequest) -> Result<BrokerResponse> {
        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        self.writer
            .write_all(&frame)
            .await
            .map_err(PipelineError::transport)?;
        self.writer.flush().await.map_err(PipelineError::transport)?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(PipelineError::transport)?;
        if read == 0 {
            return Err(PipelineError::Transport(
                "broker closed the connection".to_string(),
            ));
        }

        serde_json::from_str(&line)
            .map_err(|e| PipelineError::Protocol(format!("malformed broker response: {}", e)))
    }
}

impl BrokerClient {
    /// Connect and authenticate. Fails with `Unauthorized` when the broker
    /// rejects the shared secret.
    pub async fn connect(address: impl Into<String>, authkey: impl Into<String>) -> Result<Self> {
        Self::connect_with_timeout(address, authkey, Duration::from_secs(5)).await
    }

    pub async fn connect_with_timeout(
        address: impl Into<String>,
        authkey: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Self {
            inner: Arc::new(ClientInner {
                address: address.into(),
                authkey: authkey.into(),
                request_timeout,
                conn: Mutex::new(None),
            }),
        };

        let conn = client.dial().await?;
        *client.inner.conn.lock().await = Some(conn);
        info!(address = %client.inner.address, "connected to broker");

        Ok(client)
    }

    pub async fn from_config(config: &BrokerConfig) -> Result<Self> {
        Self::connect_with_timeout(
            config.address.clone(),
            config.authkey.clone(),
            config.request_timeout(),
        )
        .await
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Resolve a channel by name. Unknown names fail with `ChannelNotFound`.
    pub async fn channel(&self, name: &str) -> Result<ChannelHandle> {
        self.call(BrokerRequest::Lookup {
            channel: name.to_string(),
        })
        .await?;

        Ok(ChannelHandle {
            client: self.clone(),
            name: name.to_string(),
        })
    }

    pub async fn channel_names(&self) -> Result<Vec<String>> {
        match self.call(BrokerRequest::Channels).await? {
            BrokerResponse::Channels { names } => Ok(names),
            other => Err(unexpected("channels", &other)),
        }
    }

    async fn dial(&self) -> Result<Connection> {
        let stream = tokio::time::timeout(
            self.inner.request_timeout,
            TcpStream::connect(&self.inner.address),
        )
        .await
        .map_err(|_| {
            PipelineError::Transport(format!("timed out connecting to {}", self.inner.address))
        })?
        .map_err(|e| {
            PipelineError::Transport(format!("failed to connect to {}: {}", self.inner.address, e))
        })?;
        stream.set_nodelay(true).map_err(PipelineError::transport)?;

        let (read_half, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer,
        };

        let hello = BrokerRequest::Hello {
            authkey: self.inner.authkey.clone(),
        };
        let response = self.with_timeout(conn.round_trip(&hello)).await?;
        match response.into_result()? {
            BrokerResponse::Ok => Ok(conn),
            other => Err(unexpected("hello", &other)),
        }
    }

    async fn with_timeout<F>(&self, fut: F) -> Result<BrokerResponse>
    where
        F: std::future::Future<Output = Result<BrokerResponse>>,
    {
        tokio::time::timeout(self.inner.request_timeout, fut)
            .await
            .map_err(|_| PipelineError::Transport("broker request timed out".to_string()))?
    }

    async fn call(&self, request: BrokerRequest) -> Result<BrokerResponse> {
        let mut guard = self.inner.conn.lock().await;

        if guard.is_none() {
            debug!(address = %self.inner.address, "reconnecting to broker");
            *guard = Some(self.dial().await?);
            info!(address = %self.inner.address, "reconnected to broker");
        }

        let result = match guard.as_mut() {
            Some(conn) => self.with_timeout(conn.round_trip(&request)).await,
            None => Err(PipelineError::Transport("no broker connection".to_string())),
        };

        match result {
            Ok(response) => response.into_result(),
            Err(e) => {
                // The stream may hold a half-read frame; never reuse it.
                warn!(op = request.op(), error = %e, "broker call failed, dropping connection");
                *guard = None;
                Err(e)
            }
        }
    }
}

/// Handle to one named channel on a remote broker.
#[derive(Clone)]
pub struct ChannelHandle {
    client: BrokerClient,
    name: String,
}

impl ChannelHandle {
    pub fn client(&self) -> &BrokerClient {
        &self.client
    }
}

#[async_trait]
impl Channel for ChannelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, event: String) -> Result<()> {
        match self
            .client
            .call(BrokerRequest::Put {
                channel: self.name.clone(),
                event,
            })
            .await?
        {
            BrokerResponse::Ok => Ok(()),
            other => Err(unexpected("put", &other)),
        }
    }

    /// A timeout after the broker already popped the event loses that
    /// event along with the connection.
    async fn get(&self) -> Result<Option<String>> {
        match self
            .client
            .call(BrokerRequest::Get {
                channel: self.name.clone(),
            })
            .await?
        {
            BrokerResponse::Event { event } => Ok(event),
            other => Err(unexpected("get", &other)),
        }
    }

    async fn is_empty(&self) -> Result<bool> {
        match self
            .client
            .call(BrokerRequest::Empty {
                channel: self.name.clone(),
            })
            .await?
        {
            BrokerResponse::Empty { empty } => Ok(empty),
            other => Err(unexpected("empty", &other)),
        }
    }
}

fn unexpected(op: &str, response: &BrokerResponse) -> PipelineError {
    PipelineError::Protocol(format!("unexpected response to '{}': {:?}", op, response))
}
