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

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::channel::ChannelRegistry;
use super::protocol::{BrokerRequest, BrokerResponse, ErrorKind};
use crate::config::BrokerConfig;

/// Long-lived broker service: owns the channels and serves remote
/// enqueue/dequeue calls from any number of client processes.
pub struct BrokerServer {
    registry: Arc<ChannelRegistry>,
    authkey: Arc<str>,
    max_frame_bytes: usize,
}

impl BrokerServer {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new(config.channels.iter().cloned())),
            authkey: Arc::from(config.authkey.as_str()),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, address: &str, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind broker to {}", address))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr().context("Listener has no local address")?;
        info!(
            address = %local_addr,
            channels = ?self.registry.names(),
            "broker listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("broker shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer, shutdown.clone()),
                        Err(e) => {
                            // Usually EMFILE or a reset during accept; keep serving.
                            error!(error = %e, "failed to accept broker connection");
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let connection = Connection {
            registry: self.registry.clone(),
            authkey: self.authkey.clone(),
            max_frame_bytes: self.max_frame_bytes,
        };
        let span = info_span!("broker_conn", conn_id = %Uuid::new_v4(), peer = %peer);

        tokio::spawn(
            async move {
                debug!("client connected");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = connection.handle(stream) => {
                        if let Err(e) = result {
                            warn!(error = %e, "client connection ended with error");
                        }
                    }
                }
                debug!("client disconnected");
            }
            .instrument(span),
        );
    }
}

struct Connection {
    registry: Arc<ChannelRegistry>,
    authkey: Arc<str>,
    max_frame_bytes: usize,
}

enum Frame {
    Line(String),
    TooLarge,
    Closed,
}

impl Connection {
    async fn handle(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut authenticated = false;

        loop {
            let line = match self.read_frame(&mut reader).await? {
                Frame::Line(line) => line,
                Frame::Closed => return Ok(()),
                Frame::TooLarge => {
                    let response = BrokerResponse::error(
                        ErrorKind::BadRequest,
                        format!("frame exceeds {} bytes", self.max_frame_bytes),
                    );
                    write_response(&mut writer, &response).await?;
                    return Ok(());
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let request: BrokerRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    let response =
                        BrokerResponse::error(ErrorKind::BadRequest, format!("malformed frame: {}", e));
                    write_response(&mut writer, &response).await?;
                    if !authenticated {
                        return Ok(());
                    }
                    continue;
                }
            };

            if !authenticated {
                match request {
                    BrokerRequest::Hello { authkey } if authkey.as_bytes() == self.authkey.as_bytes() => {
                        authenticated = true;
                        debug!("client authenticated");
                        write_response(&mut writer, &BrokerResponse::Ok).await?;
                        continue;
                    }
                    BrokerRequest::Hello { .. } => {
                        warn!("client presented a wrong authkey, refusing connection");
                    }
                    other => {
                        warn!(op = other.op(), "request before handshake, refusing connection");
                    }
                }
                let response = BrokerResponse::error(ErrorKind::Unauthorized, "authentication failed");
                write_response(&mut writer, &response).await?;
                return Ok(());
            }

            let response = self.dispatch(request).await;
            write_response(&mut writer, &response).await?;
        }
    }

    async fn read_frame(&self, reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Result<Frame> {
        let mut line = String::new();
        let limit = self.max_frame_bytes as u64 + 1;
        let read = (&mut *reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .context("Failed to read frame")?;

        if read == 0 {
            return Ok(Frame::Closed);
        }
        if !line.ends_with('\n') && read as u64 >= limit {
            return Ok(Frame::TooLarge);
        }
        Ok(Frame::Line(line))
    }

    async fn dispatch(&self, request: BrokerRequest) -> BrokerResponse {
        let op = request.op();
        let result = match request {
            BrokerRequest::Hello { .. } => Ok(BrokerResponse::Ok),
            BrokerRequest::Channels => Ok(BrokerResponse::Channels {
                names: self.registry.names().to_vec(),
            }),
            BrokerRequest::Lookup { channel } => self.registry.get(&channel).map(|_| BrokerResponse::Ok),
            BrokerRequest::Put { channel, event } => match self.registry.get(&channel) {
                Ok(ch) => {
                    ch.enqueue(event).await;
                    Ok(BrokerResponse::Ok)
                }
                Err(e) => Err(e),
            },
            BrokerRequest::Get { channel } => match self.registry.get(&channel) {
                Ok(ch) => Ok(BrokerResponse::Event {
                    event: ch.dequeue().await,
                }),
                Err(e) => Err(e),
            },
            BrokerRequest::Empty { channel } => match self.registry.get(&channel) {
                Ok(ch) => Ok(BrokerResponse::Empty {
                    empty: ch.is_empty().await,
                }),
                Err(e) => Err(e),
            },
        };

        result.unwrap_or_else(|e| {
            warn!(op, error = %e, "request failed");
            BrokerResponse::from_error(&e)
        })
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &BrokerResponse) -> Result<()> {
    let mut frame = serde_json::to_vec(response).context("Failed to encode response")?;
    frame.push(b'\n');
    writer.write_all(&frame).await.context("Failed to write response")?;
    writer.flush().await.context("Failed to flush response")?;
    Ok(())
}
