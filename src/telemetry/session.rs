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

// Telemetry session state machine
//
// Transport-agnostic: the bridge feeds it connection events from the MQTT
// event loop, and it issues publishes/subscribes through TelemetryTransport.

use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::shadow::{presence, PresenceStatus};
use crate::error::{PipelineError, Result};

/// Outbound side of a publish/subscribe session. Calls only queue the
/// request; they must not wait on the network.
pub trait TelemetryTransport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    fn subscribe(&self, topic: &str) -> Result<()>;
}

impl TelemetryTransport for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(PipelineError::transport)
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(PipelineError::transport)
    }
}

/// Publish a JSON document through any transport.
pub fn publish_json(transport: &dyn TelemetryTransport, topic: &str, document: &Value) -> Result<()> {
    let payload = serde_json::to_vec(document)?;
    transport.publish(topic, payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
    Reconnecting,
    Closed,
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

pub struct TelemetrySession {
    transport: Arc<dyn TelemetryTransport>,
    presence_topic: String,
    topics: Vec<String>,
    state: SessionState,
    backoff: Backoff,
    connects: u64,
    /// Subscribes queued but not yet assigned a packet id, in send order
    unsent: VecDeque<String>,
    /// Packet id -> topic, awaiting SUBACK
    inflight: HashMap<u16, String>,
}

impl TelemetrySession {
    /// `topics` are subscribed on the first connection and again on every
    /// reconnect the server did not keep the session for.
    pub fn new(
        transport: Arc<dyn TelemetryTransport>,
        presence_topic: impl Into<String>,
        topics: Vec<String>,
        backoff: Backoff,
    ) -> Self {
        Self {
            transport,
            presence_topic: presence_topic.into(),
            topics,
            state: SessionState::Disconnected,
            backoff,
            connects: 0,
            unsent: VecDeque::new(),
            inflight: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn begin_connect(&mut self) {
        if self.state == SessionState::Disconnected {
            self.state = SessionState::Connecting;
            info!("connecting to telemetry endpoint");
        }
    }

    /// Connection accepted. Announces ACTIVE and (re)subscribes unless the
    /// server resumed the previous session.
    pub fn on_connected(&mut self, session_present: bool) -> Result<()> {
        let resumed = self.connects > 0;
        self.connects += 1;
        self.state = SessionState::Connected;
        self.backoff.reset();

        info!(session_present, reconnect = resumed, "telemetry session connected");

        if let Err(e) = publish_json(
            self.transport.as_ref(),
            &self.presence_topic,
            &presence(PresenceStatus::Active),
        ) {
            warn!(error = %e, "failed to queue ACTIVE presence");
        }

        if resumed && session_present {
            debug!("server kept the session, subscriptions intact");
            return Ok(());
        }
        if resumed {
            warn!("session did not persist, resubscribing to existing topics");
        }

        for topic in &self.topics {
            self.transport.subscribe(topic)?;
            self.unsent.push_back(topic.clone());
            debug!(topic = %topic, "subscribe queued");
        }
        Ok(())
    }

    /// The event loop put a SUBSCRIBE on the wire with this packet id.
    pub fn on_subscribe_sent(&mut self, pkid: u16) {
        if let Some(topic) = self.unsent.pop_front() {
            self.inflight.insert(pkid, topic);
        }
    }

    /// SUBACK for `pkid`. A rejected topic cannot be recovered from.
    pub fn on_suback(&mut self, pkid: u16, accepted: bool) -> Result<()> {
        let topic = self
            .inflight
            .remove(&pkid)
            .unwrap_or_else(|| format!("<packet {}>", pkid));

        if accepted {
            info!(topic = %topic, "subscribed");
            Ok(())
        } else {
            error!(topic = %topic, "server rejected resubscribe");
            Err(PipelineError::ResubscribeRejected(topic))
        }
    }

    /// The connection dropped or an attempt failed. Returns how long to
    /// wait before the next attempt.
    pub fn on_connection_error(&mut self, reason: &str) -> Duration {
        if self.state == SessionState::Connected {
            error!(reason, "connection interrupted");
            self.state = SessionState::Interrupted;
        } else {
            warn!(reason, state = ?self.state, "connection attempt failed");
        }
        self.unsent.clear();
        self.backoff.next_delay()
    }

    pub fn begin_reconnect(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Reconnecting;
            info!("reconnecting");
        }
    }

    /// Announce OFF and stop. The last-will covers unclean exits.
    pub fn close(&mut self) {
        if self.state == SessionState::Connected {
            if let Err(e) = publish_json(
                self.transport.as_ref(),
                &self.presence_topic,
                &presence(PresenceStatus::Off),
            ) {
                warn!(error = %e, "failed to queue OFF presence");
            }
        }
        self.state = SessionState::Closed;
        info!("telemetry session closed");
    }
}
