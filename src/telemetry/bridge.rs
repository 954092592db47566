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

// MQTT driver for the telemetry session
//
// A single task polls the rumqttc event loop, drains the iot channel on a
// fixed tick while connected, and forwards control messages to the
// producer supervisor.

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{device_name, device_topic};
use super::session::{Backoff, TelemetrySession, TelemetryTransport};
use super::shadow::{presence, PresenceStatus, ShadowPublisher};
use super::supervisor::{ControlCommand, SupervisorHandle};
use crate::broker::Channel;
use crate::config::TelemetryConfig;
use crate::consumer::EventConsumer;
use crate::error::{PipelineError, Result};

const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection options: serial number as client id, OFF presence as the
/// last will, mutual TLS when configured.
pub fn mqtt_options(config: &TelemetryConfig, serial: &str) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(serial, config.endpoint.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs).max(MIN_KEEP_ALIVE));
    options.set_clean_session(config.clean_session);

    let will = serde_json::to_vec(&presence(PresenceStatus::Off))?;
    options.set_last_will(LastWill::new(
        device_topic(&config.lwt_topic, serial),
        will,
        QoS::AtLeastOnce,
        false,
    ));

    if let Some(tls) = &config.tls {
        let read = |path: &std::path::Path| {
            std::fs::read(path).map_err(|e| {
                PipelineError::FatalInit(format!("read TLS material {}: {}", path.display(), e))
            })
        };
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: read(&tls.ca_path)?,
            alpn: None,
            client_auth: Some((read(&tls.cert_path)?, read(&tls.key_path)?)),
        }));
    }

    Ok(options)
}

/// Applies packets from the MQTT event loop to the session and forwards
/// control-topic messages to the producer supervisor.
pub struct PacketRouter {
    control_topic: String,
    supervisor: SupervisorHandle,
}

impl PacketRouter {
    pub fn new(control_topic: impl Into<String>, supervisor: SupervisorHandle) -> Self {
        Self {
            control_topic: control_topic.into(),
            supervisor,
        }
    }

    /// Errors only when the session can no longer be trusted (a rejected
    /// subscription).
    pub async fn handle(&self, event: MqttEvent, session: &mut TelemetrySession) -> Result<()> {
        match event {
            MqttEvent::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    session.on_connected(ack.session_present)?;
                } else {
                    warn!(code = ?ack.code, "connection refused by server");
                }
            }
            MqttEvent::Outgoing(Outgoing::Subscribe(pkid)) => session.on_subscribe_sent(pkid),
            MqttEvent::Incoming(Packet::SubAck(ack)) => {
                let accepted = ack
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                session.on_suback(ack.pkid, accepted)?;
            }
            MqttEvent::Incoming(Packet::Publish(publish)) => {
                self.on_message(&publish.topic, &publish.payload).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.control_topic {
            debug!(topic, bytes = payload.len(), "message received");
            return;
        }

        info!(topic, payload = %String::from_utf8_lossy(payload), "control message received");
        match ControlCommand::parse(payload) {
            Ok(command) => {
                if let Err(e) = self.supervisor.send(command).await {
                    warn!(?command, error = %e, "failed to forward control command");
                }
            }
            Err(e) => warn!(error = %e, "ignoring control message"),
        }
    }
}

pub struct TelemetryBridge {
    options: MqttOptions,
    serial: String,
    device_name: String,
    update_topic: String,
    control_topic: String,
    poll_interval: Duration,
    error_delay: Duration,
    backoff: Backoff,
    channel: Arc<dyn Channel>,
    router: PacketRouter,
}

impl TelemetryBridge {
    pub fn new(
        config: &TelemetryConfig,
        serial: &str,
        channel: Arc<dyn Channel>,
        supervisor: SupervisorHandle,
    ) -> Result<Self> {
        let update_topic = device_topic(&config.update_topic, serial);
        info!(
            endpoint = %config.endpoint,
            port = config.port,
            update_topic = %update_topic,
            control_topic = %config.control_topic,
            "telemetry bridge configured"
        );

        Ok(Self {
            options: mqtt_options(config, serial)?,
            serial: serial.to_string(),
            device_name: device_name(config, serial),
            update_topic,
            control_topic: config.control_topic.clone(),
            poll_interval: config.poll_interval(),
            error_delay: config.reconnect_min(),
            backoff: Backoff::new(config.reconnect_min(), config.reconnect_max()),
            channel,
            router: PacketRouter::new(config.control_topic.clone(), supervisor),
        })
    }

    /// Drive the session until shutdown. Errors only for unrecoverable
    /// subscription state.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 64);
        let transport: Arc<dyn TelemetryTransport> = Arc::new(client.clone());

        let mut session = TelemetrySession::new(
            transport.clone(),
            self.update_topic.clone(),
            vec![self.update_topic.clone(), self.control_topic.clone()],
            self.backoff.clone(),
        );
        let consumer = EventConsumer::new(
            self.channel.clone(),
            Arc::new(ShadowPublisher::new(
                transport,
                self.update_topic.clone(),
                self.serial.clone(),
                self.device_name.clone(),
            )),
            self.poll_interval,
            self.error_delay,
        );

        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        session.begin_connect();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    shutdown_session(&client, &mut eventloop, &mut session).await;
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(event) => self.router.handle(event, &mut session).await?,
                    Err(e) => {
                        let delay = session.on_connection_error(&e.to_string());
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                session.close();
                                return Ok(());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        session.begin_reconnect();
                    }
                },
                _ = tick.tick(), if session.is_connected() => {
                    if let Err(e) = consumer.poll_once().await {
                        warn!(
                            channel = self.channel.name(),
                            error = %e,
                            retry_in = ?self.error_delay,
                            "failed to poll telemetry channel"
                        );
                        tick.reset_after(self.error_delay);
                    }
                }
            }
        }
    }
}

/// Queue OFF, then let the event loop flush it and the DISCONNECT.
async fn shutdown_session(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    session: &mut TelemetrySession,
) {
    let was_connected = session.is_connected();
    session.close();
    if !was_connected {
        return;
    }

    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "failed to queue disconnect");
        return;
    }

    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
        warn!("timed out flushing telemetry session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_options() {
        let config = TelemetryConfig {
            keep_alive_secs: 1,
            ..Default::default()
        };
        let options = mqtt_options(&config, "1420224231781").unwrap();
        assert_eq!(options.client_id(), "1420224231781");
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
        assert!(!options.clean_session());

        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "lwt/things/1420224231781/shadow/update");
    }

    #[test]
    fn test_missing_tls_material_is_fatal() {
        let config = TelemetryConfig {
            tls: Some(crate::config::TlsConfig {
                ca_path: "/nonexistent/ca.pem".into(),
                cert_path: "/nonexistent/cert.pem".into(),
                key_path: "/nonexistent/key.pem".into(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            mqtt_options(&config, "x"),
            Err(PipelineError::FatalInit(_))
        ));
    }
}
