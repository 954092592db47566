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

// Telemetry session, shadow publishing and producer supervision tests

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edge_pipeline::consumer::{DispatchOutcome, EventHandler};
use edge_pipeline::telemetry::{
    Backoff, ControlCommand, PacketRouter, ProducerSpec, ProducerSupervisor, SessionState,
    ShadowPublisher, TelemetrySession, TelemetryTransport,
};
use rumqttc::{
    ConnAck, ConnectReturnCode, Event as MqttEvent, Outgoing, Packet, Publish, QoS, SubAck,
    SubscribeReasonCode,
};
use edge_pipeline::{Event, EventKind, PipelineError, Result};

const UPDATE_TOPIC: &str = "$aws/things/1420224231781/shadow/update";
const CONTROL_TOPIC: &str = "edge/control";

#[derive(Default)]
struct RecordingTransport {
    published: Mutex<Vec<(String, Value)>>,
    subscribed: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    fn status_messages(&self) -> Vec<String> {
        self.published()
            .iter()
            .filter_map(|(_, doc)| doc["state"]["reported"]["CONFIG"]["STATUS"].as_str().map(String::from))
            .collect()
    }
}

impl TelemetryTransport for RecordingTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let doc: Value = serde_json::from_slice(&payload)?;
        self.published.lock().unwrap().push((topic.to_string(), doc));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

/// Transport whose outgoing queue is full.
struct FullTransport;

impl TelemetryTransport for FullTransport {
    fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<()> {
        Err(PipelineError::Transport("request queue full".to_string()))
    }

    fn subscribe(&self, _topic: &str) -> Result<()> {
        Err(PipelineError::Transport("request queue full".to_string()))
    }
}

fn session(transport: Arc<RecordingTransport>) -> TelemetrySession {
    TelemetrySession::new(
        transport,
        UPDATE_TOPIC,
        vec![UPDATE_TOPIC.to_string(), CONTROL_TOPIC.to_string()],
        Backoff::new(Duration::from_secs(1), Duration::from_secs(32)),
    )
}

/// Acknowledge every queued subscribe, numbering packets from `first_pkid`.
fn ack_all(session: &mut TelemetrySession, count: usize, first_pkid: u16) -> Result<()> {
    for i in 0..count as u16 {
        session.on_subscribe_sent(first_pkid + i);
    }
    for i in 0..count as u16 {
        session.on_suback(first_pkid + i, true)?;
    }
    Ok(())
}

#[test]
fn test_reconnect_republishes_active_and_resubscribes() {
    let transport = Arc::new(RecordingTransport::default());
    let mut session = session(transport.clone());
    assert_eq!(session.state(), SessionState::Disconnected);

    session.begin_connect();
    assert_eq!(session.state(), SessionState::Connecting);

    session.on_connected(false).unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    ack_all(&mut session, 2, 1).unwrap();
    assert_eq!(transport.status_messages(), vec!["ACTIVE"]);
    assert_eq!(transport.subscribed(), vec![UPDATE_TOPIC, CONTROL_TOPIC]);

    let delay = session.on_connection_error("connection reset by peer");
    assert_eq!(session.state(), SessionState::Interrupted);
    assert_eq!(delay, Duration::from_secs(1));

    session.begin_reconnect();
    assert_eq!(session.state(), SessionState::Reconnecting);

    // Server lost the session
    session.on_connected(false).unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    ack_all(&mut session, 2, 3).unwrap();

    assert_eq!(transport.status_messages(), vec!["ACTIVE", "ACTIVE"]);
    assert_eq!(
        transport.subscribed(),
        vec![UPDATE_TOPIC, CONTROL_TOPIC, UPDATE_TOPIC, CONTROL_TOPIC]
    );
    for (topic, _) in transport.published() {
        assert_eq!(topic, UPDATE_TOPIC);
    }
}

#[test]
fn test_resumed_session_keeps_subscriptions() {
    let transport = Arc::new(RecordingTransport::default());
    let mut session = session(transport.clone());

    session.begin_connect();
    session.on_connected(false).unwrap();
    ack_all(&mut session, 2, 1).unwrap();

    session.on_connection_error("keep alive timeout");
    session.begin_reconnect();
    session.on_connected(true).unwrap();

    assert_eq!(transport.status_messages(), vec!["ACTIVE", "ACTIVE"]);
    assert_eq!(transport.subscribed().len(), 2);
}

#[test]
fn test_rejected_resubscribe_is_fatal() {
    let transport = Arc::new(RecordingTransport::default());
    let mut session = session(transport.clone());

    session.begin_connect();
    session.on_connected(false).unwrap();
    ack_all(&mut session, 2, 1).unwrap();

    session.on_connection_error("network unreachable");
    session.begin_reconnect();
    session.on_connected(false).unwrap();
    session.on_subscribe_sent(3);
    session.on_subscribe_sent(4);
    session.on_suback(3, true).unwrap();

    let err = session.on_suback(4, false).unwrap_err();
    match err {
        PipelineError::ResubscribeRejected(topic) => assert_eq!(topic, CONTROL_TOPIC),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_backoff_grows_while_disconnected_and_resets_on_connect() {
    let transport = Arc::new(RecordingTransport::default());
    let mut session = session(transport);

    session.begin_connect();
    let delays: Vec<u64> = (0..7)
        .map(|_| {
            let delay = session.on_connection_error("connection refused").as_secs();
            session.begin_reconnect();
            delay
        })
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 32]);

    session.on_connected(false).unwrap();
    assert_eq!(
        session.on_connection_error("reset"),
        Duration::from_secs(1)
    );
}

#[test]
fn test_close_publishes_off() {
    let transport = Arc::new(RecordingTransport::default());
    let mut session = session(transport.clone());

    session.begin_connect();
    session.on_connected(true).unwrap();
    session.close();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(transport.status_messages(), vec!["ACTIVE", "OFF"]);

    // No reconnect after close
    session.begin_reconnect();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_shadow_publisher_monitoring_and_account() {
    let transport = Arc::new(RecordingTransport::default());
    let publisher = ShadowPublisher::new(transport.clone(), UPDATE_TOPIC, "1420224231781", "BFA-2");

    let event = Event::new(EventKind::Monitoring)
        .with_field("LEAK", "YES")
        .with_field("file_path", "/data/classified/BFA1_Batch7_2024-02-03_04-05-06.csv")
        .with_field("classification", "LEAKED");
    assert_eq!(publisher.handle(&event).await, DispatchOutcome::Delivered);

    let published = transport.published();
    assert_eq!(published.len(), 2);
    let monitoring = &published[0].1["state"]["reported"]["MONITORING"];
    assert_eq!(monitoring["LEAK"], "YES");
    assert_eq!(monitoring["LAST_LEAK_REPORTED_TIME"], "2024-02-03_04-05-06");
    let account = &published[1].1["state"]["reported"]["ACCOUNT"];
    assert_eq!(account["SERIAL_NO"], "1420224231781");
    assert_eq!(account["DEVICE_NAME"], "BFA-2");
}

#[tokio::test]
async fn test_shadow_publisher_gps_and_rejections() {
    let transport = Arc::new(RecordingTransport::default());
    let publisher = ShadowPublisher::new(transport.clone(), UPDATE_TOPIC, "1", "1");

    let gps = Event::new(EventKind::GpsUpdate)
        .with_field("time", "2024-01-01 10:00:00")
        .with_field("latitude", 12.97)
        .with_field("longitude", 77.59)
        .with_field("maps_link", "https://maps.google.com/?q=12.97,77.59");
    assert_eq!(publisher.handle(&gps).await, DispatchOutcome::Delivered);
    assert_eq!(
        transport.published()[0].1["state"]["reported"]["GPS"]["LONGITUDE"],
        77.59
    );

    let batch = Event::new(EventKind::BatchCreated).with_field("file_path", "/data/x.csv");
    assert!(matches!(
        publisher.handle(&batch).await,
        DispatchOutcome::Rejected(_)
    ));

    let full = ShadowPublisher::new(Arc::new(FullTransport), UPDATE_TOPIC, "1", "1");
    assert!(matches!(full.handle(&gps).await, DispatchOutcome::Retryable(_)));
}

fn connack(code: ConnectReturnCode, session_present: bool) -> MqttEvent {
    MqttEvent::Incoming(Packet::ConnAck(ConnAck::new(code, session_present)))
}

fn suback(pkid: u16, code: SubscribeReasonCode) -> MqttEvent {
    MqttEvent::Incoming(Packet::SubAck(SubAck::new(pkid, vec![code])))
}

fn control_message(topic: &str, payload: &str) -> MqttEvent {
    MqttEvent::Incoming(Packet::Publish(Publish::new(
        topic,
        QoS::AtLeastOnce,
        payload.as_bytes().to_vec(),
    )))
}

#[tokio::test]
async fn test_router_treats_rejected_suback_as_fatal() {
    let (supervisor, task) = ProducerSupervisor::spawn(ProducerSpec {
        program: "true".into(),
        args: Vec::new(),
        stop_grace: Duration::from_secs(1),
    });
    let router = PacketRouter::new(CONTROL_TOPIC, supervisor);
    let transport = Arc::new(RecordingTransport::default());
    let mut session = session(transport.clone());
    session.begin_connect();

    // A refused CONNACK does not connect the session
    router
        .handle(connack(ConnectReturnCode::NotAuthorized, false), &mut session)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Connecting);

    router
        .handle(connack(ConnectReturnCode::Success, false), &mut session)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(transport.subscribed(), vec![UPDATE_TOPIC, CONTROL_TOPIC]);

    for pkid in [1, 2] {
        router
            .handle(MqttEvent::Outgoing(Outgoing::Subscribe(pkid)), &mut session)
            .await
            .unwrap();
    }
    router
        .handle(suback(1, SubscribeReasonCode::Success(QoS::AtLeastOnce)), &mut session)
        .await
        .unwrap();

    let err = router
        .handle(suback(2, SubscribeReasonCode::Failure), &mut session)
        .await
        .unwrap_err();
    match err {
        PipelineError::ResubscribeRejected(topic) => assert_eq!(topic, CONTROL_TOPIC),
        other => panic!("unexpected error: {:?}", other),
    }

    drop(router);
    task.await.unwrap();
}

#[cfg(unix)]
mod supervision {
    use super::*;
    use std::time::Instant;

    fn spec(program: &str, args: &[&str], grace: Duration) -> ProducerSpec {
        ProducerSpec {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stop_grace: grace,
        }
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let (handle, task) =
            ProducerSupervisor::spawn(spec("sleep", &["30"], Duration::from_secs(5)));

        handle.send(ControlCommand::Stop).await.unwrap();
        assert_eq!(handle.running_pid().await.unwrap(), None);

        handle.send(ControlCommand::Start).await.unwrap();
        let pid = handle.running_pid().await.unwrap();
        assert!(pid.is_some());

        handle.send(ControlCommand::Start).await.unwrap();
        assert_eq!(handle.running_pid().await.unwrap(), pid);

        handle.send(ControlCommand::Stop).await.unwrap();
        assert_eq!(handle.running_pid().await.unwrap(), None);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_then_start_is_serialized() {
        let (handle, task) =
            ProducerSupervisor::spawn(spec("sleep", &["30"], Duration::from_secs(5)));

        handle.send(ControlCommand::Start).await.unwrap();
        let first = handle.running_pid().await.unwrap().unwrap();

        // Queued back to back; the start waits for the stop to finish
        handle.send(ControlCommand::Stop).await.unwrap();
        handle.send(ControlCommand::Start).await.unwrap();

        let second = handle.running_pid().await.unwrap().unwrap();
        assert_ne!(first, second);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stubborn_producer_is_killed_after_grace() {
        let (handle, task) = ProducerSupervisor::spawn(spec(
            "sh",
            &["-c", "trap '' TERM; exec sleep 30"],
            Duration::from_millis(300),
        ));

        handle.send(ControlCommand::Start).await.unwrap();
        assert!(handle.running_pid().await.unwrap().is_some());
        // Let the shell install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        handle.send(ControlCommand::Stop).await.unwrap();
        assert_eq!(handle.running_pid().await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(300));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_producer_can_be_restarted() {
        let (handle, task) =
            ProducerSupervisor::spawn(spec("sleep", &["0.3"], Duration::from_secs(1)));

        handle.send(ControlCommand::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        // The exited child is forgotten, so start launches a new one
        assert_eq!(handle.running_pid().await.unwrap(), None);
        handle.send(ControlCommand::Start).await.unwrap();
        assert!(handle.running_pid().await.unwrap().is_some());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_router_forwards_control_messages() {
        let (supervisor, task) =
            ProducerSupervisor::spawn(spec("sleep", &["30"], Duration::from_secs(5)));
        let router = PacketRouter::new(CONTROL_TOPIC, supervisor.clone());
        let mut session = session(Arc::new(RecordingTransport::default()));

        // Commands on other topics are not control messages
        router
            .handle(control_message(UPDATE_TOPIC, r#"{"command": "start"}"#), &mut session)
            .await
            .unwrap();
        assert_eq!(supervisor.running_pid().await.unwrap(), None);

        router
            .handle(control_message(CONTROL_TOPIC, r#"{"command": "START"}"#), &mut session)
            .await
            .unwrap();
        let pid = supervisor.running_pid().await.unwrap();
        assert!(pid.is_some());

        // Garbage is logged and ignored
        router
            .handle(control_message(CONTROL_TOPIC, "reboot now"), &mut session)
            .await
            .unwrap();
        assert_eq!(supervisor.running_pid().await.unwrap(), pid);

        router
            .handle(control_message(CONTROL_TOPIC, r#"{"command": "stop"}"#), &mut session)
            .await
            .unwrap();
        assert_eq!(supervisor.running_pid().await.unwrap(), None);

        drop(router);
        drop(supervisor);
        task.await.unwrap();
    }
}
