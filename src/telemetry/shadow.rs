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

// Shadow-style reported state documents and the handler that publishes them

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::session::{publish_json, TelemetryTransport};
use crate::consumer::{DispatchOutcome, EventHandler};
use crate::error::{PipelineError, Result};
use crate::event::{Event, EventKind};

pub const LEAKED: &str = "LEAKED";
pub const NO_LEAK: &str = "NO LEAK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Active,
    Off,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Active => "ACTIVE",
            PresenceStatus::Off => "OFF",
        }
    }
}

/// `{"state": {"reported": {<section>: <body>}}}`
pub fn reported(section: &str, body: Value) -> Value {
    json!({ "state": { "reported": { section: body } } })
}

pub fn presence(status: PresenceStatus) -> Value {
    reported("CONFIG", json!({ "STATUS": status.as_str() }))
}

pub fn gps_report(event: &Event) -> Value {
    let field = |key: &str| event.payload.get(key).cloned().unwrap_or(Value::Null);
    reported(
        "GPS",
        json!({
            "LAST_REPORTED": field("time"),
            "LATITUDE": field("latitude"),
            "LONGITUDE": field("longitude"),
            "MAPS_LINK": field("maps_link"),
        }),
    )
}

fn stamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}").expect("static regex is valid")
    })
}

/// Time of the last leak: the stamp embedded in the classified file name
/// when the batch was classified as leaked, `NO LEAK` otherwise.
pub fn leak_reported_time(file_path: &str, classification: &str) -> Result<String> {
    if classification != LEAKED {
        return Ok(NO_LEAK.to_string());
    }

    let file_name = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    stamp_pattern()
        .find(&file_name)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            PipelineError::Validation(format!(
                "leaked batch '{}' carries no timestamp",
                file_path
            ))
        })
}

pub fn monitoring_report(event: &Event) -> Result<Value> {
    let file_path = event.str_field("file_path").unwrap_or_default();
    let classification = event
        .payload
        .get("classification")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    let last_leak = leak_reported_time(file_path, &classification)?;
    Ok(reported(
        "MONITORING",
        json!({
            "LEAK": event.payload.get("LEAK").cloned().unwrap_or(Value::Null),
            "LAST_LEAK_REPORTED_TIME": last_leak,
        }),
    ))
}

pub fn account_report(serial: &str, device_name: &str) -> Value {
    reported(
        "ACCOUNT",
        json!({ "SERIAL_NO": serial, "DEVICE_NAME": device_name }),
    )
}

/// Turns GPS_UPDATE and MONITORING events into reported state on the
/// device update topic.
pub struct ShadowPublisher {
    transport: Arc<dyn TelemetryTransport>,
    topic: String,
    serial: String,
    device_name: String,
}

impl ShadowPublisher {
    pub fn new(
        transport: Arc<dyn TelemetryTransport>,
        topic: impl Into<String>,
        serial: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            serial: serial.into(),
            device_name: device_name.into(),
        }
    }

    fn publish(&self, document: &Value) -> std::result::Result<(), DispatchOutcome> {
        publish_json(self.transport.as_ref(), &self.topic, document)
            .map_err(|e| DispatchOutcome::Retryable(e.to_string()))
    }
}

#[async_trait]
impl EventHandler for ShadowPublisher {
    fn name(&self) -> &str {
        "shadow"
    }

    async fn handle(&self, event: &Event) -> DispatchOutcome {
        let documents = match event.kind {
            EventKind::GpsUpdate => vec![gps_report(event)],
            EventKind::Monitoring => match monitoring_report(event) {
                Ok(report) => vec![report, account_report(&self.serial, &self.device_name)],
                Err(e) => return DispatchOutcome::Rejected(e.to_string()),
            },
            _ => {
                return DispatchOutcome::Rejected(format!(
                    "{} events are not published as telemetry",
                    event.kind
                ))
            }
        };

        for document in &documents {
            if let Err(outcome) = self.publish(document) {
                return outcome;
            }
        }
        debug!(kind = %event.kind, topic = %self.topic, "reported state published");
        DispatchOutcome::Delivered
    }
}
