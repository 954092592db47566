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

// Events carried on broker channels.
//
// On the wire an event is a flat JSON object: `event_type` names the kind,
// `enqueued_at` is an optional RFC 3339 stamp and every other key is payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

pub const EVENT_TYPE_KEY: &str = "event_type";
pub const ENQUEUED_AT_KEY: &str = "enqueued_at";

/// Known event kinds. Anything else decodes to `Unknown` and is rejected
/// by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    BatchCreated,
    GpsUpdate,
    Monitoring,
    Unknown(String),
}

impl EventKind {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "ADC_BATCH_CREATED" | "BATCH_CREATED" => EventKind::BatchCreated,
            "GPS_UPDATE" => EventKind::GpsUpdate,
            "MONITORING" | "MONITORING_RESULT" => EventKind::Monitoring,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::BatchCreated => "ADC_BATCH_CREATED",
            EventKind::GpsUpdate => "GPS_UPDATE",
            EventKind::Monitoring => "MONITORING",
            EventKind::Unknown(name) => name,
        }
    }

    /// Payload keys every event of this kind must carry.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::BatchCreated => &["file_path"],
            EventKind::GpsUpdate => &["time", "latitude", "longitude", "maps_link"],
            EventKind::Monitoring => &["LEAK", "file_path", "classification"],
            EventKind::Unknown(_) => &[],
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    /// Advisory only; consumers never order by it.
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
            enqueued_at: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn stamped(mut self) -> Self {
        self.enqueued_at = Some(Utc::now());
        self
    }

    /// The event a producer emits once a batch file is fully on disk.
    pub fn batch_created(file_path: &Path) -> Self {
        Event::new(EventKind::BatchCreated)
            .with_field("file_path", file_path.to_string_lossy().into_owned())
            .stamped()
    }

    /// Decode the wire envelope. Only structural problems fail here; field
    /// requirements are checked by [`Event::validate`].
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| PipelineError::Validation(format!("malformed JSON: {}", e)))?;

        let Value::Object(mut payload) = value else {
            return Err(PipelineError::Validation(
                "event envelope must be a JSON object".to_string(),
            ));
        };

        let kind = match payload.remove(EVENT_TYPE_KEY) {
            Some(Value::String(name)) => EventKind::from_wire(&name),
            Some(other) => {
                return Err(PipelineError::Validation(format!(
                    "event_type must be a string, got {}",
                    other
                )))
            }
            None => {
                return Err(PipelineError::Validation(
                    "missing event_type".to_string(),
                ))
            }
        };

        let enqueued_at = payload
            .remove(ENQUEUED_AT_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(Self {
            kind,
            payload,
            enqueued_at,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        let mut envelope = Map::with_capacity(self.payload.len() + 2);
        envelope.insert(
            EVENT_TYPE_KEY.to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        for (key, value) in &self.payload {
            envelope.insert(key.clone(), value.clone());
        }
        if let Some(at) = self.enqueued_at {
            envelope.insert(
                ENQUEUED_AT_KEY.to_string(),
                Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        Ok(serde_json::to_string(&Value::Object(envelope))?)
    }

    /// Check the payload against the requirements of its kind.
    pub fn validate(&self) -> Result<()> {
        if let EventKind::Unknown(name) = &self.kind {
            return Err(PipelineError::Validation(format!(
                "unknown event type '{}'",
                name
            )));
        }

        for field in self.kind.required_fields() {
            match self.payload.get(*field) {
                None | Some(Value::Null) => {
                    return Err(PipelineError::Validation(format!(
                        "{} event missing required field '{}'",
                        self.kind, field
                    )))
                }
                Some(Value::Object(_)) | Some(Value::Array(_)) => {
                    return Err(PipelineError::Validation(format!(
                        "field '{}' must be a scalar",
                        field
                    )))
                }
                Some(_) => {}
            }
        }

        if self.payload.contains_key("file_path") {
            match self.str_field("file_path") {
                Some(path) if !path.trim().is_empty() => {}
                _ => {
                    return Err(PipelineError::Validation(
                        "file_path must be a non-empty string".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.str_field("file_path").map(PathBuf::from)
    }
}
