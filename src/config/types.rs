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

// Configuration types for edge-pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure, shared by every process role
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event broker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// host:port the broker binds to and clients connect to
    #[serde(default = "default_broker_address")]
    pub address: String,

    /// Shared secret every client presents in its handshake
    #[serde(default = "default_authkey")]
    pub authkey: String,

    /// Fixed set of channels created at broker startup
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            authkey: default_authkey(),
            channels: default_channels(),
            request_timeout_ms: default_request_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Batch sampler settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplerConfig {
    /// Source identifier embedded in batch file names, e.g. "BFA1"
    #[serde(default = "default_source_id")]
    pub source_id: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,

    /// Delay before retrying a failed read, write or enqueue
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Extra directories scanned for batch numbers on startup
    /// (e.g. where the uploader archives delivered batches)
    #[serde(default)]
    pub scan_dirs: Vec<PathBuf>,

    /// IANA timezone used for sample timestamps and file names
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Channel BATCH_CREATED events are enqueued on
    #[serde(default = "default_upload_channel")]
    pub channel: String,

    /// Stop after this many batches (unbounded when absent)
    #[serde(default)]
    pub max_batches: Option<u64>,

    #[serde(default)]
    pub source: SourceConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            source_id: default_source_id(),
            batch_size: default_batch_size(),
            sampling_interval_ms: default_sampling_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            output_dir: default_output_dir(),
            scan_dirs: Vec::new(),
            timezone: default_timezone(),
            channel: default_upload_channel(),
            max_batches: None,
            source: SourceConfig::default(),
        }
    }
}

impl SamplerConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Voltage source selection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Linux IIO sysfs channel (e.g. an ADS1015 behind the ti-ads1015 driver)
    Iio {
        raw_path: PathBuf,
        scale_path: PathBuf,
    },
    /// Deterministic waveform for bench runs
    Simulated {
        #[serde(default = "default_sim_offset")]
        offset_volts: f64,
        #[serde(default = "default_sim_amplitude")]
        amplitude_volts: f64,
        #[serde(default = "default_sim_period")]
        period_samples: u32,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Simulated {
            offset_volts: default_sim_offset(),
            amplitude_volts: default_sim_amplitude(),
            period_samples: default_sim_period(),
        }
    }
}

/// Upload consumer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploaderConfig {
    #[serde(default = "default_upload_channel")]
    pub channel: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause after a broker transport error before polling again
    #[serde(default = "default_error_delay_ms")]
    pub error_delay_ms: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Delivered batch files are moved here when set
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            channel: default_upload_channel(),
            poll_interval_ms: default_poll_interval_ms(),
            error_delay_ms: default_error_delay_ms(),
            max_retries: default_retries(),
            archive_dir: None,
        }
    }
}

impl UploaderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }
}

/// Object store configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "s3", "filesystem"
    pub backend: String,

    /// Backend-specific configuration
    #[serde(flatten)]
    pub backend_config: BackendConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".to_string(),
            backend_config: BackendConfig::S3 {
                s3: S3Config::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BackendConfig {
    S3 {
        #[serde(rename = "s3")]
        s3: S3Config,
    },
    Filesystem {
        #[serde(rename = "filesystem")]
        filesystem: FilesystemConfig,
    },
}

impl BackendConfig {
    pub fn as_s3(&self) -> Option<&S3Config> {
        match self {
            BackendConfig::S3 { s3 } => Some(s3),
            _ => None,
        }
    }

    pub fn as_s3_mut(&mut self) -> Option<&mut S3Config> {
        match self {
            BackendConfig::S3 { s3 } => Some(s3),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&FilesystemConfig> {
        match self {
            BackendConfig::Filesystem { filesystem } => Some(filesystem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services (MinIO etc.)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Folder markers created at startup, one per source id
    #[serde(default)]
    pub folders: Vec<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "edge-batches".to_string(),
            region: None,
            endpoint: None,
            folders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    pub base_path: PathBuf,

    #[serde(default)]
    pub folders: Vec<String>,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/data/object-store"),
            folders: Vec::new(),
        }
    }
}

/// Telemetry bridge (MQTT device shadow) settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_mqtt_host")]
    pub endpoint: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Overrides the serial number read from `serial_path`
    #[serde(default)]
    pub serial_number: Option<String>,

    #[serde(default = "default_serial_path")]
    pub serial_path: PathBuf,

    /// Topic templates; `$$macid` is replaced by the serial number
    #[serde(default = "default_update_topic")]
    pub update_topic: String,

    #[serde(default = "default_lwt_topic")]
    pub lwt_topic: String,

    #[serde(default = "default_control_topic")]
    pub control_topic: String,

    /// Channel GPS/MONITORING events are drained from
    #[serde(default = "default_iot_channel")]
    pub channel: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub clean_session: bool,

    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Serial number -> human readable device name
    #[serde(default)]
    pub device_names: HashMap<String, String>,

    #[serde(default)]
    pub producer: ProducerConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: None,
            serial_number: None,
            serial_path: default_serial_path(),
            update_topic: default_update_topic(),
            lwt_topic: default_lwt_topic(),
            control_topic: default_control_topic(),
            channel: default_iot_channel(),
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: false,
            reconnect_min_secs: default_reconnect_min_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            device_names: HashMap::new(),
            producer: ProducerConfig::default(),
        }
    }
}

impl TelemetryConfig {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// How the telemetry bridge launches the sampler on a "start" command
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Program to run; defaults to this executable's `sampler` subcommand
    #[serde(default)]
    pub program: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl ProducerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"

    /// When set, each process role also appends to `<directory>/<role>.log`
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
        }
    }
}

// Default value functions
fn default_broker_address() -> String { "127.0.0.1:50000".to_string() }
fn default_authkey() -> String { "changeme".to_string() }
fn default_channels() -> Vec<String> {
    vec![
        "file_events".to_string(),
        "iot_events".to_string(),
        "s3_events".to_string(),
    ]
}
fn default_request_timeout_ms() -> u64 { 5000 }
fn default_max_frame_bytes() -> usize { 64 * 1024 }
fn default_source_id() -> String { "BFA1".to_string() }
fn default_batch_size() -> usize { 100 }
fn default_sampling_interval_ms() -> u64 { 100 }
fn default_retry_delay_ms() -> u64 { 5000 }
fn default_output_dir() -> PathBuf { PathBuf::from("/data/adc_batches") }
fn default_timezone() -> String { "Asia/Kolkata".to_string() }
fn default_upload_channel() -> String { "s3_events".to_string() }
fn default_iot_channel() -> String { "iot_events".to_string() }
fn default_sim_offset() -> f64 { 1.65 }
fn default_sim_amplitude() -> f64 { 0.5 }
fn default_sim_period() -> u32 { 50 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_error_delay_ms() -> u64 { 5000 }
fn default_retries() -> u32 { 3 }
fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 8883 }
fn default_serial_path() -> PathBuf { PathBuf::from("/proc/device-tree/serial-number") }
fn default_update_topic() -> String { "$aws/things/$$macid/shadow/update".to_string() }
fn default_lwt_topic() -> String { "lwt/things/$$macid/shadow/update".to_string() }
fn default_control_topic() -> String { "edge/control".to_string() }
fn default_keep_alive_secs() -> u64 { 5 }
fn default_reconnect_min_secs() -> u64 { 1 }
fn default_reconnect_max_secs() -> u64 { 32 }
fn default_stop_grace_secs() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
