// Telemetry bridge module
//
// Device presence and reported state over MQTT, plus remote start/stop of
// the sampler process.

pub mod bridge;
pub mod device;
pub mod session;
pub mod shadow;
pub mod supervisor;

pub use bridge::{mqtt_options, PacketRouter, TelemetryBridge};
pub use device::{device_name, device_topic, resolve_serial};
pub use session::{Backoff, SessionState, TelemetrySession, TelemetryTransport};
pub use shadow::{PresenceStatus, ShadowPublisher};
pub use supervisor::{ControlCommand, ProducerSpec, ProducerSupervisor, SupervisorHandle};
