// Device identity: hardware serial number and derived topics

use std::path::Path;
use tracing::info;

use crate::config::TelemetryConfig;
use crate::error::{PipelineError, Result};

/// Placeholder replaced by the serial number in topic templates.
pub const SERIAL_PLACEHOLDER: &str = "$$macid";

/// Read the serial number exposed by the device tree. The kernel pads the
/// value with NUL bytes.
pub async fn read_serial_number(path: &Path) -> Result<String> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::FatalInit(format!("read serial {}: {}", path.display(), e)))?;

    let serial: String = String::from_utf8_lossy(&raw)
        .chars()
        .filter(|c| *c != '\0')
        .collect::<String>()
        .trim()
        .to_string();

    if serial.is_empty() {
        return Err(PipelineError::FatalInit(format!(
            "serial number at {} is empty",
            path.display()
        )));
    }
    Ok(serial)
}

/// Configured serial wins over the device tree.
pub async fn resolve_serial(config: &TelemetryConfig) -> Result<String> {
    let serial = match &config.serial_number {
        Some(serial) if !serial.trim().is_empty() => serial.trim().to_string(),
        _ => read_serial_number(&config.serial_path).await?,
    };
    info!(serial = %serial, "device serial number");
    Ok(serial)
}

pub fn device_topic(template: &str, serial: &str) -> String {
    template.replace(SERIAL_PLACEHOLDER, serial)
}

/// Human readable name for the ACCOUNT section; the serial when unmapped.
pub fn device_name(config: &TelemetryConfig, serial: &str) -> String {
    config
        .device_names
        .get(serial)
        .cloned()
        .unwrap_or_else(|| serial.to_string())
}
