// Configuration module for edge-pipeline
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let mut config = load_config(path)?;

    // Allow environment variables to override config values
    if let Ok(authkey) = std::env::var("BROKER_AUTHKEY") {
        config.broker.authkey = authkey;
    }

    if let Ok(serial) = std::env::var("DEVICE_SERIAL") {
        config.telemetry.serial_number = Some(serial);
    }

    if let Ok(bucket) = std::env::var("S3_BUCKET_NAME") {
        if let Some(s3_config) = config.storage.backend_config.as_s3_mut() {
            s3_config.bucket = bucket;
        }
    }

    ConfigLoader::validate(&config)?;

    Ok(config)
}

/// Apply sampler command-line overrides and validate the result again.
pub fn apply_sampler_overrides(
    config: &mut PipelineConfig,
    source_id: Option<&str>,
    max_batches: Option<u64>,
) -> Result<()> {
    if let Some(source_id) = source_id {
        config.sampler.source_id = source_id.to_string();
    }
    if max_batches.is_some() {
        config.sampler.max_batches = max_batches;
    }

    ConfigLoader::validate(config).context("Invalid command-line override")
}
