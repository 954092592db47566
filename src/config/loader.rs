// Configuration loader with environment variable substitution

use super::types::*;
use crate::sampler::batch::valid_source_id;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        Self::load_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn load_str(content: &str) -> Result<PipelineConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: PipelineConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${BROKER_AUTHKEY:-changeme} -> changeme (if BROKER_AUTHKEY not set)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
            .context("Invalid substitution pattern")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string())
    }

    /// Validate configuration
    pub fn validate(config: &PipelineConfig) -> Result<()> {
        // Broker
        if config.broker.authkey.is_empty() {
            bail!("broker.authkey cannot be empty");
        }
        if config.broker.channels.is_empty() {
            bail!("broker.channels must name at least one channel");
        }
        let mut seen = HashSet::new();
        for name in &config.broker.channels {
            if name.is_empty() {
                bail!("broker.channels contains an empty channel name");
            }
            if !seen.insert(name.as_str()) {
                bail!("broker.channels contains duplicate channel '{}'", name);
            }
        }
        if config.broker.max_frame_bytes < 256 {
            bail!("broker.max_frame_bytes must be >= 256");
        }

        for (field, channel) in [
            ("sampler.channel", &config.sampler.channel),
            ("uploader.channel", &config.uploader.channel),
            ("telemetry.channel", &config.telemetry.channel),
        ] {
            if !seen.contains(channel.as_str()) {
                bail!(
                    "{} '{}' is not one of broker.channels {:?}",
                    field,
                    channel,
                    config.broker.channels
                );
            }
        }

        // Sampler
        if config.sampler.batch_size == 0 {
            bail!("sampler.batch_size must be > 0");
        }
        if config.sampler.sampling_interval_ms == 0 {
            bail!("sampler.sampling_interval_ms must be > 0");
        }
        if !valid_source_id(&config.sampler.source_id) {
            bail!(
                "sampler.source_id must be non-empty and alphanumeric, got '{}'",
                config.sampler.source_id
            );
        }
        if config.sampler.timezone.parse::<chrono_tz::Tz>().is_err() {
            bail!("sampler.timezone '{}' is not a known timezone", config.sampler.timezone);
        }
        if let SourceConfig::Simulated { period_samples, .. } = &config.sampler.source {
            if *period_samples == 0 {
                bail!("sampler.source.period_samples must be > 0");
            }
        }

        // Uploader
        if config.uploader.poll_interval_ms == 0 {
            bail!("uploader.poll_interval_ms must be > 0");
        }

        // Storage backend
        match config.storage.backend.as_str() {
            "s3" => match config.storage.backend_config.as_s3() {
                Some(s3) if s3.bucket.is_empty() => bail!("s3.bucket cannot be empty"),
                Some(_) => {}
                None => bail!("s3 backend selected but s3 config missing"),
            },
            "filesystem" => {
                if config.storage.backend_config.as_filesystem().is_none() {
                    bail!("filesystem backend selected but filesystem config missing");
                }
            }
            unknown => bail!("Unknown backend: '{}'. Supported: s3, filesystem", unknown),
        }

        // Telemetry
        if config.telemetry.reconnect_min_secs == 0 {
            bail!("telemetry.reconnect_min_secs must be > 0");
        }
        if config.telemetry.reconnect_min_secs > config.telemetry.reconnect_max_secs {
            bail!("telemetry.reconnect_min_secs must not exceed reconnect_max_secs");
        }
        if config.telemetry.control_topic.is_empty() || config.telemetry.update_topic.is_empty() {
            bail!("telemetry topics cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("EDGE_TEST_VAR", "test_value");

        let input = "authkey: ${EDGE_TEST_VAR}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "authkey: test_value");

        std::env::remove_var("EDGE_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("EDGE_TEST_VAR2");

        let input = "source_id: ${EDGE_TEST_VAR2:-BFA2}";
        let output = ConfigLoader::substitute_env_vars(input).unwrap();
        assert_eq!(output, "source_id: BFA2");
    }

    #[test]
    fn test_unset_var_without_default_kept() {
        std::env::remove_var("EDGE_TEST_VAR3");

        let output = ConfigLoader::substitute_env_vars("x: ${EDGE_TEST_VAR3}").unwrap();
        assert_eq!(output, "x: ${EDGE_TEST_VAR3}");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigLoader::validate(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let mut config = PipelineConfig::default();
        config.sampler.batch_size = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_unknown_channel() {
        let mut config = PipelineConfig::default();
        config.uploader.channel = "missing".to_string();

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("uploader.channel"));
    }

    #[test]
    fn test_validation_duplicate_channel() {
        let mut config = PipelineConfig::default();
        config.broker.channels.push("s3_events".to_string());

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_validation_bad_timezone() {
        let mut config = PipelineConfig::default();
        config.sampler.timezone = "Mars/Olympus".to_string();

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("timezone"));
    }

    #[test]
    fn test_validation_reconnect_bounds() {
        let mut config = PipelineConfig::default();
        config.telemetry.reconnect_min_secs = 64;

        assert!(ConfigLoader::validate(&config).is_err());
    }
}
