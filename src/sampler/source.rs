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

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};

/// A scalar voltage reading source sampled by the batch producer.
#[async_trait]
pub trait VoltageSource: Send + Sync {
    /// Take one reading, in volts.
    async fn read_voltage(&mut self) -> Result<f64>;

    fn describe(&self) -> String;
}

/// Linux IIO sysfs channel.
///
/// Volts = raw * scale / 1000, with `scale` in millivolts per LSB as the
/// kernel exposes it (ti-ads1015 and friends).
pub struct IioVoltageSource {
    raw_path: PathBuf,
    scale_mv: f64,
}

impl IioVoltageSource {
    /// Open the channel and take one probe reading. Any failure here means
    /// the sensor bus is unusable.
    pub async fn open(raw_path: &Path, scale_path: &Path) -> Result<Self> {
        let scale_mv = read_number::<f64>(scale_path).await.map_err(|e| {
            PipelineError::FatalInit(format!("sensor scale {}: {}", scale_path.display(), e))
        })?;

        let mut source = Self {
            raw_path: raw_path.to_path_buf(),
            scale_mv,
        };
        source.read_voltage().await.map_err(|e| {
            PipelineError::FatalInit(format!("sensor probe {}: {}", raw_path.display(), e))
        })?;

        info!(raw = %raw_path.display(), scale_mv, "IIO voltage source initialized");
        Ok(source)
    }
}

#[async_trait]
impl VoltageSource for IioVoltageSource {
    async fn read_voltage(&mut self) -> Result<f64> {
        let raw = read_number::<i64>(&self.raw_path).await?;
        Ok(raw as f64 * self.scale_mv / 1000.0)
    }

    fn describe(&self) -> String {
        format!("iio:{}", self.raw_path.display())
    }
}

async fn read_number<T: std::str::FromStr>(path: &Path) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::resource(format!("read {}", path.display()), e))?;
    text.trim().parse::<T>().map_err(|e| {
        PipelineError::resource(
            format!("parse {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        )
    })
}

/// Sine wave around an offset, one step per reading.
pub struct SimulatedVoltageSource {
    offset: f64,
    amplitude: f64,
    period: u32,
    step: u64,
}

impl SimulatedVoltageSource {
    pub fn new(offset: f64, amplitude: f64, period: u32) -> Self {
        Self {
            offset,
            amplitude,
            period: period.max(1),
            step: 0,
        }
    }
}

#[async_trait]
impl VoltageSource for SimulatedVoltageSource {
    async fn read_voltage(&mut self) -> Result<f64> {
        let phase = (self.step % self.period as u64) as f64 / self.period as f64;
        self.step += 1;
        Ok(self.offset + self.amplitude * (std::f64::consts::TAU * phase).sin())
    }

    fn describe(&self) -> String {
        format!(
            "simulated(offset={}, amplitude={}, period={})",
            self.offset, self.amplitude, self.period
        )
    }
}

pub async fn open_source(config: &SourceConfig) -> Result<Box<dyn VoltageSource>> {
    match config {
        SourceConfig::Iio {
            raw_path,
            scale_path,
        } => Ok(Box::new(IioVoltageSource::open(raw_path, scale_path).await?)),
        SourceConfig::Simulated {
            offset_volts,
            amplitude_volts,
            period_samples,
        } => Ok(Box::new(SimulatedVoltageSource::new(
            *offset_volts,
            *amplitude_volts,
            *period_samples,
        ))),
    }
}
