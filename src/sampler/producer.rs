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

use chrono::Utc;
use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::{
    clear_pending, last_batch_number, mark_pending, pending_batches, render_csv,
    sweep_temp_files, valid_source_id, write_batch_atomic, BatchFileName, Sample,
};
use super::source::VoltageSource;
use crate::broker::Channel;
use crate::config::SamplerConfig;
use crate::error::{PipelineError, Result};
use crate::event::Event;

/// Time left to sleep in a sampling period once a read took `elapsed`.
pub fn pacing_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// A batch file that made it to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedBatch {
    pub path: PathBuf,
    /// False when cancelled before the event was enqueued; the pending
    /// marker stays and the next start announces it.
    pub announced: bool,
}

/// Samples a voltage source at a fixed period, persists every full batch as
/// a numbered CSV file and announces it with one BATCH_CREATED event.
pub struct BatchProducer {
    source_id: String,
    batch_size: usize,
    sampling_interval: Duration,
    retry_delay: Duration,
    output_dir: PathBuf,
    timezone: Tz,
    max_batches: Option<u64>,
    next_batch: u64,
    pending: Vec<PathBuf>,
    source: Box<dyn VoltageSource>,
    channel: Arc<dyn Channel>,
}

impl BatchProducer {
    /// Create the output directory and resume numbering after the highest
    /// batch already on disk.
    pub async fn new(
        config: &SamplerConfig,
        source: Box<dyn VoltageSource>,
        channel: Arc<dyn Channel>,
    ) -> Result<Self> {
        if !valid_source_id(&config.source_id) {
            return Err(PipelineError::FatalInit(format!(
                "source id '{}' must be non-empty and alphanumeric",
                config.source_id
            )));
        }

        let timezone: Tz = config.timezone.parse().map_err(|_| {
            PipelineError::FatalInit(format!("unknown timezone '{}'", config.timezone))
        })?;

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| {
                PipelineError::FatalInit(format!(
                    "create output directory {}: {}",
                    config.output_dir.display(),
                    e
                ))
            })?;

        let mut scan_dirs = vec![config.output_dir.clone()];
        scan_dirs.extend(config.scan_dirs.iter().cloned());
        let last = last_batch_number(&scan_dirs, &config.source_id).await?;

        sweep_temp_files(&config.output_dir).await?;
        let pending = pending_batches(&config.output_dir).await?;
        if !pending.is_empty() {
            warn!(count = pending.len(), "found batches that were never announced");
        }

        info!(
            source_id = %config.source_id,
            source = %source.describe(),
            channel = channel.name(),
            next_batch = last + 1,
            "batch producer initialized"
        );

        Ok(Self {
            source_id: config.source_id.clone(),
            batch_size: config.batch_size,
            sampling_interval: config.sampling_interval(),
            retry_delay: config.retry_delay(),
            output_dir: config.output_dir.clone(),
            timezone,
            max_batches: config.max_batches,
            next_batch: last + 1,
            pending,
            source,
            channel,
        })
    }

    pub fn next_batch_number(&self) -> u64 {
        self.next_batch
    }

    /// Batches persisted by an earlier run whose event is still owed.
    pub fn pending_announcements(&self) -> &[PathBuf] {
        &self.pending
    }

    /// Announce every batch still owed, oldest first. False if cancelled
    /// before all of them were enqueued.
    pub async fn announce_pending(&mut self, shutdown: &CancellationToken) -> bool {
        while let Some(path) = self.pending.first().cloned() {
            info!(path = %path.display(), "announcing batch from previous run");
            if !self.announce(&path, shutdown).await {
                return false;
            }
            self.pending.remove(0);
        }
        true
    }

    /// Produce batches until cancelled (or `max_batches` is reached).
    /// Returns the number of batches persisted.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> u64 {
        let mut produced = 0;

        if !self.announce_pending(shutdown).await {
            info!(produced, "batch producer stopped");
            return produced;
        }

        loop {
            if let Some(max) = self.max_batches {
                if produced >= max {
                    info!(produced, "batch limit reached");
                    break;
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            match self.produce_batch(shutdown).await {
                Some(batch) => {
                    produced += 1;
                    if !batch.announced {
                        warn!(
                            path = %batch.path.display(),
                            "stopping with batch unannounced, it is announced on next start"
                        );
                        break;
                    }
                }
                None => break,
            }
        }

        info!(produced, "batch producer stopped");
        produced
    }

    /// Collect, persist and announce one batch. `None` when cancelled before
    /// the batch file was written.
    pub async fn produce_batch(&mut self, shutdown: &CancellationToken) -> Option<ProducedBatch> {
        let number = self.next_batch;
        info!(batch = number, "starting collection");

        let Some(samples) = self.collect_batch(shutdown).await else {
            info!(batch = number, "collection cancelled, partial batch discarded");
            return None;
        };

        let path = self.persist(number, &samples, shutdown).await?;
        // The number is spent as soon as the file exists.
        self.next_batch += 1;

        let announced = self.announce(&path, shutdown).await;
        Some(ProducedBatch { path, announced })
    }

    /// Fill one batch. A failed read is retried in the same slot after the
    /// retry delay, so a batch always holds exactly `batch_size` samples.
    pub async fn collect_batch(&mut self, shutdown: &CancellationToken) -> Option<Vec<Sample>> {
        let mut samples = Vec::with_capacity(self.batch_size);

        while samples.len() < self.batch_size {
            let started = Instant::now();
            let taken_at = Utc::now().with_timezone(&self.timezone);

            match self.source.read_voltage().await {
                Ok(volts) => samples.push(Sample { taken_at, volts }),
                Err(e) => {
                    warn!(
                        slot = samples.len(),
                        error = %e,
                        retry_in = ?self.retry_delay,
                        "sample read failed, retrying slot"
                    );
                    if !sleep_or_cancel(self.retry_delay, shutdown).await {
                        return None;
                    }
                    continue;
                }
            }

            let pause = pacing_delay(self.sampling_interval, started.elapsed());
            if !sleep_or_cancel(pause, shutdown).await {
                return None;
            }
        }

        Some(samples)
    }

    async fn persist(
        &self,
        number: u64,
        samples: &[Sample],
        shutdown: &CancellationToken,
    ) -> Option<PathBuf> {
        let completed_at = Utc::now().with_timezone(&self.timezone);
        let file_name = BatchFileName::new(&self.source_id, number, &completed_at).file_name();
        let contents = render_csv(samples);

        loop {
            // Marker first, so a batch file never exists without one until announced
            let written = match mark_pending(&self.output_dir, &file_name).await {
                Ok(()) => write_batch_atomic(&self.output_dir, &file_name, contents.as_bytes()).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(path) => {
                    info!(batch = number, path = %path.display(), samples = samples.len(), "batch saved");
                    return Some(path);
                }
                Err(e) => {
                    error!(batch = number, error = %e, "failed to save batch, retrying");
                    if !sleep_or_cancel(self.retry_delay, shutdown).await {
                        error!(batch = number, "cancelled while saving, batch discarded");
                        return None;
                    }
                }
            }
        }
    }

    /// Enqueue the BATCH_CREATED event, retrying while the broker is
    /// unreachable. An unannounced batch is invisible downstream.
    async fn announce(&self, path: &Path, shutdown: &CancellationToken) -> bool {
        let number = path
            .file_name()
            .and_then(|n| BatchFileName::parse(&n.to_string_lossy()))
            .map(|name| name.number)
            .unwrap_or_default();

        let payload = match Event::batch_created(path).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(batch = number, error = %e, "failed to encode batch event");
                return false;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.channel.put(payload.clone()).await {
                Ok(()) => {
                    info!(batch = number, channel = self.channel.name(), "batch event enqueued");
                    if let Err(e) = clear_pending(path).await {
                        // Leftover marker: one duplicate event on next start
                        warn!(batch = number, error = %e, "failed to clear pending marker");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(
                        batch = number,
                        attempt,
                        error = %e,
                        retry_in = ?self.retry_delay,
                        "failed to enqueue batch event"
                    );
                    if !sleep_or_cancel(self.retry_delay, shutdown).await {
                        error!(
                            batch = number,
                            path = %path.display(),
                            "cancelled before batch event was enqueued, marker kept"
                        );
                        return false;
                    }
                }
            }
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !shutdown.is_cancelled();
    }
    tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("sleep interrupted by shutdown");
            false
        }
        _ = tokio::time::sleep(duration) => true,
    }
}
