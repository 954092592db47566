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

// Batch producer tests: numbering, pacing, read retries and announcements

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use edge_pipeline::broker::{Channel, EventChannel};
use edge_pipeline::config::{SamplerConfig, SourceConfig};
use edge_pipeline::sampler::{BatchFileName, BatchProducer, SimulatedVoltageSource, VoltageSource};
use edge_pipeline::{Event, EventKind, PipelineError, Result};

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

async fn announced_numbers(channel: &EventChannel) -> Vec<u64> {
    let mut numbers = Vec::new();
    while let Some(raw) = channel.dequeue().await {
        let path = Event::from_json(&raw).unwrap().file_path().unwrap();
        let name = BatchFileName::parse(path.file_name().unwrap().to_str().unwrap()).unwrap();
        numbers.push(name.number);
    }
    numbers
}

fn sampler_config(dir: &Path) -> SamplerConfig {
    SamplerConfig {
        source_id: "BFA1".to_string(),
        batch_size: 10,
        sampling_interval_ms: 1,
        retry_delay_ms: 10,
        output_dir: dir.to_path_buf(),
        timezone: "Asia/Kolkata".to_string(),
        source: SourceConfig::default(),
        ..Default::default()
    }
}

fn simulated() -> Box<dyn VoltageSource> {
    Box::new(SimulatedVoltageSource::new(1.65, 0.5, 50))
}

/// Broker that is never reachable.
struct UnreachableChannel {
    attempts: AtomicU32,
}

#[async_trait]
impl Channel for UnreachableChannel {
    fn name(&self) -> &str {
        "s3_events"
    }

    async fn put(&self, _event: String) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Transport("connection refused".to_string()))
    }

    async fn get(&self) -> Result<Option<String>> {
        Err(PipelineError::Transport("connection refused".to_string()))
    }

    async fn is_empty(&self) -> Result<bool> {
        Err(PipelineError::Transport("connection refused".to_string()))
    }
}

/// Each read takes a fixed time.
struct SlowSource {
    read_time: Duration,
}

#[async_trait]
impl VoltageSource for SlowSource {
    async fn read_voltage(&mut self) -> Result<f64> {
        tokio::time::sleep(self.read_time).await;
        Ok(1.0)
    }

    fn describe(&self) -> String {
        "slow".to_string()
    }
}

/// Every third read fails.
struct FlakySource {
    reads: Arc<AtomicU32>,
}

#[async_trait]
impl VoltageSource for FlakySource {
    async fn read_voltage(&mut self) -> Result<f64> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 3 == 0 {
            Err(PipelineError::resource(
                "read in_voltage1_raw",
                std::io::Error::new(std::io::ErrorKind::Other, "i2c timeout"),
            ))
        } else {
            Ok(n as f64 / 10.0)
        }
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }
}

#[tokio::test]
async fn test_numbering_resumes_after_existing_batches() {
    let dir = TempDir::new().unwrap();
    for n in 1..=3 {
        std::fs::write(
            dir.path().join(format!("BFA1_Batch{}_2024-01-01_00-00-0{}.csv", n, n)),
            "Timestamp,Voltage\r\n",
        )
        .unwrap();
    }
    // Other sources and unrelated files do not count
    std::fs::write(dir.path().join("BFA2_Batch9_2024-01-01_00-00-09.csv"), "").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "").unwrap();

    let channel = Arc::new(UnreachableChannel {
        attempts: AtomicU32::new(0),
    });
    let mut producer = BatchProducer::new(&sampler_config(dir.path()), simulated(), channel.clone())
        .await
        .unwrap();
    assert_eq!(producer.next_batch_number(), 4);

    let shutdown = CancellationToken::new();
    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    // The broker is down, yet the batch is written under number 4
    let batch = producer.produce_batch(&shutdown).await.unwrap();
    assert!(!batch.announced);
    let path = batch.path;
    let name = BatchFileName::parse(path.file_name().unwrap().to_str().unwrap()).unwrap();
    assert_eq!(name.source_id, "BFA1");
    assert_eq!(name.number, 4);
    assert!(path.exists());
    assert_eq!(producer.next_batch_number(), 5);

    // And the announcement was retried rather than dropped
    assert!(channel.attempts.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_numbering_scans_archive_dirs() {
    let dir = TempDir::new().unwrap();
    let archive = TempDir::new().unwrap();
    std::fs::write(
        archive.path().join("BFA1_Batch41_2024-01-01_00-00-00.csv"),
        "",
    )
    .unwrap();

    let mut config = sampler_config(&dir.path().join("batches"));
    config.scan_dirs = vec![archive.path().to_path_buf()];

    let producer = BatchProducer::new(&config, simulated(), Arc::new(EventChannel::new("s3_events")))
        .await
        .unwrap();
    assert_eq!(producer.next_batch_number(), 42);
    assert!(dir.path().join("batches").is_dir());
}

#[tokio::test]
async fn test_batch_file_and_event() {
    let dir = TempDir::new().unwrap();
    let channel = Arc::new(EventChannel::new("s3_events"));
    let mut producer = BatchProducer::new(&sampler_config(dir.path()), simulated(), channel.clone())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let batch = producer.produce_batch(&shutdown).await.unwrap();
    assert!(batch.announced);
    let path = batch.path;

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.split("\r\n").filter(|l| !l.is_empty()).collect();
    assert_eq!(lines[0], "Timestamp,Voltage");
    assert_eq!(lines.len(), 11);
    for row in &lines[1..] {
        // "YYYY-MM-DD HH:MM:SS,mmm",V.VVVVVV
        let (stamp, volts) = row.rsplit_once(',').unwrap();
        assert_eq!(stamp.len(), 25, "bad timestamp in {}", row);
        assert!(stamp.starts_with('"') && stamp.ends_with('"'));
        assert_eq!(volts.split_once('.').unwrap().1.len(), 6);
    }

    // No temp files left behind
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty());

    let raw = channel.dequeue().await.unwrap();
    let event = Event::from_json(&raw).unwrap();
    event.validate().unwrap();
    assert_eq!(event.kind, EventKind::BatchCreated);
    assert_eq!(event.file_path().unwrap(), path);
    assert!(event.enqueued_at.is_some());
    assert!(channel.is_empty().await);
}

#[tokio::test]
async fn test_run_stops_at_max_batches() {
    let dir = TempDir::new().unwrap();
    let channel = Arc::new(EventChannel::new("s3_events"));
    let mut config = sampler_config(dir.path());
    config.batch_size = 3;
    config.max_batches = Some(3);

    let mut producer = BatchProducer::new(&config, simulated(), channel.clone())
        .await
        .unwrap();
    let produced = producer.run(&CancellationToken::new()).await;
    assert_eq!(produced, 3);

    assert_eq!(announced_numbers(&channel).await, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_pacing_corrects_for_read_time() {
    let dir = TempDir::new().unwrap();
    let mut config = sampler_config(dir.path());
    config.batch_size = 100;
    config.sampling_interval_ms = 100;

    let source = Box::new(SlowSource {
        read_time: Duration::from_millis(30),
    });
    let mut producer = BatchProducer::new(&config, source, Arc::new(EventChannel::new("s3_events")))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let samples = producer
        .collect_batch(&CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(samples.len(), 100);
    // 100 periods of 100 ms, not 100 * (30 + 100) ms
    assert!(elapsed >= Duration::from_millis(9_900), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(10_100), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_retries_same_slot() {
    let dir = TempDir::new().unwrap();
    let mut config = sampler_config(dir.path());
    config.batch_size = 5;
    config.retry_delay_ms = 5_000;

    let reads = Arc::new(AtomicU32::new(0));
    let source = Box::new(FlakySource {
        reads: reads.clone(),
    });
    let mut producer = BatchProducer::new(&config, source, Arc::new(EventChannel::new("s3_events")))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let samples = producer
        .collect_batch(&CancellationToken::new())
        .await
        .unwrap();

    // Reads 3 and 6 failed; the batch still holds exactly five samples
    assert_eq!(samples.len(), 5);
    assert_eq!(reads.load(Ordering::SeqCst), 7);
    let volts: Vec<f64> = samples.iter().map(|s| s.volts).collect();
    assert_eq!(volts, vec![0.1, 0.2, 0.4, 0.5, 0.7]);
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn test_cancel_discards_partial_batch() {
    let dir = TempDir::new().unwrap();
    let mut config = sampler_config(dir.path());
    config.batch_size = 1_000;
    config.sampling_interval_ms = 10;

    let channel = Arc::new(EventChannel::new("s3_events"));
    let mut producer = BatchProducer::new(&config, simulated(), channel.clone())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    assert_eq!(producer.run(&shutdown).await, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert!(channel.is_empty().await);
    assert_eq!(producer.next_batch_number(), 1);
}

#[tokio::test]
async fn test_unannounced_batch_is_announced_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = sampler_config(dir.path());

    // First run: the broker is down and the sampler is stopped
    let unreachable = Arc::new(UnreachableChannel {
        attempts: AtomicU32::new(0),
    });
    let mut producer = BatchProducer::new(&config, simulated(), unreachable)
        .await
        .unwrap();
    let shutdown = CancellationToken::new();
    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });
    assert_eq!(producer.run(&shutdown).await, 1);

    let entries = dir_entries(dir.path());
    assert_eq!(entries.len(), 2, "{:?}", entries);
    assert!(entries.iter().any(|n| n.starts_with(".BFA1_Batch1_") && n.ends_with(".csv.unannounced")));

    // Second run: the owed event goes out before any new batch
    let channel = Arc::new(EventChannel::new("s3_events"));
    let mut config = config;
    config.max_batches = Some(1);
    let mut producer = BatchProducer::new(&config, simulated(), channel.clone())
        .await
        .unwrap();
    assert_eq!(producer.pending_announcements().len(), 1);
    assert_eq!(producer.next_batch_number(), 2);

    assert_eq!(producer.run(&CancellationToken::new()).await, 1);
    assert!(producer.pending_announcements().is_empty());
    assert_eq!(announced_numbers(&channel).await, vec![1, 2]);

    // Every batch on disk was announced; no markers remain
    let entries = dir_entries(dir.path());
    assert_eq!(entries.len(), 2, "{:?}", entries);
    assert!(entries.iter().all(|n| !n.starts_with('.')));
}

#[tokio::test]
async fn test_orphan_marker_is_dropped() {
    let dir = TempDir::new().unwrap();
    // Marker written, then the process died before the batch file landed
    std::fs::write(
        dir.path().join(".BFA1_Batch1_2024-01-01_00-00-01.csv.unannounced"),
        "",
    )
    .unwrap();

    let producer = BatchProducer::new(
        &sampler_config(dir.path()),
        simulated(),
        Arc::new(EventChannel::new("s3_events")),
    )
    .await
    .unwrap();
    assert!(producer.pending_announcements().is_empty());
    assert_eq!(producer.next_batch_number(), 1);
    assert!(dir_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn test_source_id_must_survive_file_name_parsing() {
    let dir = TempDir::new().unwrap();
    let mut config = sampler_config(dir.path());
    config.source_id = "BFA-1".to_string();

    let result = BatchProducer::new(&config, simulated(), Arc::new(EventChannel::new("s3_events"))).await;
    assert!(matches!(result, Err(PipelineError::FatalInit(_))));
    assert!(dir_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn test_stale_temp_files_are_swept_on_start() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(".BFA1_Batch3_2024-01-01_00-00-03.csv.tmp"),
        "Timestamp,Voltage\r\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("BFA1_Batch2_2024-01-01_00-00-02.csv"), "").unwrap();

    let producer = BatchProducer::new(
        &sampler_config(dir.path()),
        simulated(),
        Arc::new(EventChannel::new("s3_events")),
    )
    .await
    .unwrap();

    // The half-written batch 3 never counted
    assert_eq!(producer.next_batch_number(), 3);
    assert_eq!(
        dir_entries(dir.path()),
        vec!["BFA1_Batch2_2024-01-01_00-00-02.csv".to_string()]
    );
}
