// Batch file naming, discovery and atomic persistence

use chrono::DateTime;
use chrono_tz::Tz;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

pub const CSV_HEADER: &str = "Timestamp,Voltage";
const LINE_END: &str = "\r\n";
const FILE_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const SAMPLE_STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

fn batch_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<source>[A-Za-z0-9]+)_Batch(?P<number>\d+)_(?P<stamp>\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})\.csv$",
        )
        .expect("batch file pattern is a valid regex")
    })
}

/// Source ids appear verbatim in batch file names and must survive parsing.
pub fn valid_source_id(source_id: &str) -> bool {
    !source_id.is_empty() && source_id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Parsed form of `<SourceID>_Batch<N>_<YYYY-MM-DD_HH-MM-SS>.csv`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFileName {
    pub source_id: String,
    pub number: u64,
    pub stamp: String,
}

impl BatchFileName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = batch_pattern().captures(file_name)?;
        let number = caps["number"].parse::<u64>().ok()?;
        if number == 0 {
            return None;
        }
        Some(Self {
            source_id: caps["source"].to_string(),
            number,
            stamp: caps["stamp"].to_string(),
        })
    }

    pub fn new(source_id: &str, number: u64, completed_at: &DateTime<Tz>) -> Self {
        Self {
            source_id: source_id.to_string(),
            number,
            stamp: completed_at.format(FILE_STAMP_FORMAT).to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_Batch{}_{}.csv", self.source_id, self.number, self.stamp)
    }
}

/// Highest batch number already on disk for `source_id` across `dirs`.
/// Missing directories count as empty; 0 means no batch exists yet.
pub async fn last_batch_number(dirs: &[PathBuf], source_id: &str) -> Result<u64> {
    let mut highest = 0;

    for dir in dirs {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "batch directory does not exist yet");
                continue;
            }
            Err(e) => {
                return Err(PipelineError::resource(
                    format!("scan batch directory {}", dir.display()),
                    e,
                ))
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            PipelineError::resource(format!("scan batch directory {}", dir.display()), e)
        })? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(parsed) = BatchFileName::parse(name) {
                if parsed.source_id == source_id {
                    highest = highest.max(parsed.number);
                }
            }
        }
    }

    Ok(highest)
}

const TEMP_SUFFIX: &str = ".csv.tmp";
const PENDING_SUFFIX: &str = ".unannounced";

/// Sidecar marking a batch whose BATCH_CREATED event is not yet enqueued.
pub fn pending_marker_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!(".{}{}", file_name, PENDING_SUFFIX))
}

pub async fn mark_pending(dir: &Path, file_name: &str) -> Result<()> {
    let marker = pending_marker_path(dir, file_name);
    fs::write(&marker, b"")
        .await
        .map_err(|e| PipelineError::resource(format!("write marker {}", marker.display()), e))
}

/// Remove the marker once the batch is announced.
pub async fn clear_pending(batch_path: &Path) -> Result<()> {
    let (Some(dir), Some(name)) = (batch_path.parent(), batch_path.file_name()) else {
        return Ok(());
    };
    let marker = pending_marker_path(dir, &name.to_string_lossy());
    match fs::remove_file(&marker).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::resource(
            format!("remove marker {}", marker.display()),
            e,
        )),
    }
}

/// Batches in `dir` still carrying a pending marker, oldest first. Markers
/// whose batch file was never written are removed.
pub async fn pending_batches(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pending = Vec::new();

    for name in hidden_entries(dir).await? {
        let Some(batch_name) = name
            .strip_prefix('.')
            .and_then(|n| n.strip_suffix(PENDING_SUFFIX))
        else {
            continue;
        };
        let Some(parsed) = BatchFileName::parse(batch_name) else {
            continue;
        };

        let batch_path = dir.join(batch_name);
        if fs::try_exists(&batch_path).await.unwrap_or(false) {
            pending.push((parsed.number, batch_path));
        } else {
            debug!(marker = %name, "batch was never written, dropping marker");
            if let Err(e) = fs::remove_file(dir.join(&name)).await {
                warn!(marker = %name, error = %e, "failed to remove orphan marker");
            }
        }
    }

    pending.sort();
    Ok(pending.into_iter().map(|(_, path)| path).collect())
}

/// Delete temp files left by a write that never reached its rename.
/// Returns how many were removed.
pub async fn sweep_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for name in hidden_entries(dir).await? {
        if !name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        match fs::remove_file(dir.join(&name)).await {
            Ok(()) => {
                info!(file = %name, "removed stale temp batch file");
                removed += 1;
            }
            Err(e) => warn!(file = %name, error = %e, "failed to remove stale temp batch file"),
        }
    }
    Ok(removed)
}

async fn hidden_entries(dir: &Path) -> Result<Vec<String>> {
    let scan_err = |e: std::io::Error| {
        PipelineError::resource(format!("scan batch directory {}", dir.display()), e)
    };
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(scan_err(e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub taken_at: DateTime<Tz>,
    pub volts: f64,
}

pub fn format_sample_timestamp(taken_at: &DateTime<Tz>) -> String {
    taken_at.format(SAMPLE_STAMP_FORMAT).to_string()
}

/// Fixed six decimal places, ties rounded away from zero on the shortest
/// decimal representation of the reading.
pub fn format_voltage(volts: f64) -> String {
    if !volts.is_finite() {
        return volts.to_string();
    }

    let repr = volts.abs().to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));

    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes().chain(std::iter::repeat(b'0')).take(6))
        .map(|b| b - b'0')
        .collect();

    if frac_part.as_bytes().get(6).is_some_and(|d| *d >= b'5') {
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, 1);
                break;
            }
            i -= 1;
            if digits[i] == 9 {
                digits[i] = 0;
            } else {
                digits[i] += 1;
                break;
            }
        }
    }

    let split = digits.len() - 6;
    let render = |ds: &[u8]| ds.iter().map(|d| char::from(b'0' + d)).collect::<String>();
    let negative = volts < 0.0 && digits.iter().any(|d| *d != 0);

    format!(
        "{}{}.{}",
        if negative { "-" } else { "" },
        render(&digits[..split]),
        render(&digits[split..])
    )
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render a batch as CSV: header row then one row per sample.
pub fn render_csv(samples: &[Sample]) -> String {
    let mut out = String::with_capacity(32 * (samples.len() + 1));
    out.push_str(CSV_HEADER);
    out.push_str(LINE_END);
    for sample in samples {
        out.push_str(&csv_field(&format_sample_timestamp(&sample.taken_at)));
        out.push(',');
        out.push_str(&csv_field(&format_voltage(sample.volts)));
        out.push_str(LINE_END);
    }
    out
}

/// Write `contents` to `dir/file_name` so that readers either see the whole
/// file or nothing: write a hidden temp file, sync it, then rename.
pub async fn write_batch_atomic(dir: &Path, file_name: &str, contents: &[u8]) -> Result<PathBuf> {
    let final_path = dir.join(file_name);
    let temp_path = dir.join(format!(".{}.tmp", file_name));

    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await
    }
    .await;

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temp batch file");
            }
        }
        return Err(PipelineError::resource(
            format!("write batch file {}", final_path.display()),
            e,
        ));
    }

    Ok(final_path)
}
