//! Backup artifact naming and timestamp detection.
//!
//! Archives are published as `emsau_{pod}_{YYYYMMDDHHMMSS}.tar.gz`. When no
//! timestamp is requested explicitly, a [`TimestampStrategy`] enumerates a
//! handful of plausible candidates and [`TimestampDetector`] probes the store
//! for each in turn.

use crate::config::BackupConfig;
use crate::transfer::{ArtifactStore, Presence};
use crate::utils::{RestoreError, Result};
use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;
use tracing::{info, warn};

const ARCHIVE_PREFIX: &str = "emsau_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const HOUR_FORMAT: &str = "%Y%m%d%H";

/// Seconds the producer may drift past its scheduled minute
const SECOND_WINDOW: std::ops::RangeInclusive<u32> = 1..=10;

/// Archive file name for `pod` at `timestamp`
pub fn artifact_filename(pod: &str, timestamp: &str) -> String {
    format!("{ARCHIVE_PREFIX}{pod}_{timestamp}{ARCHIVE_SUFFIX}")
}

/// Full store URL for `pod` at `timestamp`
pub fn artifact_url(base_url: &str, pod: &str, timestamp: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        artifact_filename(pod, timestamp)
    )
}

/// Check that `timestamp` is 14 digits naming a real calendar time.
pub fn validate_timestamp(timestamp: &str) -> Result<()> {
    if timestamp.len() != 14 {
        return Err(RestoreError::Validation(format!(
            "expected 14 digits, got {} characters in {:?}",
            timestamp.len(),
            timestamp
        )));
    }
    if !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RestoreError::Validation(format!(
            "{:?} is not numeric",
            timestamp
        )));
    }
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map(|_| ())
        .map_err(|e| RestoreError::Validation(format!("{:?} is not a valid time: {}", timestamp, e)))
}

/// Render a timestamp as `YYYY-MM-DD HH:MM:SS`.
pub fn format_timestamp(timestamp: &str) -> Result<String> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|e| RestoreError::Validation(format!("{:?} is not a valid time: {}", timestamp, e)))?;
    Ok(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// One backup archive, from the store to the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub filename: String,
    pub timestamp: String,
    pub url: String,

    /// Where the archive is staged on this machine
    pub local_path: PathBuf,

    /// Where the archive is staged inside the pod
    pub remote_path: String,

    /// Size reported by the store, when probed
    pub size: Option<u64>,
}

impl BackupArtifact {
    pub fn new(config: &BackupConfig, pod: &str, timestamp: &str) -> Self {
        let filename = artifact_filename(pod, timestamp);
        Self {
            url: artifact_url(&config.base_url, pod, timestamp),
            local_path: config.download_dir.join(&filename),
            remote_path: format!("{}/{}", config.remote_dir.trim_end_matches('/'), filename),
            timestamp: timestamp.to_string(),
            filename,
            size: None,
        }
    }
}

/// Enumerates candidate timestamps, most likely first.
pub trait TimestampStrategy: Send + Sync {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    fn candidates(&self, now: NaiveDateTime) -> Vec<String>;
}

/// The current hour at a fixed minute, seconds `01..=10`.
#[derive(Debug, Clone, Copy)]
pub struct HourlyWindow {
    pub minute: u32,
}

impl Default for HourlyWindow {
    fn default() -> Self {
        Self { minute: 35 }
    }
}

impl TimestampStrategy for HourlyWindow {
    fn describe(&self) -> String {
        format!("hourly window at minute {:02}", self.minute)
    }

    fn candidates(&self, now: NaiveDateTime) -> Vec<String> {
        let hour = now.format(HOUR_FORMAT);
        SECOND_WINDOW
            .map(|second| format!("{}{:02}{:02}", hour, self.minute, second))
            .collect()
    }
}

/// A user pattern: `{hour}` becomes `YYYYMMDDHH`, a `*` is tried with
/// seconds `01..=10`. Without a wildcard the pattern names one timestamp.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub pattern: String,
}

impl TimestampStrategy for Pattern {
    fn describe(&self) -> String {
        format!("pattern {:?}", self.pattern)
    }

    fn candidates(&self, now: NaiveDateTime) -> Vec<String> {
        let expanded = self.pattern.replace("{hour}", &now.format(HOUR_FORMAT).to_string());
        if expanded.contains('*') {
            SECOND_WINDOW
                .map(|second| expanded.replace('*', &format!("{:02}", second)))
                .collect()
        } else {
            vec![expanded]
        }
    }
}

/// Pick the detection strategy the configuration asks for.
pub fn strategy_from_config(config: &BackupConfig) -> Box<dyn TimestampStrategy> {
    match config.timestamp_pattern.as_deref() {
        Some(pattern) if !pattern.trim().is_empty() => Box::new(Pattern {
            pattern: pattern.trim().to_string(),
        }),
        _ => Box::new(HourlyWindow {
            minute: config.detect_minute,
        }),
    }
}

/// Probes an [`ArtifactStore`] for the first candidate that exists.
pub struct TimestampDetector<'a, S> {
    store: &'a S,
    base_url: &'a str,
    pod: &'a str,
    strategy: Box<dyn TimestampStrategy>,
}

impl<'a, S: ArtifactStore> TimestampDetector<'a, S> {
    pub fn new(store: &'a S, base_url: &'a str, pod: &'a str, strategy: Box<dyn TimestampStrategy>) -> Self {
        Self {
            store,
            base_url,
            pod,
            strategy,
        }
    }

    /// Detect against the local wall clock.
    pub async fn detect(&self) -> Result<String> {
        self.detect_at(Local::now().naive_local()).await
    }

    pub async fn detect_at(&self, now: NaiveDateTime) -> Result<String> {
        let candidates = self.strategy.candidates(now);
        info!(
            strategy = %self.strategy.describe(),
            pod = self.pod,
            candidates = candidates.len(),
            "Detecting backup timestamp"
        );

        // A lone candidate is a direct lookup, so its probe failure is the answer.
        let direct = candidates.len() == 1;

        for timestamp in &candidates {
            let url = artifact_url(self.base_url, self.pod, timestamp);
            match self.store.exists(&url).await {
                Ok(Presence::Present { size }) => {
                    info!(timestamp = %timestamp, ?size, "Found backup archive");
                    return Ok(timestamp.clone());
                }
                Ok(Presence::Absent) => {}
                Err(e) if direct || e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(timestamp = %timestamp, error = %e, "Probe failed, trying next candidate");
                }
            }
        }

        Err(RestoreError::NotFound(format!(
            "no backup archive for pod {} matching {} (tried {})",
            self.pod,
            self.strategy.describe(),
            describe_range(&candidates)
        )))
    }
}

fn describe_range(candidates: &[String]) -> String {
    match (candidates.first(), candidates.last()) {
        (Some(first), Some(last)) if first != last => format!("{}-{}", first, last),
        (Some(only), _) => only.clone(),
        _ => "nothing".to_string(),
    }
}
