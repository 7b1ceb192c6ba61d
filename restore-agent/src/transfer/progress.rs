//! Byte-level progress tracking for artifact downloads.
//!
//! Produces percentage / throughput snapshots for the download log and the
//! human-readable size, speed and duration strings used in notifications.

use std::time::{Duration, Instant};

/// Progress snapshot for one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Total bytes to transfer (0 when the server did not say)
    pub total_bytes: u64,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Average speed since the transfer started, in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100), `None` when the total is unknown
    pub percent_complete: Option<f64>,
}

/// Turns raw byte counts into [`TransferProgress`] snapshots
pub struct ProgressTracker {
    start_time: Instant,
    total_bytes: u64,
}

impl ProgressTracker {
    /// Create a new progress tracker
    pub fn new(total_bytes: u64) -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes,
        }
    }

    /// Snapshot for `transferred_bytes`
    pub fn snapshot(&self, transferred_bytes: u64) -> TransferProgress {
        compute_progress(self.total_bytes, transferred_bytes, self.elapsed())
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Compute a progress snapshot from totals and elapsed time
pub fn compute_progress(total_bytes: u64, transferred_bytes: u64, elapsed: Duration) -> TransferProgress {
    let secs = elapsed.as_secs_f64();
    let bytes_per_second = if secs > 0.0 {
        (transferred_bytes as f64 / secs) as u64
    } else {
        0
    };

    let percent_complete = if total_bytes > 0 {
        Some(((transferred_bytes as f64 / total_bytes as f64) * 100.0).min(100.0))
    } else {
        None
    };

    let eta_seconds = if bytes_per_second > 0 {
        total_bytes.saturating_sub(transferred_bytes) / bytes_per_second
    } else {
        0
    };

    TransferProgress {
        total_bytes,
        transferred_bytes,
        bytes_per_second,
        eta_seconds,
        percent_complete,
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m {}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_progress_half_way() {
        let progress = compute_progress(1000, 500, Duration::from_secs(5));
        assert_eq!(progress.bytes_per_second, 100);
        assert_eq!(progress.eta_seconds, 5);
        assert!((progress.percent_complete.unwrap() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_compute_progress_unknown_total() {
        let progress = compute_progress(0, 4096, Duration::from_secs(1));
        assert_eq!(progress.percent_complete, None);
        assert_eq!(progress.eta_seconds, 0);
        assert_eq!(progress.bytes_per_second, 4096);
    }

    #[test]
    fn test_compute_progress_caps_at_hundred() {
        let progress = compute_progress(100, 150, Duration::from_secs(1));
        assert_eq!(progress.percent_complete, Some(100.0));
    }

    #[test]
    fn test_tracker_snapshot() {
        let tracker = ProgressTracker::new(2048);
        let progress = tracker.snapshot(1024);
        assert_eq!(progress.total_bytes, 2048);
        assert_eq!(progress.transferred_bytes, 1024);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }
}
