//! What a restore run was asked to do and what it achieved.

use crate::import::{BatchReport, ImportSummary};
use crate::utils::RestoreError;
use chrono::{DateTime, Local};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One restore request, fixed for the lifetime of the run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreJob {
    /// Backup timestamp (`YYYYMMDDHHMMSS`); detected when `None`
    pub timestamp: Option<String>,
    pub dry_run: bool,
    pub skip_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    Downloading,
    Extracting,
    Deleting,
    Importing,
    Cleaning,
    Done,
    Failed,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePhase::Idle => "idle",
            RestorePhase::Downloading => "downloading",
            RestorePhase::Extracting => "extracting",
            RestorePhase::Deleting => "deleting",
            RestorePhase::Importing => "importing",
            RestorePhase::Cleaning => "cleaning",
            RestorePhase::Done => "done",
            RestorePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one restore run
#[derive(Debug)]
pub struct RestoreResult {
    pub run_id: Uuid,
    pub pod: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration: Duration,
    pub total_files: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub backup_file: String,
    pub timestamp: String,
    pub dry_run: bool,
    pub phase: RestorePhase,

    /// Phase that was running when the restore failed
    pub failed_phase: Option<RestorePhase>,

    pub batches: Vec<BatchReport>,

    /// Set only when a fatal phase failed
    pub error: Option<RestoreError>,
}

impl RestoreResult {
    pub fn new(pod: &str, job: &RestoreJob) -> Self {
        let now = Local::now();
        Self {
            run_id: Uuid::new_v4(),
            pod: pod.to_string(),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            total_files: 0,
            success_count: 0,
            failed_count: 0,
            backup_file: String::new(),
            timestamp: job.timestamp.clone().unwrap_or_default(),
            dry_run: job.dry_run,
            phase: RestorePhase::Idle,
            failed_phase: None,
            batches: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn record_import(&mut self, summary: ImportSummary) {
        self.total_files = summary.total;
        self.success_count = summary.success;
        self.failed_count = summary.failed;
        self.batches = summary.batches;
    }

    pub(crate) fn fail(&mut self, error: RestoreError) {
        self.failed_phase = Some(self.phase);
        self.phase = RestorePhase::Failed;
        self.error = Some(error);
    }

    /// Stamp the end time. A run that did not fail is done.
    pub(crate) fn finish(&mut self) {
        if self.error.is_none() {
            self.phase = RestorePhase::Done;
        }
        self.end_time = Local::now();
        self.duration = (self.end_time - self.start_time).to_std().unwrap_or_default();
    }
}
