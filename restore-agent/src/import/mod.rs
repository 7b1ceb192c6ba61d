//! Batch import of discovered TsFiles into IoTDB.
//!
//! The manifest is cut into fixed-size batches. Each batch spawns one task per
//! file; a semaphore shared by the whole import caps how many load commands
//! run at once, and the batch is joined before the next one starts so the
//! datanode gets a chance to flush between rounds.

pub mod batch;
pub mod classifier;

pub use batch::{plan_batches, BatchReport, ImportSummary};
pub use classifier::{classifier_for, ExitStatus, OutcomeClassifier, OutputMarker};

use crate::config::{ImportConfig, IotdbConfig};
use crate::remote::RemoteExecutor;
use crate::transfer::progress::format_duration;
use crate::utils::RestoreError;
use chrono::Local;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

/// Reports the pod's available memory in MiB
const MEMORY_COMMAND: &str = "free -m | grep Mem | awk '{print $7}'";

/// Result of loading one file
#[derive(Debug)]
pub struct ImportOutcome {
    pub file: String,
    pub error: Option<RestoreError>,
}

impl ImportOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolved knobs for one import run
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub batch_pause: bool,
    pub batch_delay: Duration,
    pub log_memory: bool,
    pub cli_path: String,
    pub host: String,
}

impl ImportSettings {
    pub fn new(import: &ImportConfig, iotdb: &IotdbConfig) -> Self {
        Self {
            concurrency: import.concurrency,
            batch_size: import.batch_size,
            batch_pause: import.batch_pause,
            batch_delay: import.batch_delay(),
            log_memory: import.log_memory,
            cli_path: iotdb.cli_path.clone(),
            host: iotdb.host.clone(),
        }
    }

    /// CLI invocation that loads `file`
    pub fn load_command(&self, file: &str) -> String {
        format!(
            "{} -h {} -e \"load '{}' verify=false\"",
            self.cli_path, self.host, file
        )
    }
}

/// Loads a manifest batch by batch with bounded parallelism
pub struct BatchImporter<E> {
    executor: Arc<E>,
    settings: ImportSettings,
    classifier: Arc<dyn OutcomeClassifier>,
    cancel_token: CancellationToken,
}

impl<E: RemoteExecutor + 'static> BatchImporter<E> {
    pub fn new(
        executor: Arc<E>,
        settings: ImportSettings,
        classifier: Arc<dyn OutcomeClassifier>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            executor,
            settings,
            classifier,
            cancel_token,
        }
    }

    /// Import every file in `files`. Per-file failures are counted, never
    /// returned; the summary always accounts for the whole manifest.
    pub async fn import(&self, files: &[String]) -> ImportSummary {
        let start_time = Instant::now();
        let total = files.len();
        let plan = plan_batches(total, self.settings.batch_size);
        let total_batches = plan.len();

        info!(
            total_files = total,
            total_batches,
            concurrency = self.settings.concurrency,
            batch_size = self.settings.batch_size,
            classifier = self.classifier.name(),
            "Starting import"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let success = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut reports = Vec::with_capacity(total_batches);

        for (index, range) in plan.into_iter().enumerate() {
            let number = index + 1;
            let batch_start = Local::now();

            info!(
                batch = number,
                total_batches,
                files = range.len(),
                processed = range.start,
                "Processing batch"
            );
            self.log_available_memory().await;

            let batch_success = Arc::new(AtomicUsize::new(0));
            let batch_failed = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::with_capacity(range.len());
            for file in &files[range.clone()] {
                let sem = Arc::clone(&semaphore);
                let executor = Arc::clone(&self.executor);
                let classifier = Arc::clone(&self.classifier);
                let cancel = self.cancel_token.clone();
                let counters = [
                    Arc::clone(&success),
                    Arc::clone(&batch_success),
                    Arc::clone(&failed),
                    Arc::clone(&batch_failed),
                ];
                let command = self.settings.load_command(file);
                let file = file.clone();

                let handle = tokio::spawn(async move {
                    let outcome = import_one(executor.as_ref(), classifier.as_ref(), &sem, &cancel, file, &command).await;

                    let [global_success, batch_success, global_failed, batch_failed] = &counters;
                    if outcome.is_success() {
                        global_success.fetch_add(1, Ordering::Relaxed);
                        batch_success.fetch_add(1, Ordering::Relaxed);
                    } else {
                        global_failed.fetch_add(1, Ordering::Relaxed);
                        batch_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    outcome
                });
                handles.push(handle);
            }

            // The batch is a barrier: nothing from the next batch starts
            // until every task here has finished.
            for handle in handles {
                match handle.await {
                    Ok(outcome) => match &outcome.error {
                        None => debug!(file = %outcome.file, "Imported"),
                        Some(e) if e.is_cancelled() => {
                            debug!(file = %outcome.file, "Skipped after cancellation")
                        }
                        Some(e) => warn!(file = %outcome.file, error = %e, "Import failed"),
                    },
                    Err(e) => {
                        // A panicked task never reached its counters
                        warn!(error = %e, "Import task panicked");
                        failed.fetch_add(1, Ordering::Relaxed);
                        batch_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            let report = BatchReport {
                number,
                files: range.clone(),
                start_time: batch_start,
                end_time: Local::now(),
                success: batch_success.load(Ordering::Relaxed),
                failed: batch_failed.load(Ordering::Relaxed),
            };
            info!(
                batch = number,
                total_batches,
                files = report.size(),
                success = report.success,
                failed = report.failed,
                elapsed = %format_duration(report.duration()),
                progress = %format!("{}/{}", range.end, total),
                "Batch complete"
            );
            reports.push(report);

            if number < total_batches && self.settings.batch_pause && !self.settings.batch_delay.is_zero() {
                info!(pause_secs = self.settings.batch_delay.as_secs(), "Pausing between batches");
                tokio::select! {
                    _ = self.cancel_token.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.batch_delay) => {}
                }
            }
        }

        let summary = ImportSummary {
            total,
            success: success.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            duration: start_time.elapsed(),
            batches: reports,
        };

        info!(
            total_files = summary.total,
            success = summary.success,
            failed = summary.failed,
            duration_secs = summary.duration.as_secs(),
            "Import finished"
        );
        summary
    }

    async fn log_available_memory(&self) {
        if !self.settings.log_memory || !tracing::enabled!(Level::DEBUG) {
            return;
        }
        match self.executor.execute(MEMORY_COMMAND).await {
            Ok(output) => debug!(available_mb = %output.stdout.trim(), "Pod memory"),
            Err(e) => debug!(error = %e, "Could not read pod memory"),
        }
    }
}

/// Wait for a permit, then load one file. Cancellation before the permit is
/// granted fails the file without touching the pod.
async fn import_one<E: RemoteExecutor>(
    executor: &E,
    classifier: &dyn OutcomeClassifier,
    semaphore: &Semaphore,
    cancel: &CancellationToken,
    file: String,
    command: &str,
) -> ImportOutcome {
    let cancelled = |file| ImportOutcome {
        file,
        error: Some(RestoreError::Cancelled("import".to_string())),
    };

    if cancel.is_cancelled() {
        return cancelled(file);
    }
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(file),
        permit = semaphore.acquire() => permit,
    };
    let _permit = match permit {
        Ok(permit) => permit,
        Err(e) => {
            return ImportOutcome {
                file,
                error: Some(RestoreError::Cancelled(format!("semaphore closed: {}", e))),
            };
        }
    };

    let error = load_file(executor, classifier, command).await.err();
    ImportOutcome { file, error }
}

async fn load_file<E: RemoteExecutor>(
    executor: &E,
    classifier: &dyn OutcomeClassifier,
    command: &str,
) -> Result<(), RestoreError> {
    let output = executor.execute(command).await?;
    if classifier.accepts(&output) {
        Ok(())
    } else {
        Err(RestoreError::Command {
            exit_code: output.exit_code,
            message: format!("load not confirmed by {} check", classifier.name()),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
