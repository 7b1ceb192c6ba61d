//! Restore pipeline: stage the archive, unpack it, load the TsFiles.
//!
//! The orchestrator never returns an error. Whatever happens, the caller gets
//! a [`RestoreResult`] describing how far the run got, which is what the
//! notifier reports.

pub mod result;

pub use result::{RestoreJob, RestorePhase, RestoreResult};

use crate::config::Config;
use crate::detect::{strategy_from_config, validate_timestamp, BackupArtifact, TimestampDetector};
use crate::import::{classifier_for, BatchImporter, ImportSettings, OutcomeClassifier};
use crate::remote::{shell_quote, RemoteExecutor};
use crate::transfer::progress::format_bytes;
use crate::transfer::ArtifactStore;
use crate::utils::{RestoreError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Directory inside the data dir holding the previous pre-restore snapshot
const PREVIOUS_BACKUP_DIR: &str = "backup_before_restore";

/// Drives one restore from artifact store to loaded database
pub struct RestoreOrchestrator<E, S> {
    config: Config,
    executor: Arc<E>,
    store: S,
    classifier: Arc<dyn OutcomeClassifier>,
    cancel_token: CancellationToken,
}

impl<E, S> RestoreOrchestrator<E, S>
where
    E: RemoteExecutor + 'static,
    S: ArtifactStore,
{
    pub fn new(config: Config, executor: Arc<E>, store: S, cancel_token: CancellationToken) -> Self {
        let classifier = classifier_for(config.import.success_check);
        Self {
            config,
            executor,
            store,
            classifier,
            cancel_token,
        }
    }

    fn pod(&self) -> &str {
        &self.config.kubernetes.pod_name
    }

    /// Run the whole pipeline for `job`.
    pub async fn run(&self, job: &RestoreJob) -> RestoreResult {
        let mut result = RestoreResult::new(self.pod(), job);
        let span = info_span!("restore", run_id = %result.run_id, pod = %self.pod());

        async {
            info!(
                timestamp = job.timestamp.as_deref().unwrap_or("auto"),
                dry_run = job.dry_run,
                skip_delete = job.skip_delete,
                "Starting restore"
            );

            if job.dry_run {
                self.dry_run(job);
            } else if let Err(e) = self.execute(job, &mut result).await {
                error!(phase = %result.phase, error = %e, "Restore failed");
                result.fail(e);
            }

            result.finish();
            info!(
                phase = %result.phase,
                total_files = result.total_files,
                success = result.success_count,
                failed = result.failed_count,
                duration_secs = result.duration.as_secs(),
                "Restore finished"
            );
        }
        .instrument(span)
        .await;

        result
    }

    fn dry_run(&self, job: &RestoreJob) {
        info!(
            base_url = %self.config.backup.base_url,
            data_dir = %self.config.iotdb.data_dir,
            databases = ?self.config.iotdb.databases,
            skip_delete = job.skip_delete,
            concurrency = self.config.import.concurrency,
            batch_size = self.config.import.batch_size,
            "Dry run, nothing will be changed"
        );
    }

    async fn execute(&self, job: &RestoreJob, result: &mut RestoreResult) -> Result<()> {
        result.phase = RestorePhase::Downloading;
        let timestamp = self.resolve_timestamp(job).await?;
        let mut artifact = BackupArtifact::new(&self.config.backup, self.pod(), &timestamp);
        result.timestamp = timestamp;
        result.backup_file = artifact.filename.clone();

        self.stage(&mut artifact).await?;

        result.phase = RestorePhase::Extracting;
        self.set_aside_previous_backup().await;
        self.extract(&artifact).await?;

        if job.skip_delete {
            info!("Skipping database deletion");
        } else {
            result.phase = RestorePhase::Deleting;
            self.delete_databases().await;
        }

        result.phase = RestorePhase::Importing;
        let files = self.discover_files().await?;
        let importer = BatchImporter::new(
            Arc::clone(&self.executor),
            ImportSettings::new(&self.config.import, &self.config.iotdb),
            Arc::clone(&self.classifier),
            self.cancel_token.clone(),
        );
        let summary = importer.import(&files).await;
        result.record_import(summary);

        if self.cancel_token.is_cancelled() {
            return Err(RestoreError::Cancelled("restore interrupted during import".to_string()));
        }

        result.phase = RestorePhase::Cleaning;
        self.cleanup(&artifact).await;

        result.phase = RestorePhase::Done;
        Ok(())
    }

    async fn resolve_timestamp(&self, job: &RestoreJob) -> Result<String> {
        if let Some(timestamp) = &job.timestamp {
            validate_timestamp(timestamp)?;
            return Ok(timestamp.clone());
        }
        if !self.config.backup.auto_detect_timestamp {
            return Err(RestoreError::Validation(
                "no timestamp given and backup.auto_detect_timestamp is off".to_string(),
            ));
        }

        let detector = TimestampDetector::new(
            &self.store,
            &self.config.backup.base_url,
            self.pod(),
            strategy_from_config(&self.config.backup),
        );
        detector.detect().await
    }

    /// Get the archive into the pod, downloading it locally first when the
    /// pod does not have it yet.
    async fn stage(&self, artifact: &mut BackupArtifact) -> Result<()> {
        if self.executor.file_exists(&artifact.remote_path).await? {
            info!(path = %artifact.remote_path, "Archive already present in pod, skipping download");
            return Ok(());
        }

        info!(url = %artifact.url, "Downloading archive");
        let local_size = self.store.download(&artifact.url, &artifact.local_path).await?;
        artifact.size = Some(local_size);

        info!(
            local = %artifact.local_path.display(),
            remote = %artifact.remote_path,
            size = %format_bytes(local_size),
            "Uploading archive into pod"
        );
        if let Err(e) = self.upload_verified(artifact, local_size).await {
            // A partial archive left behind would be taken as staged by the next run
            self.remove_remote_archive(artifact).await;
            return Err(e);
        }
        Ok(())
    }

    async fn upload_verified(&self, artifact: &BackupArtifact, local_size: u64) -> Result<()> {
        self.executor.upload(&artifact.local_path, &artifact.remote_path).await?;

        let remote_size = self.executor.file_size(&artifact.remote_path).await?;
        if remote_size != local_size {
            return Err(RestoreError::Validation(format!(
                "uploaded archive {} is {} bytes, expected {}",
                artifact.remote_path, remote_size, local_size
            )));
        }
        Ok(())
    }

    async fn remove_remote_archive(&self, artifact: &BackupArtifact) {
        let command = format!("rm -f {}", shell_quote(&artifact.remote_path));
        match self.executor.execute(&command).await {
            Ok(_) => info!(path = %artifact.remote_path, "Removed staged archive from pod"),
            Err(e) => warn!(error = %e, "Failed to remove staged archive from pod"),
        }
    }

    async fn set_aside_previous_backup(&self) {
        let dir = format!("{}/{}", self.config.iotdb.data_dir, PREVIOUS_BACKUP_DIR);
        let command = format!(
            "[ -d {dir} ] && mv {dir} {dir}_old_$(date +%s) || true",
            dir = dir
        );
        if let Err(e) = self.executor.execute(&command).await {
            warn!(error = %e, "Could not move previous backup directory aside");
        }
    }

    async fn extract(&self, artifact: &BackupArtifact) -> Result<()> {
        let command = format!(
            "tar --overwrite -xzf {} -C {}/",
            shell_quote(&artifact.remote_path),
            self.config.iotdb.data_dir
        );
        info!(command = %command, "Extracting archive");
        self.executor.execute(&command).await?;
        Ok(())
    }

    /// Drop every configured database, then flush. Each step may fail on its own.
    async fn delete_databases(&self) {
        let iotdb = &self.config.iotdb;
        for database in &iotdb.databases {
            let command = format!(
                "{} -h {} -e \"delete database {db}\" 2>/dev/null || echo 'Database {db} does not exist'",
                iotdb.cli_path,
                iotdb.host,
                db = database
            );
            match self.executor.execute(&command).await {
                Ok(_) => info!(database = %database, "Deleted database"),
                Err(e) => warn!(database = %database, error = %e, "Failed to delete database"),
            }
        }

        let flush = format!("{} -h {} -e \"flush\"", iotdb.cli_path, iotdb.host);
        if let Err(e) = self.executor.execute(&flush).await {
            warn!(error = %e, "Flush failed");
        }
    }

    async fn discover_files(&self) -> Result<Vec<String>> {
        let root = format!("{}/iotdb/data/datanode", self.config.iotdb.data_dir);
        let command = format!("find {} -name '*.tsfile' -type f", root);
        let output = self.executor.execute(&command).await?;

        let files = parse_file_list(&output.stdout);
        if files.is_empty() {
            return Err(RestoreError::NotFound(format!("no .tsfile files under {}", root)));
        }
        info!(count = files.len(), "Discovered TsFiles");
        Ok(files)
    }

    async fn cleanup(&self, artifact: &BackupArtifact) {
        self.remove_remote_archive(artifact).await;

        match tokio::fs::remove_file(&artifact.local_path).await {
            Ok(()) => info!(path = %artifact.local_path.display(), "Removed local archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove local archive"),
        }
    }
}

/// One path per non-blank output line, in discovery order
fn parse_file_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
