//! IoTDB Restore Agent - Main entry point
//!
//! Restores one IoTDB backup into a Kubernetes pod and reports the outcome.

use anyhow::{Context, Result};
use clap::Parser;
use restore_agent::{
    config::Config,
    daemon::shutdown::ShutdownCoordinator,
    notify::{Notifier, WechatNotifier},
    remote::KubeExecutor,
    transfer::HttpDownloader,
    utils, RestoreJob, RestoreOrchestrator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup timestamp (YYYYMMDDHHMMSS); detected from the store when omitted
    #[arg(short, long)]
    timestamp: Option<String>,

    /// Show what would be done without touching the pod
    #[arg(long)]
    dry_run: bool,

    /// Keep existing databases instead of dropping them before import
    #[arg(long)]
    skip_delete: bool,

    /// Kubernetes namespace (overrides config)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Pod to restore into (overrides config)
    #[arg(short, long)]
    pod: Option<String>,

    /// Concurrent load commands (overrides config)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Files per import batch (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the resolved configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(namespace) = &self.namespace {
            config.kubernetes.namespace = namespace.clone();
        }
        if let Some(pod) = &self.pod {
            config.kubernetes.pod_name = pod.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.import.concurrency = concurrency;
        }
        if let Some(batch_size) = self.batch_size {
            config.import.batch_size = batch_size;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }

    fn job(&self) -> RestoreJob {
        RestoreJob {
            timestamp: self.timestamp.clone(),
            dry_run: self.dry_run,
            skip_delete: self.skip_delete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply_overrides(&mut config);

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    // Initialize logging
    utils::logger::init(&config.log.level, &config.log.format)?;
    config.validate()?;

    tracing::info!(
        "Starting restore-agent v{} (pod: {}/{})",
        env!("CARGO_PKG_VERSION"),
        config.kubernetes.namespace,
        config.kubernetes.pod_name
    );

    // SIGINT/SIGTERM cancel everything downstream of this token
    let (cancel_token, signal_handle) = ShutdownCoordinator::new().spawn_signal_listener();

    // Cluster access is resolved on first exec, so a dry run needs no cluster
    let executor = Arc::new(KubeExecutor::new(&config.kubernetes, cancel_token.clone()));
    let store = HttpDownloader::new(&config.download, cancel_token.clone())?;
    let notifier = WechatNotifier::from_config(&config.notification)?;

    let orchestrator = RestoreOrchestrator::new(config, executor, store, cancel_token);
    let result = orchestrator.run(&args.job()).await;
    signal_handle.abort();

    if let Some(notifier) = notifier {
        if let Err(e) = notifier.send(&result).await {
            tracing::warn!("Failed to send notification: {}", e);
        }
    }

    match &result.error {
        None => {
            tracing::info!(
                "Restore complete: {}/{} files imported ({} failed)",
                result.success_count,
                result.total_files,
                result.failed_count
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(e) => {
            tracing::error!("Restore failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
