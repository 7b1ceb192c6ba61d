//! IoTDB Restore Agent Library
//!
//! Restores an IoTDB backup archive into a Kubernetes pod: fetches the
//! archive, unpacks it inside the pod and loads the TsFiles in batches with
//! bounded parallelism.

pub mod config;
pub mod daemon;
pub mod detect;
pub mod import;
pub mod notify;
pub mod remote;
pub mod restore;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use restore::{RestoreJob, RestoreOrchestrator, RestorePhase, RestoreResult};
pub use utils::errors::RestoreError;
pub type Result<T> = std::result::Result<T, RestoreError>;
