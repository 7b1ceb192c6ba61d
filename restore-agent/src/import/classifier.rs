//! Deciding whether a completed load command actually loaded the file.
//!
//! The IoTDB CLI can exit 0 and still print an error, so by default the
//! output has to mention success.

use crate::config::SuccessCheck;
use crate::remote::ExecOutput;
use std::sync::Arc;

pub trait OutcomeClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` when `output` shows the load went through.
    fn accepts(&self, output: &ExecOutput) -> bool;
}

/// Looks for a marker word in stdout+stderr, ignoring case.
#[derive(Debug, Clone)]
pub struct OutputMarker {
    marker: String,
}

impl OutputMarker {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_lowercase(),
        }
    }
}

impl Default for OutputMarker {
    fn default() -> Self {
        Self::new("success")
    }
}

impl OutcomeClassifier for OutputMarker {
    fn name(&self) -> &'static str {
        "output_marker"
    }

    fn accepts(&self, output: &ExecOutput) -> bool {
        output.combined().to_lowercase().contains(&self.marker)
    }
}

/// Trusts the exit status alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitStatus;

impl OutcomeClassifier for ExitStatus {
    fn name(&self) -> &'static str {
        "exit_status"
    }

    fn accepts(&self, output: &ExecOutput) -> bool {
        // An unknown code only happens when the session ended without a status
        matches!(output.exit_code, None | Some(0))
    }
}

pub fn classifier_for(check: SuccessCheck) -> Arc<dyn OutcomeClassifier> {
    match check {
        SuccessCheck::OutputMarker => Arc::new(OutputMarker::default()),
        SuccessCheck::ExitStatus => Arc::new(ExitStatus),
    }
}
