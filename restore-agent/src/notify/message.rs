//! Markdown rendering of a restore result for chat webhooks.

use crate::detect::format_timestamp;
use crate::restore::RestoreResult;
use crate::transfer::progress::format_duration;
use std::fmt::Write as _;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render `result` as a WeChat Work markdown message.
pub fn build_message(result: &RestoreResult, environment: &str, host: &str) -> String {
    let status = if result.is_success() { "✅" } else { "❌" };
    let title = if result.dry_run {
        "IoTDB Restore (dry run)"
    } else {
        "IoTDB Restore"
    };
    let backup_file = if result.backup_file.is_empty() {
        "-"
    } else {
        result.backup_file.as_str()
    };

    let mut message = String::new();
    let _ = writeln!(message, "## {}\n", title);
    let _ = writeln!(message, "{} **Environment**: {}", status, environment);
    let _ = writeln!(message, "> **Pod**: `{}`", result.pod);
    let _ = writeln!(message, "> **Backup file**: `{}`", backup_file);
    if !result.timestamp.is_empty() {
        let backup_time = format_timestamp(&result.timestamp).unwrap_or_else(|_| result.timestamp.clone());
        let _ = writeln!(message, "> **Backup time**: {}", backup_time);
    }
    let _ = writeln!(message, "> **Run**: `{}` on {}\n", result.run_id, host);

    message.push_str("---\n\n### Statistics\n\n");
    message.push_str("| Item | Value |\n|------|------|\n");
    let _ = writeln!(message, "| **Started** | {} |", result.start_time.format(TIME_FORMAT));
    let _ = writeln!(message, "| **Finished** | {} |", result.end_time.format(TIME_FORMAT));
    let _ = writeln!(message, "| **Duration** | {} |", format_duration(result.duration));
    let _ = writeln!(message, "| **Total files** | {} |", result.total_files);
    let _ = writeln!(message, "| **Imported** | {} |", result.success_count);
    let _ = writeln!(message, "| **Failed** | {} |", result.failed_count);
    message.push_str("\n---\n\n");

    match &result.error {
        Some(error) => {
            let phase = result
                .failed_phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let _ = writeln!(message, "### ❌ Restore failed during {}\n", phase);
            let _ = writeln!(message, "Error: {}", error);
        }
        None if result.failed_count > 0 => {
            let _ = writeln!(
                message,
                "### ⚠️ Restore completed with {} failed file(s)",
                result.failed_count
            );
        }
        None => message.push_str("### ✅ Restore completed\n"),
    }

    message
}
