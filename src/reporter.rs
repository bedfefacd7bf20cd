use crate::engine::ExecutionResult;
use crate::errors::Result;
use crate::guard::{GuardOutcome, LimitKind};
use tracing::warn;

/// Turns the raw observations of one run into an `ExecutionResult`
pub struct ResultReporter;

impl ResultReporter {
    /// Assemble the final result. Never fails: a scanner error only empties `plots`.
    pub fn assemble(
        outcome: &GuardOutcome,
        output: String,
        artifacts: Result<Vec<String>>,
    ) -> ExecutionResult {
        let plots = artifacts.unwrap_or_else(|e| {
            warn!("[SANDBOX] Artifact scan failed, reporting no plots: {}", e);
            Vec::new()
        });

        let success = outcome.is_success();
        let output = match Self::status_line(outcome) {
            Some(status) => {
                let mut output = output;
                if !output.is_empty() && !output.ends_with('\n') {
                    output.push('\n');
                }
                output.push_str(&status);
                output
            }
            None => output,
        };

        ExecutionResult {
            success,
            output,
            plots,
        }
    }

    /// Trailing line describing a failed run, `None` on success
    pub fn status_line(outcome: &GuardOutcome) -> Option<String> {
        let line = match outcome {
            GuardOutcome::Completed { exit_code: 0 } => return None,
            GuardOutcome::Completed { exit_code } => {
                format!("[runtime error] process exited with status {exit_code}")
            }
            GuardOutcome::TimedOut { after } => format!(
                "[timeout] execution exceeded {:.1}s and was terminated",
                after.as_secs_f64()
            ),
            GuardOutcome::ResourceExceeded(LimitKind::Memory { ceiling_bytes }) => {
                match ceiling_bytes {
                    Some(bytes) => format!(
                        "[memory limit exceeded] execution used more than {} MB and was terminated",
                        bytes / (1024 * 1024)
                    ),
                    None => "[memory limit exceeded] execution ran out of memory".to_string(),
                }
            }
            GuardOutcome::ResourceExceeded(LimitKind::CpuTime { seconds }) => match seconds {
                Some(s) => {
                    format!("[cpu time limit exceeded] execution used more than {s}s of CPU")
                }
                None => "[cpu time limit exceeded] execution was stopped".to_string(),
            },
            GuardOutcome::ResourceExceeded(LimitKind::FileSize { max_bytes }) => match max_bytes {
                Some(b) => format!("[file size limit exceeded] a file grew beyond {b} bytes"),
                None => "[file size limit exceeded] execution was stopped".to_string(),
            },
            GuardOutcome::Crashed { reason } => format!("[crashed] {reason}"),
        };
        Some(line)
    }
}
