//! Out-of-process sandbox for running generated data-analysis code.
//!
//! Each call spawns the code in a fresh interpreter process inside a caller
//! supplied working directory, under a wall-clock deadline and OS resource
//! limits. The caller gets back whether it succeeded, everything it printed,
//! and the files (plots) it created or modified.
//!
//! ```rust,ignore
//! use datasandbox::{run_sandboxed_code, ResourceLimits};
//!
//! let limits = ResourceLimits::default().with_timeout_secs(10.0);
//! let result = run_sandboxed_code(
//!     "import matplotlib.pyplot as plt\nplt.plot([1, 2, 3])\nplt.savefig('plot.png')",
//!     "app/assets/data",
//!     &limits,
//! )
//! .await?;
//! assert_eq!(result.plots, vec!["plot.png"]);
//! ```

pub mod capture;
pub mod config;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod python;
pub mod reporter;
pub mod sandbox_builder;
pub mod scanner;
pub mod shell;

use std::path::PathBuf;

pub use capture::{CaptureBuffer, OutputCapture};
pub use config::{ImportPolicy, Language, OutputOrder, ResourceLimits, SandboxConfig};
pub use engine::{ExecutionRequest, ExecutionResult, Executor, Invocation, SandboxEngine};
pub use errors::{Result, SandboxError};
pub use guard::{GuardOutcome, LimitKind, ResourceGuard};
pub use python::PythonExecutor;
pub use reporter::ResultReporter;
pub use sandbox_builder::{create_bundled_engine, create_default_engine, create_engine};
pub use scanner::{ArtifactScanner, Snapshot};
pub use shell::ShellExecutor;

/// Run Python `code` in `work_dir` with the default engine.
///
/// # Returns
/// - `Ok(ExecutionResult)` once the code finished, failed, or was terminated.
/// - `Err(SandboxError)` if nothing could be started (missing directory, no Python).
pub async fn run_sandboxed_code(
    code: &str,
    work_dir: impl Into<PathBuf>,
    limits: &ResourceLimits,
) -> Result<ExecutionResult> {
    let engine = create_default_engine()?;
    engine
        .run(ExecutionRequest::new(code, work_dir), limits)
        .await
}
