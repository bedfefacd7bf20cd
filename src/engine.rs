use crate::{
    capture::OutputCapture,
    config::{OutputOrder, ResourceLimits},
    errors::{Result, SandboxError},
    guard::{kill_group, GuardOutcome, LimitKind, ResourceGuard},
    reporter::ResultReporter,
    scanner::ArtifactScanner,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, info_span, Instrument};

/// How long the pipes may stay open after the process group is gone
const CAPTURE_GRACE: Duration = Duration::from_millis(500);

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// One piece of untrusted code and the directory it runs in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub source_code: String,
    pub working_directory: PathBuf,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            source_code: source_code.into(),
            working_directory: working_directory.into(),
        }
    }
}

/// Verdict of one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    /// Captured stdout/stderr, plus a status line on failure
    pub output: String,
    /// Files created or modified under the working directory, relative names
    pub plots: Vec<String>,
}

/// How to start a prepared piece of code
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
}

/// Runs source text of one guest language
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Whether the interpreter can actually be started on this host
    async fn is_available(&self) -> bool;

    /// Write launcher files for `code` into `scratch` and describe the command.
    /// `scratch` lives outside the working directory and is removed after the run.
    async fn prepare(&self, code: &str, scratch: &Path) -> Result<Invocation>;

    /// Exit status the launcher uses to report that the guest ran out of memory
    fn memory_error_exit_code(&self) -> Option<i32> {
        None
    }
}

/// Runs untrusted code out of process and reports what happened
pub struct SandboxEngine {
    executor: Box<dyn Executor>,
    scanner: ArtifactScanner,
    output_order: OutputOrder,
    inherit_env: Vec<String>,
    env_vars: HashMap<String, String>,
}

impl SandboxEngine {
    pub fn new(executor: Box<dyn Executor>) -> Self {
        Self {
            executor,
            scanner: ArtifactScanner::new(),
            output_order: OutputOrder::default(),
            inherit_env: Vec::new(),
            env_vars: HashMap::new(),
        }
    }

    pub fn with_scanner(mut self, scanner: ArtifactScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_output_order(mut self, order: OutputOrder) -> Self {
        self.output_order = order;
        self
    }

    /// Pass these host environment variables through to the guest
    pub fn with_inherited_env<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inherit_env.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Execute `request` under `limits`.
    ///
    /// Returns `Err` only for setup problems, before anything was started.
    /// Runtime errors, timeouts and limit violations come back as a failed
    /// `ExecutionResult`.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult> {
        let execution_id = uuid::Uuid::new_v4();
        let span = info_span!(
            "sandbox_run",
            %execution_id,
            executor = self.executor.name()
        );
        self.run_inner(request, limits).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: ExecutionRequest,
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult> {
        let work_dir = validate_working_directory(&request.working_directory)?;
        let before = self.scanner.snapshot(&work_dir)?;

        let scratch = tempfile::Builder::new()
            .prefix("datasandbox-")
            .tempdir()?;
        let invocation = self
            .executor
            .prepare(&request.source_code, scratch.path())
            .await?;

        let mut cmd = self.build_command(&invocation, &work_dir, scratch.path(), limits);
        let guard = ResourceGuard::new(limits.clone());
        guard.apply(&mut cmd);

        info!(
            "[SANDBOX] Executing {} bytes of code in {:?} (timeout {:?})",
            request.source_code.len(),
            work_dir,
            limits.timeout()
        );
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn(std::io::Error::other("stdout was not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn(std::io::Error::other("stderr was not piped")))?;
        let capture = OutputCapture::start(
            stdout,
            stderr,
            self.output_order,
            limits.max_output_bytes,
        );

        let mut outcome = guard.watch(&mut child).await;
        // anything the guest left running in its group goes too; ESRCH when
        // the leader exited normally and nothing else is left
        kill_group(pid);

        if let GuardOutcome::Completed { exit_code } = outcome {
            if Some(exit_code) == self.executor.memory_error_exit_code() {
                outcome = GuardOutcome::ResourceExceeded(LimitKind::Memory {
                    ceiling_bytes: limits.memory_ceiling_bytes,
                });
            }
        }

        let output = capture.finish(CAPTURE_GRACE).await;
        let artifacts = self
            .scanner
            .snapshot(&work_dir)
            .map(|after| self.scanner.diff(&before, &after));

        let result = ResultReporter::assemble(&outcome, output, artifacts);
        info!(
            "[SANDBOX] Finished in {:?}: {:?}, {} artifact(s)",
            started.elapsed(),
            outcome,
            result.plots.len()
        );
        Ok(result)
    }

    fn build_command(
        &self,
        invocation: &Invocation,
        work_dir: &Path,
        scratch: &Path,
        limits: &ResourceLimits,
    ) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();

        for (key, value) in base_environment(scratch, limits) {
            cmd.env(key, value);
        }
        for name in &self.inherit_env {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        debug!("[SANDBOX] Command: {:?}", cmd.as_std());
        cmd
    }
}

/// Environment every guest starts from: nothing of the host except
/// `PATH` and locale, with home and temp pointed at the scratch dir.
fn base_environment(scratch: &Path, limits: &ResourceLimits) -> Vec<(String, String)> {
    let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
    let scratch = scratch.to_string_lossy().into_owned();
    let threads = limits.max_threads.max(1).to_string();

    let mut env = vec![
        ("PATH".to_string(), path),
        ("HOME".to_string(), scratch.clone()),
        ("TMPDIR".to_string(), scratch.clone()),
        ("XDG_CACHE_HOME".to_string(), scratch),
        ("OMP_NUM_THREADS".to_string(), threads.clone()),
        ("OPENBLAS_NUM_THREADS".to_string(), threads.clone()),
        ("MKL_NUM_THREADS".to_string(), threads),
    ];
    match std::env::var("LANG") {
        Ok(lang) => env.push(("LANG".to_string(), lang)),
        Err(_) => env.push(("LANG".to_string(), "C.UTF-8".to_string())),
    }
    if let Ok(lc_all) = std::env::var("LC_ALL") {
        env.push(("LC_ALL".to_string(), lc_all));
    }
    env
}

/// The directory must already exist, be a directory and be writable.
/// Returns its canonical path.
pub fn validate_working_directory(dir: &Path) -> Result<PathBuf> {
    let meta = match std::fs::metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SandboxError::WorkingDirectoryMissing(dir.to_path_buf()));
        }
        Err(source) => {
            return Err(SandboxError::Snapshot {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    if !meta.is_dir() {
        return Err(SandboxError::NotADirectory(dir.to_path_buf()));
    }
    if meta.permissions().readonly() {
        return Err(SandboxError::WorkingDirectoryReadOnly(dir.to_path_buf()));
    }
    Ok(dir.canonicalize()?)
}
