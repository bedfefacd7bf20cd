use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Working directory used when the caller does not name one.
pub const DEFAULT_WORK_DIR: &str = "app/assets/data";

/// Guest language the engine runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Python 3, the language the code generator writes
    #[default]
    Python,
    /// POSIX `sh`
    Shell,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "shell" | "sh" => Some(Self::Shell),
            _ => None,
        }
    }
}

/// How captured stdout and stderr are combined into one text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputOrder {
    /// All of stdout, then all of stderr. Deterministic.
    #[default]
    Sequential,
    /// Chunks in the order they were read from either pipe.
    /// Best-effort chronological; depends on the guest flushing its streams.
    Interleaved,
}

/// Resource limits for one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall clock budget in seconds
    pub timeout_seconds: f64,
    /// Address-space / resident-memory ceiling in bytes
    pub memory_ceiling_bytes: Option<u64>,
    /// CPU time budget in seconds (RLIMIT_CPU)
    pub cpu_seconds: Option<u64>,
    /// Largest file the guest may write (RLIMIT_FSIZE)
    pub max_file_bytes: Option<u64>,
    /// Maximum number of processes for the sandbox user (RLIMIT_NPROC)
    pub max_processes: Option<u64>,
    /// Thread count handed to BLAS/OpenMP backed libraries
    pub max_threads: u32,
    /// Cap on captured output; `None` keeps everything
    pub max_output_bytes: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 30.0,
            memory_ceiling_bytes: Some(2048 * 1024 * 1024),
            cpu_seconds: None,
            max_file_bytes: None,
            max_processes: None,
            max_threads: 4,
            max_output_bytes: Some(1024 * 1024),
        }
    }
}

impl ResourceLimits {
    /// Wall clock timeout as a `Duration`. NaN or negative values clamp to zero,
    /// values too large to represent saturate at `Duration::MAX`.
    pub fn timeout(&self) -> Duration {
        if self.timeout_seconds.is_nan() || self.timeout_seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(Duration::MAX)
    }

    pub fn with_timeout_secs(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_ceiling_bytes = Some(mb.saturating_mul(1024 * 1024));
        self
    }

    pub fn without_memory_ceiling(mut self) -> Self {
        self.memory_ceiling_bytes = None;
        self
    }
}

/// Import control policy for the Python executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportPolicy {
    /// Any module may be imported
    #[default]
    Unrestricted,
    /// Block specific modules
    Blacklist(BTreeSet<String>),
    /// Only allow specific modules
    Whitelist(BTreeSet<String>),
}

impl ImportPolicy {
    /// Check if an import is allowed
    pub fn is_allowed(&self, module: &str) -> bool {
        let root_module = module.split('.').next().unwrap_or(module);

        match self {
            ImportPolicy::Unrestricted => true,
            ImportPolicy::Blacklist(blacklist) => !blacklist.contains(root_module),
            ImportPolicy::Whitelist(whitelist) => whitelist.contains(root_module),
        }
    }

    /// Modules that reach outside the working directory or spawn processes
    pub fn dangerous_modules() -> Self {
        let blacklist = [
            "subprocess",
            "multiprocessing",
            "socket",
            "urllib",
            "requests",
            "ctypes",
            "pty",
            "fcntl",
            "resource",
            "shutil",
            "webbrowser",
            "antigravity",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        ImportPolicy::Blacklist(blacklist)
    }
}

/// Top-level sandbox configuration.
///
/// Loaded from TOML, then overridden by `DATASANDBOX_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Working directory used by the CLI when none is given
    pub default_work_dir: PathBuf,
    pub language: Language,
    /// Explicit interpreter (for a bundled Python)
    pub python_path: Option<PathBuf>,
    pub limits: ResourceLimits,
    pub output_order: OutputOrder,
    /// Scan subdirectories of the working directory for artifacts
    pub recursive_scan: bool,
    /// Only report artifacts with these extensions; empty reports every file
    pub artifact_extensions: Vec<String>,
    pub import_policy: ImportPolicy,
    /// Host environment variables passed through to the guest
    pub inherit_env: Vec<String>,
    /// Extra environment variables set for the guest
    pub env_vars: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            language: Language::default(),
            python_path: None,
            limits: ResourceLimits::default(),
            output_order: OutputOrder::default(),
            recursive_scan: false,
            artifact_extensions: Vec::new(),
            import_policy: ImportPolicy::default(),
            inherit_env: Vec::new(),
            env_vars: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `DATASANDBOX_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(dir) = non_empty("DATASANDBOX_WORK_DIR") {
            self.default_work_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = non_empty("DATASANDBOX_TIMEOUT") {
            self.limits.timeout_seconds = timeout.parse().map_err(|_| {
                SandboxError::Config(format!("DATASANDBOX_TIMEOUT is not a number: {timeout}"))
            })?;
        }
        if let Some(mb) = non_empty("DATASANDBOX_MEMORY_MB") {
            let mb: u64 = mb.parse().map_err(|_| {
                SandboxError::Config(format!("DATASANDBOX_MEMORY_MB is not an integer: {mb}"))
            })?;
            self.limits = self.limits.clone().with_memory_mb(mb);
        }
        if let Some(python) = non_empty("DATASANDBOX_PYTHON") {
            self.python_path = Some(PathBuf::from(python));
        }
        if let Some(language) = non_empty("DATASANDBOX_LANGUAGE") {
            self.language = Language::parse(&language).ok_or_else(|| {
                SandboxError::Config(format!("unknown DATASANDBOX_LANGUAGE: {language}"))
            })?;
        }
        Ok(())
    }
}
