use crate::{
    config::ImportPolicy,
    engine::{Executor, Invocation},
    errors::{Result, SandboxError},
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Launcher exit status for an unhandled `MemoryError`
pub const MEMORY_ERROR_EXIT: i32 = 3;
/// Launcher exit status when the generated code tried to leave the interpreter
pub const EXIT_INTERCEPTED: i32 = 4;

const LAUNCHER_FILE: &str = "launcher.py";
const CODE_FILE: &str = "generated_code.py";

/// Runs generated Python in a fresh interpreter process
pub struct PythonExecutor {
    python_path: PathBuf,
    import_policy: ImportPolicy,
}

impl PythonExecutor {
    /// Create a new executor (finds Python in PATH)
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::InterpreterNotFound("python3".to_string()))?;

        Ok(Self {
            python_path,
            import_policy: ImportPolicy::default(),
        })
    }

    /// Create with explicit Python path (for bundled Python)
    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        if !python_path.exists() {
            return Err(SandboxError::InterpreterNotFound(
                python_path.display().to_string(),
            ));
        }

        Ok(Self {
            python_path,
            import_policy: ImportPolicy::default(),
        })
    }

    pub fn with_import_policy(mut self, policy: ImportPolicy) -> Self {
        self.import_policy = policy;
        self
    }

    /// Get the Python executable path being used
    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    /// Generate the `__import__` hook for the configured policy.
    ///
    /// Only imports issued directly by the generated code are checked, so
    /// libraries remain free to pull in their own dependencies.
    fn generate_import_control(&self) -> String {
        let (mode, modules) = match &self.import_policy {
            ImportPolicy::Unrestricted => return String::new(),
            ImportPolicy::Blacklist(modules) => ("blacklist", modules),
            ImportPolicy::Whitelist(modules) => ("whitelist", modules),
        };

        format!(
            r#"
_POLICY_MODE = "{mode}"
_POLICY_MODULES = frozenset({modules})
_original_import = builtins.__import__

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    # Relative imports stay inside an already-imported package
    if level > 0 or globals is None or globals.get("__name__") != "__main__":
        return _original_import(name, globals, locals, fromlist, level)
    root_module = name.split(".")[0]
    if _POLICY_MODE == "blacklist" and root_module in _POLICY_MODULES:
        raise ImportError(f"Module '{{root_module}}' is blocked in the sandbox")
    if _POLICY_MODE == "whitelist" and root_module not in _POLICY_MODULES:
        raise ImportError(f"Module '{{root_module}}' is not in the sandbox whitelist")
    return _original_import(name, globals, locals, fromlist, level)

builtins.__import__ = _guarded_import
"#,
            mode = mode,
            modules = python_string_list(modules),
        )
    }

    fn launcher(&self) -> String {
        format!(
            r#"import builtins
import os
import sys
import traceback

_TRACEBACK_LIMIT = 8
_real_exit = os._exit


class _ExitAttempt(BaseException):
    pass


def _blocked_exit(status=0):
    raise _ExitAttempt(status)


def _blocked_abort():
    raise _ExitAttempt("abort")


os._exit = _blocked_exit
os.abort = _blocked_abort

# Import control
{import_control}

def _run(path):
    with open(path, encoding="utf-8") as handle:
        source = handle.read()
    sys.argv = ["{code_file}"]
    namespace = {{"__name__": "__main__", "__file__": "{code_file}", "__builtins__": builtins}}
    try:
        code = compile(source, "{code_file}", "exec")
        exec(code, namespace)
    except MemoryError:
        traceback.print_exc(limit=-_TRACEBACK_LIMIT)
        return {memory_exit}
    except (SystemExit, _ExitAttempt) as exc:
        status = exc.code if isinstance(exc, SystemExit) else exc.args[0]
        sys.stderr.write(
            f"ExitBlocked: generated code tried to exit the interpreter (status {{status!r}})\n"
        )
        return {exit_intercepted}
    except BaseException:
        traceback.print_exc(limit=-_TRACEBACK_LIMIT)
        return 1
    return 0


_status = _run(sys.argv[1])
try:
    sys.stdout.flush()
    sys.stderr.flush()
except Exception:
    pass
_real_exit(_status)
"#,
            import_control = self.generate_import_control(),
            code_file = CODE_FILE,
            memory_exit = MEMORY_ERROR_EXIT,
            exit_intercepted = EXIT_INTERCEPTED,
        )
    }
}

/// Render module names as a Python list literal
fn python_string_list(items: &BTreeSet<String>) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|s| format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

#[async_trait]
impl Executor for PythonExecutor {
    fn name(&self) -> &str {
        "python"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.python_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn prepare(&self, code: &str, scratch: &Path) -> Result<Invocation> {
        let launcher_path = scratch.join(LAUNCHER_FILE);
        let code_path = scratch.join(CODE_FILE);
        tokio::fs::write(&launcher_path, self.launcher()).await?;
        tokio::fs::write(&code_path, code).await?;

        let mpl_dir = scratch.join("matplotlib");
        tokio::fs::create_dir_all(&mpl_dir).await?;

        Ok(Invocation {
            program: self.python_path.clone(),
            // -u: unbuffered so partial output survives a kill, -B: no .pyc files
            args: vec!["-u".into(), "-B".into(), launcher_path.into(), code_path.into()],
            env: vec![
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("MPLBACKEND".to_string(), "Agg".to_string()),
                (
                    "MPLCONFIGDIR".to_string(),
                    mpl_dir.to_string_lossy().into_owned(),
                ),
            ],
        })
    }

    fn memory_error_exit_code(&self) -> Option<i32> {
        Some(MEMORY_ERROR_EXIT)
    }
}
