use crate::{
    engine::{Executor, Invocation},
    errors::{Result, SandboxError},
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const SCRIPT_FILE: &str = "script.sh";

/// Runs code with a POSIX shell.
///
/// `exit` is the shell's normal way to report status and only ends the child
/// process, so it is not intercepted.
pub struct ShellExecutor {
    shell_path: PathBuf,
}

impl ShellExecutor {
    pub fn new() -> Result<Self> {
        let shell_path = which::which("sh")
            .or_else(|_| {
                let fallback = PathBuf::from("/bin/sh");
                if fallback.exists() {
                    Ok(fallback)
                } else {
                    Err(())
                }
            })
            .map_err(|_| SandboxError::InterpreterNotFound("sh".to_string()))?;
        Ok(Self { shell_path })
    }

    pub fn with_shell_path(shell_path: PathBuf) -> Result<Self> {
        if !shell_path.exists() {
            return Err(SandboxError::InterpreterNotFound(
                shell_path.display().to_string(),
            ));
        }
        Ok(Self { shell_path })
    }

    pub fn shell_path(&self) -> &Path {
        &self.shell_path
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.shell_path)
            .arg("-c")
            .arg("true")
            .stdin(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn prepare(&self, code: &str, scratch: &Path) -> Result<Invocation> {
        let script = scratch.join(SCRIPT_FILE);
        tokio::fs::write(&script, code).await?;
        Ok(Invocation {
            program: self.shell_path.clone(),
            args: vec![script.into()],
            env: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_runs_script_file() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new().unwrap();
        let invocation = executor.prepare("echo hi", scratch.path()).await.unwrap();

        assert_eq!(invocation.program, executor.shell_path());
        assert_eq!(invocation.args, vec![scratch.path().join(SCRIPT_FILE).into_os_string()]);
        assert_eq!(
            std::fs::read_to_string(scratch.path().join(SCRIPT_FILE)).unwrap(),
            "echo hi"
        );
    }

    #[tokio::test]
    async fn test_shell_is_available() {
        let executor = ShellExecutor::new().unwrap();
        assert!(executor.is_available().await);
    }
}
