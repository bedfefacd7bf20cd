use crate::{
    config::{Language, SandboxConfig},
    engine::{Executor, SandboxEngine},
    python::PythonExecutor,
    scanner::ArtifactScanner,
    shell::ShellExecutor,
    Result,
};
use std::path::PathBuf;
use tracing::info;

/// Build the executor for `config.language`
pub fn create_executor(config: &SandboxConfig) -> Result<Box<dyn Executor>> {
    let executor: Box<dyn Executor> = match config.language {
        Language::Python => {
            let python = match &config.python_path {
                Some(path) => PythonExecutor::with_python_path(path.clone())?,
                None => PythonExecutor::new()?,
            };
            info!("[SANDBOX] Using Python at {:?}", python.python_path());
            Box::new(python.with_import_policy(config.import_policy.clone()))
        }
        Language::Shell => Box::new(ShellExecutor::new()?),
    };
    Ok(executor)
}

/// Create an engine from a full configuration
pub fn create_engine(config: &SandboxConfig) -> Result<SandboxEngine> {
    let scanner = ArtifactScanner::new()
        .recursive(config.recursive_scan)
        .with_extensions(&config.artifact_extensions);

    let mut engine = SandboxEngine::new(create_executor(config)?)
        .with_scanner(scanner)
        .with_output_order(config.output_order)
        .with_inherited_env(config.inherit_env.iter().cloned());
    for (key, value) in &config.env_vars {
        engine = engine.with_env_var(key, value);
    }
    Ok(engine)
}

/// Create default engine (system Python, default settings)
pub fn create_default_engine() -> Result<SandboxEngine> {
    create_engine(&SandboxConfig::default())
}

/// Create engine with bundled Python
///
/// # Example
/// ```rust,ignore
/// let engine = create_bundled_engine(PathBuf::from("/opt/app/python/bin/python3"))?;
/// ```
pub fn create_bundled_engine(python_path: PathBuf) -> Result<SandboxEngine> {
    create_engine(&SandboxConfig {
        python_path: Some(python_path),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SandboxError;

    #[test]
    fn test_shell_engine() {
        let config = SandboxConfig {
            language: Language::Shell,
            ..Default::default()
        };
        let engine = create_engine(&config).unwrap();
        assert_eq!(engine.executor().name(), "shell");
    }

    #[test]
    fn test_missing_bundled_python_is_setup_error() {
        let err = create_bundled_engine(PathBuf::from("/nowhere/python3"))
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));
    }
}
