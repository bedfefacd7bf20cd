use anyhow::Context;
use clap::Parser;
use datasandbox::{create_engine, ExecutionRequest, Language, SandboxConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status when the code ran but failed
const EXIT_EXECUTION_FAILED: u8 = 2;
/// Exit status when nothing could be run
const EXIT_SETUP_FAILED: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "datasandbox", version)]
#[command(about = "Run a generated analysis script in the sandbox and print its output")]
struct Cli {
    /// File containing the code to execute
    code_file: PathBuf,

    /// Working directory for the run (default: app/assets/data)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Wall clock timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Memory ceiling in megabytes
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Guest language: python or shell
    #[arg(long, value_parser = parse_language)]
    language: Option<Language>,

    /// Python interpreter to use instead of the one on PATH
    #[arg(long)]
    python: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the whole result as JSON instead of just the output
    #[arg(long)]
    json: bool,
}

fn parse_language(s: &str) -> Result<Language, String> {
    Language::parse(s).ok_or_else(|| format!("unknown language '{s}' (expected python or shell)"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_SETUP_FAILED)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // stderr, so logs never mix with the printed output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("datasandbox=warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_EXECUTION_FAILED),
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let code = std::fs::read_to_string(&cli.code_file)
        .with_context(|| format!("Failed to read file {}", cli.code_file.display()))?;

    let mut config = match &cli.config {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SandboxConfig::from_env()?,
    };
    if let Some(dir) = cli.work_dir {
        config.default_work_dir = dir;
    }
    if let Some(timeout) = cli.timeout {
        config.limits.timeout_seconds = timeout;
    }
    if let Some(mb) = cli.memory_mb {
        config.limits = config.limits.with_memory_mb(mb);
    }
    if let Some(language) = cli.language {
        config.language = language;
    }
    if let Some(python) = cli.python {
        config.python_path = Some(python);
    }

    let engine = create_engine(&config)?;
    let request = ExecutionRequest::new(code, config.default_work_dir.clone());
    let result = engine.run(request, &config.limits).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.output);
        if !result.output.is_empty() && !result.output.ends_with('\n') {
            println!();
        }
    }
    Ok(result.success)
}
