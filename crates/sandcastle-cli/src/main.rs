use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::LevelFilter;
use sandcastle_core::{
    ConfigLoader, ExecutionRequest, ExecutionStatus, Orchestrator, OrchestratorError,
    RuntimeCatalog, SandcastleConfig, StreamType,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Exit status used when the execution hit its time limit, as `timeout(1)` does.
const EXIT_TIMED_OUT: i32 = 124;
/// Exit status after an interrupt, as shells report SIGINT.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser, Debug)]
#[clap(name = "sandcastle", author, version, about = "Run untrusted code in resource-bounded containers")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, global = true, help = "Configuration file (YAML); built-in defaults when omitted")]
    config: Option<PathBuf>,

    #[clap(long, short, global = true, help = "Log level; overrides the configuration file")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one execution and stream its output
    #[clap(group(clap::ArgGroup::new("source").required(true).args(["file", "project"])))]
    Run {
        #[clap(long, short = 'L', help = "Language or alias, e.g. python, js, sh")]
        language: String,

        #[clap(long, help = "Runtime version; the language default when omitted")]
        version: Option<String>,

        #[clap(long, short, help = "Source file to run")]
        file: Option<PathBuf>,

        #[clap(long, short, help = "Project directory under the workspace root")]
        project: Option<String>,

        #[clap(long, help = "Shell command to run instead of the runtime's entry command")]
        command: Option<String>,

        #[clap(long, short, help = "Time limit in seconds")]
        timeout: Option<i64>,

        #[clap(long, short, help = "Memory limit in bytes")]
        memory: Option<i64>,

        #[clap(long = "env", short, value_parser = parse_env, help = "Environment variable KEY=VALUE, repeatable")]
        env: Vec<(String, String)>,
    },
    /// List the runtime catalog
    Runtimes,
    /// Validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        // Validated below with its own error reporting
        Commands::CheckConfig { .. } => SandcastleConfig::default(),
        _ => ConfigLoader::from_optional_file(cli.config.as_deref())
            .await
            .context("Failed to load configuration")?,
    };

    let level = cli.log_level.as_deref().unwrap_or(config.logging.level.as_str());
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    match cli.command {
        Commands::Run {
            language,
            version,
            file,
            project,
            command,
            timeout,
            memory,
            env,
        } => {
            let mut request = match (file, project) {
                (Some(file), _) => inline_request(&language, &file).await?,
                (None, Some(project)) => ExecutionRequest::project(&language, project),
                (None, None) => anyhow::bail!("Either --file or --project is required"),
            };
            request.version = version;
            request.command = command;
            request.timeout = timeout;
            request.memory_bytes = memory;
            request.environment_vars.extend(env);

            let code = run(config, request).await?;
            std::process::exit(code);
        }
        Commands::Runtimes => {
            print_runtimes(&RuntimeCatalog::new(config.effective_runtimes()));
            Ok(())
        }
        Commands::CheckConfig { path } => check_config(&path).await,
    }
}

async fn inline_request(language: &str, file: &Path) -> Result<ExecutionRequest> {
    let filename = file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Invalid file name: {}", file.display()))?;
    let code = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(ExecutionRequest::inline(language, filename, code))
}

/// Execute, stream output until the log closes and return the process exit
/// status for the outcome. Ctrl-C cancels the execution once.
async fn run(config: SandcastleConfig, request: ExecutionRequest) -> Result<i32> {
    let orchestrator = Orchestrator::connect(config).await?;
    run_on(
        &orchestrator,
        request,
        tokio::io::stdout(),
        tokio::io::stderr(),
        tokio::signal::ctrl_c(),
    )
    .await
}

/// Run `request` and shut the orchestrator down whatever the outcome, so
/// that no container outlives the process, not even after a failed write.
async fn run_on<O, E, I>(
    orchestrator: &Orchestrator,
    request: ExecutionRequest,
    stdout: O,
    stderr: E,
    interrupt: I,
) -> Result<i32>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
    I: Future<Output = std::io::Result<()>>,
{
    let outcome = follow(orchestrator, request, stdout, stderr, interrupt).await;
    orchestrator.shutdown().await;
    outcome
}

async fn follow<O, E, I>(
    orchestrator: &Orchestrator,
    request: ExecutionRequest,
    mut stdout: O,
    mut stderr: E,
    interrupt: I,
) -> Result<i32>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
    I: Future<Output = std::io::Result<()>>,
{
    let execution_id = orchestrator.execute(request).await?;
    log::info!("Started execution {}", execution_id);

    let mut logs = orchestrator.log_stream(&execution_id, None)?;
    tokio::pin!(interrupt);
    let mut interrupted = false;

    loop {
        tokio::select! {
            entry = logs.next() => match entry {
                Some(entry) => {
                    match entry.stream {
                        StreamType::Stdout => stdout.write_all(entry.text.as_bytes()).await?,
                        StreamType::Stderr => stderr.write_all(entry.text.as_bytes()).await?,
                    }
                }
                None => break,
            },
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                log::warn!("Interrupted, cancelling execution {}", execution_id);
                match orchestrator.cancel(&execution_id).await {
                    Ok(()) | Err(OrchestratorError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;

    orchestrator.wait(&execution_id).await?;
    let response = orchestrator.response(&execution_id)?;
    let elapsed = response
        .end_time
        .map(|end| (end - response.start_time).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();
    eprintln!(
        "[{}] {} in {:.1}s (exit code {})",
        execution_id,
        response.status,
        elapsed,
        response
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    Ok(exit_status(response.status, response.exit_code))
}

fn exit_status(status: ExecutionStatus, exit_code: Option<i64>) -> i32 {
    match status {
        ExecutionStatus::Succeeded => 0,
        ExecutionStatus::TimedOut => EXIT_TIMED_OUT,
        ExecutionStatus::Cancelled => EXIT_CANCELLED,
        _ => match exit_code {
            Some(code) if code != 0 => i32::try_from(code).unwrap_or(1),
            _ => 1,
        },
    }
}

fn print_runtimes(catalog: &RuntimeCatalog) {
    println!("{:<14} {:<22} {:<8} {}", "ID", "IMAGE", "DEFAULT", "ALIASES");
    for runtime in catalog.list() {
        println!(
            "{:<14} {:<22} {:<8} {}",
            runtime.id,
            runtime.image,
            if runtime.default { "yes" } else { "" },
            runtime.aliases.join(", ")
        );
    }
}

async fn check_config(path: &Path) -> Result<()> {
    match ConfigLoader::from_file(path).await {
        Ok(config) => {
            println!("{}: OK", path.display());
            println!("  runtimes:  {}", config.effective_runtimes().len());
            println!(
                "  limits:    timeout {}s (max {}s), memory {} bytes (max {})",
                config.limits.default_timeout_secs,
                config.limits.max_timeout_secs,
                config.limits.default_memory_bytes,
                config.limits.max_memory_bytes
            );
            println!("  workspace: {}", config.workspace.root.display());
            Ok(())
        }
        Err(e) => anyhow::bail!("{}: {}", path.display(), e),
    }
}
