use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use tracing_subscriber::{fmt, EnvFilter};

use metricrelay::agent::tracker::RunSummary;
use metricrelay::agent::Agent;
use metricrelay::config::Config;

/// Collects metrics from monitoring backends and ships them to the
/// ingestion endpoint.
#[derive(Parser)]
#[command(name = "metricrelay", about)]
struct Cli {
    /// Config file, or a directory of *.yaml / *.yml files.
    #[arg(short, long, default_value = "conf.d")]
    config: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,

    /// Number of agents run concurrently (default: 4 x CPUs).
    #[arg(short, long)]
    processes: Option<usize>,

    /// Wall-clock limit for the whole run.
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Build and log payloads without sending them.
    #[arg(short, long)]
    testing: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn log_filter(&self) -> &str {
        if self.testing || self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            &self.log_level
        }
    }

    fn processes(&self) -> usize {
        self.processes
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, |n| n.get()) * 4
            })
            .max(1)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("metricrelay {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(cli.log_filter())
        .with_context(|| format!("invalid log level: {}", cli.log_filter()))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        testing = cli.testing,
        "starting metricrelay",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let files = config_files(&cli.config)?;
    let semaphore = Arc::new(Semaphore::new(cli.processes()));
    let mut agents = JoinSet::new();
    let mut failed = 0usize;

    for path in files {
        let name = path.display().to_string();

        let cfg = match Config::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(config = %name, error = %format!("{e:#}"), "invalid config");
                failed += 1;
                continue;
            }
        };

        let span = tracing::info_span!("agent", config = %name);
        let agent = match span.in_scope(|| Agent::new(&cfg, cli.testing)) {
            Ok(agent) => agent,
            Err(e) => {
                tracing::error!(config = %name, error = %format!("{e:#}"), "creating agent failed");
                failed += 1;
                continue;
            }
        };

        let semaphore = Arc::clone(&semaphore);
        agents.spawn(
            async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                agent.run().await
            }
            .instrument(span),
        );
    }

    // Upstream and delivery failures are reported by each agent's summary
    // and do not affect the exit status.
    let finished = tokio::select! {
        done = tokio::time::timeout(cli.timeout, join_all(&mut agents)) => {
            if done.is_err() {
                tracing::error!(timeout = ?cli.timeout, "run timed out, aborting agents");
            }
            done.is_ok()
        }
        _ = shutdown_signal() => false,
    };

    if !finished {
        agents.abort_all();
        while agents.join_next().await.is_some() {}
    }

    tracing::info!(failed, "metricrelay finished");

    if failed > 0 {
        bail!("{failed} config(s) failed to load");
    }

    Ok(())
}

/// Waits for every agent, logging any that panicked.
async fn join_all(agents: &mut JoinSet<RunSummary>) {
    while let Some(joined) = agents.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "agent task panicked");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "failed to register SIGTERM handler"),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received SIGINT, shutting down");
    }
}

/// Resolves `path` into the config files to run, sorted by name.
fn config_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = std::fs::read_dir(path)
        .with_context(|| format!("reading config directory {}", path.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", path.display()))?;
        let file = entry.path();
        let is_yaml = file
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if is_yaml && file.is_file() {
            files.push(file);
        }
    }

    if files.is_empty() {
        bail!("no *.yaml or *.yml files in {}", path.display());
    }

    files.sort();
    Ok(files)
}
