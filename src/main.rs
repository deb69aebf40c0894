//! AgentEvolution - main entry point.
//!
//! Serves the JSON-RPC protocol over stdio: one request per line on stdin,
//! one response per line on stdout. Logs go to stderr so the RPC stream
//! stays clean.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use agentevolution::{App, Config};

/// Configuration could not be resolved.
const EXIT_CONFIG: u8 = 2;
/// Reserved for transports that bind a port.
#[allow(dead_code)]
const EXIT_BIND: u8 = 3;
/// The store is unavailable or corrupt.
const EXIT_STORE: u8 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "agentevolution",
    about = "Self-evolving tool registry for autonomous agents",
    version
)]
struct Cli {
    /// Override the data directory (beats AGENTEVOLUTION_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the registry over stdio (default).
    Serve,
    /// Resolve and print the effective configuration, then exit.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env if present.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agentevolution=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let config = match cli.data_dir {
        Some(ref dir) => config.with_data_dir(dir),
        None => config,
    };

    if let Some(Command::Check) = cli.command {
        println!("data dir:        {}", config.data_dir.display());
        println!("database:        {}", config.db_path().display());
        println!("sandbox pool:    {}", config.sandbox.pool_size);
        println!("wall limit:      {:?}", config.sandbox.wall_limit);
        println!("cpu limit:       {:?}", config.sandbox.cpu_limit);
        println!("memory limit:    {} MiB", config.sandbox.memory_limit_mb);
        println!("allowed imports: {}", config.screener.allowed_imports.len());
        return ExitCode::SUCCESS;
    }

    tracing::info!(data_dir = %config.data_dir.display(), "starting AgentEvolution");

    let app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "failed to open the registry store");
            return ExitCode::from(EXIT_STORE);
        }
    };

    tracing::info!("registry ready, serving JSON-RPC on stdio");

    if let Err(e) = serve_stdio(&app).await {
        tracing::error!(error = %e, "stdio transport failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}

/// Read newline-delimited JSON-RPC requests from stdin until EOF.
async fn serve_stdio(app: &App) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = agentevolution::protocol::handle_line(app, &line).await {
            let mut bytes = serde_json::to_vec(&response)?;
            bytes.push(b'\n');
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
