use std::sync::Arc;

use anyhow::{Context as _, Result};
use boardd::config::DaemonConfig;
use boardd::{server, AppContext};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "boardd",
    about = "Task-board sync daemon — scope-filtered event fan-out over WebSocket",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port
    #[arg(long, env = "BOARDD_PORT")]
    port: Option<u16>,

    /// Data directory for config and logs
    #[arg(long, env = "BOARDD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BOARDD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "BOARDD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "BOARDD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sync server (default when no subcommand given).
    ///
    /// Runs boardd in the foreground. Clients connect over WebSocket,
    /// declare their scopes, and receive matching events until they
    /// disconnect or idle out.
    Serve,
    /// Query a running server's health endpoint.
    ///
    /// Examples:
    ///   boardd status
    ///   boardd status --port 4310
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::new(args.port, args.data_dir, args.log, args.bind_address);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let _log_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);
            info!(version = env!("CARGO_PKG_VERSION"), port = config.port, "boardd starting");
            let ctx = Arc::new(AppContext::new(config));
            server::run(ctx).await
        }
        Command::Status => print_status(&config).await,
    }
}

/// Fetch and print the server's health document over plain HTTP.
///
/// The server answers `GET /health` on the WebSocket port, so no WS
/// handshake is needed here.
async fn print_status(config: &DaemonConfig) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = format!("{}:{}", config.bind_address, config.port);
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("no server listening on {addr}"))?;

    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b)
        .unwrap_or(&response);
    println!("{body}");
    Ok(())
}

fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("boardd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
