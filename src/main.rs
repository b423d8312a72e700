mod commands;
mod demo;
mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use logstream_core::{AlertHook, FilterSpec, LevelFilter, StreamConfig, StreamSession};
use logstream_transport::{Transport, WebSocketTransport};

use crate::commands::Command;
use crate::output::BellNotifier;

/// Logstream - follow a live log stream from the terminal
#[derive(Parser, Debug)]
#[command(name = "logstream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the log stream (ws://)
    #[arg(long, env = "LOGSTREAM_URL", required_unless_present = "demo")]
    url: Option<String>,

    /// Stream synthetic logs from a built-in server instead of --url
    #[arg(long)]
    demo: bool,

    /// Bearer token for the stream endpoint
    #[arg(long, env = "LOGSTREAM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Only show logs whose message or source contains TEXT
    #[arg(long, value_name = "TEXT")]
    filter: Option<String>,

    /// Only show logs of this level (or ALL)
    #[arg(long, value_name = "LEVEL")]
    level: Option<LevelFilter>,

    /// Only show logs from this source
    #[arg(long, value_name = "SOURCE")]
    source: Option<String>,

    /// Number of log entries kept in the display buffer
    #[arg(long, value_name = "N")]
    buffer_size: Option<usize>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose);

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// File config (or defaults) with CLI overrides applied
fn load_config(args: &Args) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };

    if let Some(size) = args.buffer_size {
        config.buffer.capacity = size;
    }
    config.validate().context("invalid command line override")?;
    Ok(config)
}

fn initial_filter(args: &Args) -> FilterSpec {
    FilterSpec {
        text: args.filter.clone(),
        level: args.level.unwrap_or_default(),
        source: args.source.clone(),
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    let mut feed = None;
    let (transport, token): (Arc<dyn Transport>, String) = if args.demo {
        let transport = demo::transport();
        feed = Some(demo::spawn(transport.clone(), Duration::from_millis(250)));
        let token = args.token.clone().unwrap_or_else(|| demo::TOKEN.to_string());
        (Arc::new(transport), token)
    } else {
        let Some(url) = &args.url else {
            bail!("--url is required unless --demo is given");
        };
        let Some(token) = args.token.clone() else {
            bail!("--token (or LOGSTREAM_TOKEN) is required");
        };
        (Arc::new(WebSocketTransport::new(url)?), token)
    };

    let session = Arc::new(StreamSession::new(transport, config.clone())?);
    session.set_filter(initial_filter(&args))?;

    output::install(&session);
    let _hook = AlertHook::install(
        session.bus(),
        config.notifications.clone(),
        Arc::new(BellNotifier),
    )?;

    // Later failures surface as state changes; `retry` restarts from there
    let connecting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = session.connect(&token).await {
                warn!(error = %e, "initial connection failed");
                eprintln!("connect failed: {e} (type 'retry' to try again)");
            }
        })
    };

    eprintln!("{}", commands::HELP);
    command_loop(&session).await?;

    debug!("shutting down");
    session.disconnect();
    connecting.abort();
    if let Some(feed) = feed {
        feed.abort();
    }
    Ok(())
}

/// Read stdin commands until `quit` or Ctrl-C
///
/// A closed stdin leaves the stream running until Ctrl-C.
async fn command_loop(session: &StreamSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                eprintln!("interrupted");
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("failed to read stdin")? else {
                    debug!("stdin closed");
                    stdin_open = false;
                    continue;
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => return Ok(()),
                    Ok(Some(command)) => {
                        if let Err(e) = command.apply(session) {
                            eprintln!("{e:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("{e:#}"),
                }
            }
        }
    }
}
