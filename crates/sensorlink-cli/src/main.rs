//! SensorLink command line
//!
//! `sensorlink ports` lists candidate ports. `sensorlink run` keeps the sensor
//! connected, appends records to JSON-lines files and takes operator commands
//! on stdin.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sensorlink_core::prelude::*;
use sensorlink_core::serial::is_known_device;

mod settings;
mod store;

#[derive(Parser)]
#[command(name = "sensorlink", version)]
#[command(about = "Keep a serial sensor connected and store what it reports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports; recognised devices are marked with '*'
    Ports,
    /// Run the connection manager until Ctrl-C or /quit
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pin a port instead of discovering one
    #[arg(short, long)]
    port: Option<String>,

    /// Directory for <table>.jsonl output
    #[arg(short, long, default_value = "data")]
    out: PathBuf,

    /// Do not hot-swap to better ports
    #[arg(long)]
    no_switching: bool,
}

/// A line typed by the operator
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Status,
    Reconnect,
    Disconnect,
    Connect,
    Scan,
    Switching(bool),
    Quit,
    Send(String),
    Empty,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some("status"), None) => Input::Status,
        (Some("reconnect"), None) => Input::Reconnect,
        (Some("disconnect"), None) => Input::Disconnect,
        (Some("connect"), None) => Input::Connect,
        (Some("scan"), None) => Input::Scan,
        (Some("switching"), Some("on")) => Input::Switching(true),
        (Some("switching"), Some("off")) => Input::Switching(false),
        (Some("quit" | "exit"), None) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ports => list_ports().await,
        Commands::Run(args) => run(args).await,
    }
}

async fn list_ports() -> Result<()> {
    let ports = SystemSerial
        .list_ports()
        .await
        .context("listing serial ports")?;

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in &ports {
        let marker = if is_known_device(port) { '*' } else { ' ' };
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
            (Some(vid), None) => format!("{vid:04x}:----"),
            _ => "         ".to_string(),
        };
        println!(
            "{marker} {:<24} {ids}  {}",
            port.name,
            port.manufacturer.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = settings::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port_path = Some(port);
    }
    if args.no_switching {
        config.enable_dynamic_port_switching = false;
    }

    let store = store::JsonLinesStore::open(&args.out)
        .await
        .with_context(|| format!("opening output directory {}", args.out.display()))?;

    let manager = ConnectionManager::spawn(
        config,
        Arc::new(SystemSerial),
        Arc::new(store),
        Arc::new(TracingSink),
    )
    .context("invalid configuration")?;
    manager.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) => {
                    if !handle_input(&manager, parse_input(&line)).await? {
                        break;
                    }
                }
                // Detached from a terminal; keep running until Ctrl-C
                None => stdin_open = false,
            },
        }
    }

    manager.close().await?;
    Ok(())
}

/// Apply one operator command; `false` means stop
async fn handle_input(manager: &ConnectionManager, input: Input) -> Result<bool> {
    match input {
        Input::Status => {
            let status = manager.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Input::Reconnect => manager.force_reconnect()?,
        Input::Disconnect => manager.disconnect().await?,
        Input::Connect => manager.connect()?,
        Input::Scan => manager.scan_for_better_ports().await?,
        Input::Switching(enabled) => manager.set_dynamic_port_switching(enabled)?,
        Input::Quit => return Ok(false),
        Input::Send(payload) => manager.send_data(payload)?,
        Input::Empty => {}
        Input::Unknown(line) => eprintln!(
            "Unknown command: {line} (try /status, /reconnect, /disconnect, /connect, /scan, /switching on|off, /quit)"
        ),
    }
    Ok(true)
}
