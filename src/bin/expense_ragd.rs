//! expense-ragd - Document indexing and semantic search daemon
//!
//! Usage:
//!   expense-ragd [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Path to configuration file (default: config.toml)
//!   --host <HOST>        API server host (overrides config)
//!   --port <PORT>        API server port (overrides config)

use expense_rag::api::{start_server, AppState};
use expense_rag::{Service, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug)]
struct DaemonArgs {
    config_path: PathBuf,
    host: Option<String>,
    port: Option<u16>,
}

impl Default for DaemonArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            host: None,
            port: None,
        }
    }
}

fn parse_args() -> DaemonArgs {
    let mut parsed = DaemonArgs::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = args.next() {
                    parsed.config_path = PathBuf::from(path);
                }
            }
            "--host" => {
                parsed.host = args.next();
            }
            "--port" => {
                if let Some(port) = args.next() {
                    if let Ok(p) = port.parse() {
                        parsed.port = Some(p);
                    }
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
    }

    parsed
}

fn print_help() {
    println!("expense-ragd - Document indexing and semantic search daemon");
    println!();
    println!("USAGE:");
    println!("    expense-ragd [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>      Path to configuration file (default: config.toml)");
    println!("    --host <HOST>        API server host (overrides config)");
    println!("    --port <PORT>        API server port (overrides config)");
    println!("    --help, -h           Print this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();

    let mut config = if args.config_path.exists() {
        info!("Loading configuration from {}", args.config_path.display());
        ServiceConfig::from_file(&args.config_path)?
    } else {
        info!("No config file found, using defaults");
        ServiceConfig::default()
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let host = config.server.host.clone();
    let port = config.server.port;

    let service = Arc::new(Service::new(config).await?);
    service.start().await;

    let state = AppState {
        service: Arc::clone(&service),
    };

    let server = tokio::spawn(async move { start_server(state, &host, port).await });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    service.shutdown(Duration::from_secs(30)).await;
    server.abort();

    Ok(())
}
