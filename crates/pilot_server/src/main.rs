//! PILOT Server
//!
//! HTTP API server for compiling, running and resuming workflows.

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::Parser;
use pilot_runtime::Settings;
use pilot_server::{ApiServer, ServerConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pilot-server")]
#[command(about = "PILOT workflow server", long_about = None)]
struct Args {
    /// Bind address, overrides settings
    #[arg(short, long)]
    bind: Option<String>,

    /// Settings file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow cross-origin requests
    #[arg(long)]
    cors: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pilot=info,tower_http=info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }
    let config = ServerConfig {
        bind: settings.bind.clone(),
        permissive_cors: args.cors,
    };

    let server = ApiServer::new(settings).context("starting runtime")?.with_config(config);
    server.serve().await.context("serving")?;

    Ok(())
}
