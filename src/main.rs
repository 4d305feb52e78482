// Lapse Cam server binary

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use lapse_cam_lib::config::{resolve_config_path, ConfigStore};
use lapse_cam_lib::control::server;
use lapse_cam_lib::logging::{self, Logger};
use lapse_cam_lib::App;

#[derive(Parser)]
#[command(name = "lapse-cam")]
#[command(about = "Lapse Cam - time-lapse camera appliance server", long_about = None)]
#[command(version)]
struct Args {
    /// Settings file (KEY=VALUE)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to bind; the port comes from PORT in the settings file
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let path = resolve_config_path(args.config);
    let store = ConfigStore::load_or_init(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;

    let settings = store.snapshot();
    logging::init(&settings.log_level, settings.debug_mode);
    let log = Logger::new("main");
    log.info("starting", &[("config", &path.display()), ("version", &env!("CARGO_PKG_VERSION"))]);

    let addr: SocketAddr = format!("{}:{}", args.bind, settings.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.bind, settings.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    let app = tokio::task::spawn_blocking(move || App::init(store)).await??;

    let served = server::serve(app.state.clone(), listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    log.info("shutting down", &[]);
    tokio::task::spawn_blocking(move || app.shutdown()).await?;
    served
}
