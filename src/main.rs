use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use devgate::{Config, Gateway};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(version, about = "WebSocket gateway for embedded devices")]
struct Cli {
    /// Config file; defaults to devgate.toml in the user config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `bind_addr` from the config
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> devgate::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::new()?,
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let listener = TcpListener::bind(config.bind_addr).await?;
    let gateway = Gateway::new(config);
    gateway.serve(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("could not listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("shutting down http server");
}
