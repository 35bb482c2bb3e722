//! The waygate binary: load configuration, start the gateway, serve until
//! SIGINT or `POST /close`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use waygate::http;
use waygate::{GatewayConfig, GatewayResult, GatewayServer};

#[derive(Debug, Parser)]
#[command(name = "waygate", version, about = "MCP protocol gateway")]
struct Args {
    /// Path to the gateway configuration file (JSON)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// API key protecting every endpoint except /health
    #[arg(long, env = "WAYGATE_API_KEY", value_name = "KEY")]
    api_key: Option<String>,

    /// Enable DIFC policy enforcement and the built-in sys tools
    #[arg(long)]
    enable_difc: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waygate=info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "gateway failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> GatewayResult<()> {
    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if args.api_key.is_some() {
        config.api_key = args.api_key;
    }
    if args.enable_difc {
        config.enable_difc = true;
    }

    let server = Arc::new(GatewayServer::new(config));
    server.register_backends().await;
    http::serve(server).await
}
