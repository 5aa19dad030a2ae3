use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use disco_registry::service::Disco;
use disco_registry::{config, deps, proxy};

/// A container registry that stores images on IPFS and makes them globally
/// addressable by manifest digest and CID.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the distribution-style registry configuration file.
    #[arg(
        long,
        env = "REGISTRY_CONFIGURATION_PATH",
        default_value = "~/.disco/config.yaml"
    )]
    registry_configuration_path: String,

    /// The user-facing port the proxy listens on.
    #[arg(long, env = "DISCO_PORT", default_value_t = 1970)]
    disco_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = config::expand_home(&cli.registry_configuration_path);
    let config = config::Config::load(&config_path)?;
    info!(config = %config_path.display(), "found configuration");

    let deps = deps::build(&config).await?;
    let disco = Arc::new(Disco::new(deps.ipfs, deps.driver, config.noclone()));

    // The embedded distribution server handles the OCI wire protocol on
    // its own address; the proxy fronts it on the Disco port.
    let app = proxy::router(disco, config.upstream_url()?);
    let listener = TcpListener::bind(("0.0.0.0", cli.disco_port)).await?;
    if let Err(e) = proxy::serve(listener, app).await {
        warn!(error = %e, "proxy stopped");
    }

    Ok(())
}
