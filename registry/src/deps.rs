//! Construction of the process-wide service dependencies: the routed IPFS
//! client and the composed storage driver. Built once at startup and shared
//! behind [Arc]s for the lifetime of the process.

use std::sync::Arc;
use tracing::info;

use disco_ipfs::client::{IpfsClient, RoutedClient};
use disco_storage::driver::{from_config, IpfsDriver, Multi, MultiDriver};

use crate::config::Config;

pub struct Deps {
    pub ipfs: Arc<dyn IpfsClient>,
    pub driver: Arc<dyn MultiDriver>,
}

/// Builds the dependencies the Disco service consumes.
pub async fn build(config: &Config) -> Result<Deps, disco_storage::Error> {
    let node_urls = config
        .storage
        .ipfs
        .router
        .nodes
        .iter()
        .map(|node| node.url.clone());
    let ipfs: Arc<dyn IpfsClient> = Arc::new(RoutedClient::from_urls(node_urls));
    info!(
        nodes = config.storage.ipfs.router.nodes.len(),
        "running with ipfs router client"
    );

    let primary = Arc::new(IpfsDriver::new(ipfs.clone()));
    let secondary = match &config.storage.ipfs.cache {
        Some(cache) => Some(from_config(cache).await?),
        None => None,
    };
    let driver = Arc::new(Multi::new(
        config.storage.ipfs.redirect.clone(),
        primary,
        secondary,
    ));

    Ok(Deps { ipfs, driver })
}
