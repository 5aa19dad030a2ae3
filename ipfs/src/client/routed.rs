use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use super::{FileReader, FileStat, FilesApi, HttpClient, IpfsClient, LsEntry, Router, WriteOpts};
use crate::cid::{ipfs_path, is_ipfs_path};
use crate::Error;

/// A [FilesApi] that multiplexes several IPFS nodes, selecting one per call
/// through the content [Router].
pub struct RoutedClient {
    router: Router,
    nodes: Vec<Arc<dyn FilesApi>>,
}

impl RoutedClient {
    pub fn new(nodes: Vec<Arc<dyn FilesApi>>) -> Self {
        RoutedClient {
            router: Router::new(nodes.len()),
            nodes,
        }
    }

    /// Builds a routed client with one [HttpClient] per node URL.
    pub fn from_urls(urls: impl IntoIterator<Item = Url>) -> Self {
        Self::new(
            urls.into_iter()
                .map(|url| Arc::new(HttpClient::new(url)) as Arc<dyn FilesApi>)
                .collect(),
        )
    }

    fn route(&self, path: &str) -> Result<(Arc<dyn FilesApi>, usize), Error> {
        let (id, index) = self.router.route_content(path)?;
        debug!(path, content_id = %id, node_index = index, "routed client");
        Ok((self.nodes[index].clone(), index))
    }
}

#[async_trait]
impl FilesApi for RoutedClient {
    async fn files_read(&self, path: &str, offset: u64) -> Result<FileReader, Error> {
        let (node, _) = self.route(path)?;
        node.files_read(path, offset).await
    }

    async fn files_write(
        &self,
        path: &str,
        data: FileReader,
        opts: WriteOpts,
    ) -> Result<(), Error> {
        let (node, _) = self.route(path)?;
        node.files_write(path, data, opts).await
    }

    async fn files_rm(&self, path: &str, force: bool) -> Result<(), Error> {
        let (node, _) = self.route(path)?;
        node.files_rm(path, force).await
    }

    /// Copies across nodes by first resolving a non-`/ipfs/` source to its
    /// content path, so the destination node can fetch it from the network.
    async fn files_cp(&self, src: &str, dst: &str) -> Result<(), Error> {
        let src = if is_ipfs_path(src) {
            src.to_owned()
        } else {
            let stat = self.files_stat(src).await?;
            ipfs_path(&stat.hash)
        };
        let (node, _) = self.route(dst)?;
        node.files_cp(&src, dst).await
    }

    async fn files_stat(&self, path: &str) -> Result<FileStat, Error> {
        let (node, _) = self.route(path)?;
        node.files_stat(path).await
    }

    async fn files_mkdir(&self, path: &str, parents: bool) -> Result<(), Error> {
        let (node, _) = self.route(path)?;
        node.files_mkdir(path, parents).await
    }

    async fn files_ls(&self, path: &str) -> Result<Vec<LsEntry>, Error> {
        let (node, _) = self.route(path)?;
        node.files_ls(path).await
    }

    /// Same-node moves use the native rename. When the source and the
    /// destination route to different nodes, degrade to remove-copy-remove.
    #[instrument(skip(self))]
    async fn files_mv(&self, src: &str, dst: &str) -> Result<(), Error> {
        let (src_node, src_index) = self.route(src)?;
        let (_, dst_index) = self.route(dst)?;
        if src_index == dst_index {
            return src_node.files_mv(src, dst).await;
        }

        // multiplexing resulted in different nodes - clear dst, cp to dst
        // and rm from src
        let _ = self.files_rm(dst, true).await;
        self.files_cp(src, dst)
            .await
            .map_err(|e| Error::Api(format!("cp failed while doing mv alternative: {}", e)))?;
        src_node.files_rm(src, true).await
    }
}

#[async_trait]
impl IpfsClient for RoutedClient {
    fn client_for(&self, path: &str) -> Result<Arc<dyn FilesApi>, Error> {
        let (node, _) = self.route(path)?;
        Ok(node)
    }
}
