//! The Files (MFS) API surface Disco needs from an IPFS node, with one
//! implementation per deployment shape: a single node over its HTTP RPC API,
//! a router-backed client multiplexing several nodes, and an in-memory
//! implementation for tests.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;

mod http;
mod memory;
mod router;
mod routed;

pub use self::http::HttpClient;
pub use self::memory::MemoryClient;
pub use self::routed::RoutedClient;
pub use self::router::Router;

use crate::Error;

/// A byte stream handed out by [FilesApi::files_read].
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Options for [FilesApi::files_write].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOpts {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Create intermediate directories.
    pub parents: bool,
    /// Truncate the file before writing.
    pub truncate: bool,
    /// Byte offset to start writing at.
    pub offset: Option<u64>,
}

impl WriteOpts {
    /// The options used for fresh file writes.
    pub fn create_with_parents() -> Self {
        WriteOpts {
            create: true,
            parents: true,
            ..Default::default()
        }
    }
}

/// The result of a `files stat` call.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileStat {
    /// The CID of the file or directory, in the node's preferred encoding
    /// (base58 CID v0 on stock Kubo).
    #[serde(rename = "Hash")]
    pub hash: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "CumulativeSize", default)]
    pub cumulative_size: u64,
    #[serde(rename = "Type", default)]
    pub node_type: String,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.node_type == "directory"
    }
}

/// A single `files ls` entry.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LsEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub entry_type: u32,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "Hash", default)]
    pub hash: String,
}

/// The subset of the IPFS Files API Disco drives against a single node.
#[async_trait]
pub trait FilesApi: Send + Sync {
    /// Streams the contents of a file starting at the given offset.
    async fn files_read(&self, path: &str, offset: u64) -> Result<FileReader, Error>;

    /// Writes the reader's contents to the file at `path`.
    async fn files_write(
        &self,
        path: &str,
        data: FileReader,
        opts: WriteOpts,
    ) -> Result<(), Error>;

    /// Removes the file or directory, recursing when `force` is set.
    async fn files_rm(&self, path: &str, force: bool) -> Result<(), Error>;

    /// Copies `src` (an MFS path or an `/ipfs/<cid>` content path) to `dst`.
    async fn files_cp(&self, src: &str, dst: &str) -> Result<(), Error>;

    /// Stats a file or directory.
    async fn files_stat(&self, path: &str) -> Result<FileStat, Error>;

    /// Creates a directory, with intermediate ones when `parents` is set.
    async fn files_mkdir(&self, path: &str, parents: bool) -> Result<(), Error>;

    /// Lists the direct children of a directory.
    async fn files_ls(&self, path: &str) -> Result<Vec<LsEntry>, Error>;

    /// Renames `src` to `dst`.
    async fn files_mv(&self, src: &str, dst: &str) -> Result<(), Error>;
}

/// A [FilesApi] that can additionally resolve which node a content path
/// belongs to, so callers can pin a sequence of calls to one node.
#[async_trait]
pub trait IpfsClient: FilesApi {
    /// Returns the node client the given content path routes to.
    fn client_for(&self, path: &str) -> Result<Arc<dyn FilesApi>, Error>;
}
