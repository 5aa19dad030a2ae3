//! The storage driver contract and its implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};

mod filesystem;
mod from_config;
mod ipfs;
mod memory;
mod multi;

pub use self::filesystem::FilesystemDriver;
pub use self::from_config::{from_config, DriverConfig};
pub use self::ipfs::IpfsDriver;
pub use self::memory::MemoryDriver;
pub use self::multi::{Multi, MultiDriver};

use crate::Error;

/// A byte stream handed out by [StorageDriver::reader].
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata for a stored file or directory.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

/// A streaming writer for a single content path. Writes are buffered or
/// relayed by the backend until [FileWriter::commit] makes them durable.
#[async_trait]
pub trait FileWriter: AsyncWrite + Send + Unpin {
    /// The number of bytes written so far, including a pre-existing prefix
    /// when appending.
    fn size(&self) -> u64;

    /// Flushes and finalizes the content. No writes may follow.
    async fn commit(&mut self) -> Result<(), Error>;

    /// Abandons the write. Backends may keep partially written data.
    async fn cancel(&mut self) -> Result<(), Error>;
}

/// The storage driver contract the registry operates against, mirroring the
/// distribution storage driver interface.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// A short name identifying the backend in logs and error contexts.
    fn name(&self) -> String;

    /// Reads the full contents at `path`. Intended for small objects.
    async fn get_content(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// Replaces the contents at `path`. Intended for small objects.
    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), Error>;

    /// Opens a streaming reader at the given byte offset.
    async fn reader(&self, path: &str, offset: u64) -> Result<Reader, Error>;

    /// Opens a streaming writer. With `append`, continues a previous write.
    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, Error>;

    /// Stats the file or directory at `path`.
    async fn stat(&self, path: &str) -> Result<FileInfo, Error>;

    /// Lists the absolute paths of the direct children of `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Moves the object at `from` to `to`.
    async fn mv(&self, from: &str, to: &str) -> Result<(), Error>;

    /// Recursively deletes `path`.
    async fn delete(&self, path: &str) -> Result<(), Error>;

    /// Returns a URL the content can be fetched from directly, when the
    /// backend supports it.
    async fn url_for(&self, path: &str, method: &str) -> Result<String, Error>;

    /// Traverses the tree under `path`, yielding every descendant. The
    /// root itself is not yielded.
    fn walk<'a>(&'a self, path: &'a str) -> BoxStream<'a, Result<FileInfo, Error>>;
}

/// Breadth-first traversal over [StorageDriver::list] and
/// [StorageDriver::stat], for backends without a native walk.
pub(crate) fn walk_tree<'a>(
    driver: &'a dyn StorageDriver,
    path: &'a str,
) -> BoxStream<'a, Result<FileInfo, Error>> {
    Box::pin(async_stream::try_stream! {
        let mut worklist: VecDeque<String> = VecDeque::from([path.to_owned()]);
        while let Some(dir) = worklist.pop_front() {
            for child in driver.list(&dir).await? {
                let info = driver.stat(&child).await?;
                let is_dir = info.is_dir;
                yield info;
                if is_dir {
                    worklist.push_back(child);
                }
            }
        }
    })
}
