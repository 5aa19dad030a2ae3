use async_trait::async_trait;
use disco_ipfs::client::{FilesApi, IpfsClient, WriteOpts};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{walk_tree, FileInfo, FileWriter, Reader, StorageDriver};
use crate::filewriter::PipeFileWriter;
use crate::helpers::fix_upload_path;
use crate::Error;

const DRIVER_NAME: &str = "ipfs";

const WRITE_PIPE_CAPACITY: usize = 64 * 1024;

/// The primary storage driver, keeping registry content in IPFS MFS.
///
/// Every incoming path is first rewritten by [fix_upload_path], so upload
/// session state lands under a flat uploads directory and routes by upload
/// UUID.
#[derive(Clone)]
pub struct IpfsDriver {
    client: Arc<dyn IpfsClient>,
}

impl IpfsDriver {
    pub fn new(client: Arc<dyn IpfsClient>) -> Self {
        IpfsDriver { client }
    }
}

#[async_trait]
impl StorageDriver for IpfsDriver {
    fn name(&self) -> String {
        DRIVER_NAME.to_owned()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, Error> {
        let mut reader = self.reader(path, 0).await?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| Error::StorageError(format!("failed to read {}: {}", path, e)))?;
        Ok(content)
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        let path = fix_upload_path(path);
        self.client
            .files_write(
                &path,
                Box::new(std::io::Cursor::new(content.to_vec())),
                WriteOpts {
                    truncate: true,
                    ..WriteOpts::create_with_parents()
                },
            )
            .await
            .map_err(|e| Error::from_ipfs(&path, e))
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Reader, Error> {
        let path = fix_upload_path(path);
        self.client
            .files_read(&path, offset)
            .await
            .map_err(|e| Error::from_ipfs(&path, e))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, Error> {
        let path = fix_upload_path(path);
        let mut opts = WriteOpts::create_with_parents();
        let mut offset = 0;
        if append {
            let stat = self
                .client
                .files_stat(&path)
                .await
                .map_err(|e| Error::from_ipfs(&path, e))?;
            offset = stat.size;
            opts.offset = Some(offset);
        }

        let (writer, reader) = tokio::io::duplex(WRITE_PIPE_CAPACITY);
        let client = self.client.clone();
        let write_path = path.clone();
        let task = tokio::spawn(async move {
            client
                .files_write(&write_path, Box::new(reader), opts)
                .await
                .map_err(|e| Error::from_ipfs(&write_path, e))
        });
        debug!(path, append, "opened mfs writer");
        Ok(Box::new(PipeFileWriter::new(writer, task, offset)))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        let path = fix_upload_path(path);
        let stat = self
            .client
            .files_stat(&path)
            .await
            .map_err(|e| Error::from_ipfs(&path, e))?;
        let is_dir = stat.is_dir();
        Ok(FileInfo {
            // directories report their cumulative size, so presence checks
            // can tell a populated repository from an empty shell
            size: if is_dir { stat.cumulative_size } else { stat.size },
            path,
            modified: None,
            is_dir,
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        let path = fix_upload_path(path);
        let entries = self
            .client
            .files_ls(&path)
            .await
            .map_err(|e| Error::from_ipfs(&path, e))?;
        Ok(entries
            .into_iter()
            .map(|entry| format!("{}/{}", path.trim_end_matches('/'), entry.name))
            .collect())
    }

    async fn mv(&self, from: &str, to: &str) -> Result<(), Error> {
        let from = fix_upload_path(from);
        let to = fix_upload_path(to);
        if let Some(idx) = to.rfind('/') {
            self.client
                .files_mkdir(&to[..idx.max(1)], true)
                .await
                .map_err(|e| Error::from_ipfs(&to, e))?;
        }
        self.client
            .files_mv(&from, &to)
            .await
            .map_err(|e| Error::from_ipfs(&from, e))
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let path = fix_upload_path(path);
        self.client
            .files_rm(&path, true)
            .await
            .map_err(|e| Error::from_ipfs(&path, e))
    }

    async fn url_for(&self, _path: &str, _method: &str) -> Result<String, Error> {
        Err(Error::UnsupportedMethod)
    }

    fn walk<'a>(&'a self, path: &'a str) -> BoxStream<'a, Result<FileInfo, Error>> {
        walk_tree(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disco_ipfs::client::MemoryClient;
    use futures::TryStreamExt;
    use tokio::io::AsyncWriteExt;

    fn driver_over_memory() -> (IpfsDriver, MemoryClient) {
        let client = MemoryClient::new();
        (IpfsDriver::new(Arc::new(client.clone())), client)
    }

    #[tokio::test]
    async fn put_and_get_content() {
        let (driver, _) = driver_over_memory();
        driver
            .put_content("/docker/registry/v2/blobs/sha256/aa/aabb/data", b"blob bytes")
            .await
            .unwrap();
        let content = driver
            .get_content("/docker/registry/v2/blobs/sha256/aa/aabb/data")
            .await
            .unwrap();
        assert_eq!(b"blob bytes".to_vec(), content);
    }

    #[tokio::test]
    async fn reader_maps_missing_paths() {
        let (driver, _) = driver_over_memory();
        let result = driver.reader("/docker/registry/v2/blobs/sha256/aa/aabb/data", 0)
            .await;
        let err = match result {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn writer_streams_into_mfs() {
        let (driver, client) = driver_over_memory();
        let mut writer = driver
            .writer("/docker/registry/v2/uploads/3f8f2b67/data", false)
            .await
            .unwrap();
        writer.write_all(b"first ").await.unwrap();
        writer.write_all(b"second").await.unwrap();
        assert_eq!(12, writer.size());
        writer.commit().await.unwrap();

        assert_eq!(
            Some(b"first second".to_vec()),
            client.file_content("/docker/registry/v2/uploads/3f8f2b67/data")
        );
    }

    #[tokio::test]
    async fn writer_appends_at_existing_size() {
        let (driver, client) = driver_over_memory();
        driver
            .put_content("/docker/registry/v2/uploads/3f8f2b67/data", b"head")
            .await
            .unwrap();

        let mut writer = driver
            .writer("/docker/registry/v2/uploads/3f8f2b67/data", true)
            .await
            .unwrap();
        assert_eq!(4, writer.size());
        writer.write_all(b"-tail").await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(
            Some(b"head-tail".to_vec()),
            client.file_content("/docker/registry/v2/uploads/3f8f2b67/data")
        );
    }

    #[tokio::test]
    async fn upload_paths_are_rewritten() {
        let (driver, client) = driver_over_memory();
        driver
            .put_content(
                "/docker/registry/v2/repositories/myrepo/_uploads/3f8f2b67/data",
                b"session",
            )
            .await
            .unwrap();
        assert!(client.contains("/docker/registry/v2/uploads/3f8f2b67/data"));
        assert!(!client.contains("/docker/registry/v2/repositories/myrepo/_uploads/3f8f2b67/data"));
    }

    #[tokio::test]
    async fn stat_reports_cumulative_size_for_directories() {
        let (driver, client) = driver_over_memory();
        client.put_file(
            "/docker/registry/v2/repositories/myrepo/_manifests/tags/latest/current/link",
            b"sha256:abc".to_vec(),
        );

        let info = driver
            .stat("/docker/registry/v2/repositories/myrepo")
            .await
            .unwrap();
        assert!(info.is_dir);
        assert!(info.size > 0);
    }

    #[tokio::test]
    async fn list_returns_absolute_child_paths() {
        let (driver, client) = driver_over_memory();
        client.put_file("/docker/registry/v2/repositories/myrepo/disco.json", b"{}".to_vec());
        client.put_file("/docker/registry/v2/repositories/myrepo/extra", b"x".to_vec());

        let children = driver
            .list("/docker/registry/v2/repositories/myrepo")
            .await
            .unwrap();
        assert_eq!(
            vec![
                "/docker/registry/v2/repositories/myrepo/disco.json".to_owned(),
                "/docker/registry/v2/repositories/myrepo/extra".to_owned(),
            ],
            children
        );
    }

    #[tokio::test]
    async fn walk_yields_files_recursively() {
        let (driver, client) = driver_over_memory();
        client.put_file("/docker/registry/v2/repositories/myrepo/a/b", b"1".to_vec());
        client.put_file("/docker/registry/v2/repositories/myrepo/c", b"2".to_vec());

        let mut files: Vec<String> = driver
            .walk("/docker/registry/v2/repositories/myrepo")
            .try_collect::<Vec<FileInfo>>()
            .await
            .unwrap()
            .into_iter()
            .filter(|info| !info.is_dir)
            .map(|info| info.path)
            .collect();
        files.sort();
        assert_eq!(
            vec![
                "/docker/registry/v2/repositories/myrepo/a/b".to_owned(),
                "/docker/registry/v2/repositories/myrepo/c".to_owned(),
            ],
            files
        );
    }

    #[tokio::test]
    async fn mv_creates_destination_parent() {
        let (driver, client) = driver_over_memory();
        driver
            .put_content("/docker/registry/v2/uploads/3f8f2b67/data", b"x")
            .await
            .unwrap();
        driver
            .mv(
                "/docker/registry/v2/uploads/3f8f2b67/data",
                "/docker/registry/v2/blobs/sha256/aa/aabb/data",
            )
            .await
            .unwrap();
        assert!(client.contains("/docker/registry/v2/blobs/sha256/aa/aabb/data"));
        assert!(!client.contains("/docker/registry/v2/uploads/3f8f2b67/data"));
    }
}
