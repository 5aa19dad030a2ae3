use async_trait::async_trait;
use futures::stream::BoxStream;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use super::{walk_tree, FileInfo, FileWriter, Reader, StorageDriver};
use crate::Error;

const DRIVER_NAME: &str = "filesystem";

/// A storage driver over a local directory, usable as the secondary cache
/// backend. Content paths map directly onto the directory tree under the
/// configured root.
#[derive(Clone)]
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub async fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(FilesystemDriver { root })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn map_io(path: &str, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::PathNotFound {
                path: path.to_owned(),
            }
        } else {
            Error::StorageError(format!("{}: {}", path, err))
        }
    }

    async fn ensure_parent(&self, path: &str) -> Result<(), Error> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io(path, e))?;
        }
        Ok(())
    }
}

/// The summed byte size of every file under `path`. Directory stats report
/// this so presence checks see the same size semantics as on the other
/// backends.
async fn dir_size(path: &std::path::Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut worklist = vec![path.to_path_buf()];
    while let Some(dir) = worklist.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                worklist.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn name(&self) -> String {
        DRIVER_NAME.to_owned()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, Error> {
        tokio::fs::read(self.full_path(path))
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        self.ensure_parent(path).await?;
        tokio::fs::write(self.full_path(path), content)
            .await
            .map_err(|e| Self::map_io(path, e))
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Reader, Error> {
        let mut file = tokio::fs::File::open(self.full_path(path))
            .await
            .map_err(|e| Self::map_io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, Error> {
        self.ensure_parent(path).await?;
        let full = self.full_path(path);
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = options
            .open(&full)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        let size = if append {
            file.metadata()
                .await
                .map_err(|e| Self::map_io(path, e))?
                .len()
        } else {
            0
        };
        Ok(Box::new(FsFileWriter {
            file: Some(file),
            full_path: full,
            size,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        let full = self.full_path(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        let size = if meta.is_dir() {
            dir_size(&full).await.map_err(|e| Self::map_io(path, e))?
        } else {
            meta.len()
        };
        Ok(FileInfo {
            path: path.to_owned(),
            size,
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        let mut dir = tokio::fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| Self::map_io(path, e))?;
        let mut children = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| Self::map_io(path, e))? {
            children.push(format!(
                "{}/{}",
                path.trim_end_matches('/'),
                entry.file_name().to_string_lossy()
            ));
        }
        children.sort();
        Ok(children)
    }

    async fn mv(&self, from: &str, to: &str) -> Result<(), Error> {
        self.ensure_parent(to).await?;
        tokio::fs::rename(self.full_path(from), self.full_path(to))
            .await
            .map_err(|e| Self::map_io(from, e))
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let full = self.full_path(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&full)
                .await
                .map_err(|e| Self::map_io(path, e))
        } else {
            tokio::fs::remove_file(&full)
                .await
                .map_err(|e| Self::map_io(path, e))
        }
    }

    async fn url_for(&self, _path: &str, _method: &str) -> Result<String, Error> {
        Err(Error::UnsupportedMethod)
    }

    fn walk<'a>(&'a self, path: &'a str) -> BoxStream<'a, Result<FileInfo, Error>> {
        walk_tree(self, path)
    }
}

struct FsFileWriter {
    file: Option<tokio::fs::File>,
    full_path: PathBuf,
    size: u64,
}

impl AsyncWrite for FsFileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "already closed",
            )));
        };
        match Pin::new(file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.size += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl FileWriter for FsFileWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<(), Error> {
        match self.file.take() {
            Some(mut file) => {
                file.flush()
                    .await
                    .map_err(|e| Error::StorageError(format!("failed to flush: {}", e)))?;
                file.sync_all()
                    .await
                    .map_err(|e| Error::StorageError(format!("failed to sync: {}", e)))?;
                Ok(())
            }
            None => Err(Error::StorageError("already closed".to_owned())),
        }
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        if self.file.take().is_some() {
            let _ = tokio::fs::remove_file(&self.full_path).await;
        }
        Ok(())
    }
}
