use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

use super::{walk_tree, FileInfo, FileWriter, Reader, StorageDriver};
use crate::Error;

const DRIVER_NAME: &str = "inmemory";

type Files = Arc<RwLock<BTreeMap<String, Vec<u8>>>>;

/// An in-memory storage driver. Directories exist implicitly as path
/// prefixes, the way object stores behave.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    files: Files,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.read().unwrap().contains_key(path)
    }
}

fn child_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> String {
        DRIVER_NAME.to_owned()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.files
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::PathNotFound {
                path: path.to_owned(),
            })
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        self.files
            .write()
            .unwrap()
            .insert(path.to_owned(), content.to_vec());
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Reader, Error> {
        let content = self.get_content(path).await?;
        let start = (offset as usize).min(content.len());
        Ok(Box::new(std::io::Cursor::new(content[start..].to_vec())))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, Error> {
        let buf = if append {
            self.get_content(path).await?
        } else {
            Vec::new()
        };
        Ok(Box::new(MemoryFileWriter {
            files: self.files.clone(),
            path: path.to_owned(),
            buf: Some(buf),
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        let files = self.files.read().unwrap();
        if let Some(content) = files.get(path) {
            return Ok(FileInfo {
                path: path.to_owned(),
                size: content.len() as u64,
                modified: None,
                is_dir: false,
            });
        }
        let prefix = child_prefix(path);
        let size: u64 = files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(_, content)| content.len() as u64)
            .sum();
        if size == 0 && !files.keys().any(|p| p.starts_with(&prefix)) {
            return Err(Error::PathNotFound {
                path: path.to_owned(),
            });
        }
        Ok(FileInfo {
            path: path.to_owned(),
            size,
            modified: None,
            is_dir: true,
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        let files = self.files.read().unwrap();
        let prefix = child_prefix(path);
        let mut children = BTreeSet::new();
        for p in files.keys().filter(|p| p.starts_with(&prefix)) {
            let rest = &p[prefix.len()..];
            let child = match rest.find('/') {
                Some(idx) => &rest[..idx],
                None => rest,
            };
            children.insert(format!("{}{}", prefix, child));
        }
        if children.is_empty() && !files.contains_key(path) {
            return Err(Error::PathNotFound {
                path: path.to_owned(),
            });
        }
        Ok(children.into_iter().collect())
    }

    async fn mv(&self, from: &str, to: &str) -> Result<(), Error> {
        let mut files = self.files.write().unwrap();
        if let Some(content) = files.remove(from) {
            files.insert(to.to_owned(), content);
            return Ok(());
        }
        let prefix = child_prefix(from);
        let moved: Vec<String> = files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(Error::PathNotFound {
                path: from.to_owned(),
            });
        }
        for p in moved {
            let content = files.remove(&p).expect("key listed above");
            files.insert(format!("{}{}", to, &p[from.len()..]), content);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let mut files = self.files.write().unwrap();
        let prefix = child_prefix(path);
        let before = files.len();
        files.retain(|p, _| p != path && !p.starts_with(&prefix));
        if files.len() == before {
            return Err(Error::PathNotFound {
                path: path.to_owned(),
            });
        }
        Ok(())
    }

    async fn url_for(&self, _path: &str, _method: &str) -> Result<String, Error> {
        Err(Error::UnsupportedMethod)
    }

    fn walk<'a>(&'a self, path: &'a str) -> BoxStream<'a, Result<FileInfo, Error>> {
        walk_tree(self, path)
    }
}

struct MemoryFileWriter {
    files: Files,
    path: String,
    /// None once committed or cancelled.
    buf: Option<Vec<u8>>,
}

impl AsyncWrite for MemoryFileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut().buf.as_mut() {
            Some(content) => {
                content.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            None => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "already closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl FileWriter for MemoryFileWriter {
    fn size(&self) -> u64 {
        self.buf.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }

    async fn commit(&mut self) -> Result<(), Error> {
        match self.buf.take() {
            Some(content) => {
                self.files
                    .write()
                    .unwrap()
                    .insert(self.path.clone(), content);
                Ok(())
            }
            None => Err(Error::StorageError("already closed".to_owned())),
        }
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        self.buf = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn stat_distinguishes_files_and_directories() {
        let driver = MemoryDriver::new();
        driver.put_content("/dir/file", b"12345").await.unwrap();

        let file = driver.stat("/dir/file").await.unwrap();
        assert!(!file.is_dir);
        assert_eq!(5, file.size);

        let dir = driver.stat("/dir").await.unwrap();
        assert!(dir.is_dir);
        assert_eq!(5, dir.size);

        assert!(driver.stat("/absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn writer_commits_buffered_content() {
        let driver = MemoryDriver::new();
        let mut writer = driver.writer("/file", false).await.unwrap();
        writer.write_all(b"content").await.unwrap();
        assert_eq!(7, writer.size());
        writer.commit().await.unwrap();
        assert_eq!(b"content".to_vec(), driver.get_content("/file").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_discards_content() {
        let driver = MemoryDriver::new();
        let mut writer = driver.writer("/file", false).await.unwrap();
        writer.write_all(b"content").await.unwrap();
        writer.cancel().await.unwrap();
        assert!(!driver.contains("/file"));
    }

    #[tokio::test]
    async fn list_returns_direct_children() {
        let driver = MemoryDriver::new();
        driver.put_content("/dir/a", b"1").await.unwrap();
        driver.put_content("/dir/sub/b", b"2").await.unwrap();

        assert_eq!(
            vec!["/dir/a".to_owned(), "/dir/sub".to_owned()],
            driver.list("/dir").await.unwrap()
        );
    }
}
