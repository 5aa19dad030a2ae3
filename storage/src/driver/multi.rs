use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tracing::{debug, info, instrument};
use url::Url;

use super::{FileInfo, FileWriter, Reader, StorageDriver};
use crate::Error;

/// The capability surface of the composed driver: the base contract plus
/// the two directional replication operations. Callers that need
/// replication hold this trait object, so no downcasting happens anywhere.
#[async_trait]
pub trait MultiDriver: StorageDriver {
    /// Ensures the content at `path` is present in the primary, copying
    /// from the secondary when needed. Returns the primary's stat.
    async fn replicate_in_primary(&self, path: &str) -> Result<FileInfo, Error>;

    /// Ensures the content at `path` is present in the secondary, copying
    /// from the primary when needed. Returns the secondary's stat.
    async fn replicate_in_secondary(&self, path: &str) -> Result<FileInfo, Error>;
}

/// A storage driver composed of a primary and an optional secondary.
///
/// Writes land on both backends, reads are served from the secondary after
/// replicating into it, and the secondary's absence turns the whole thing
/// into a transparent wrapper around the primary.
pub struct Multi {
    redirect_to: Option<Url>,
    primary: Arc<dyn StorageDriver>,
    secondary: Option<Arc<dyn StorageDriver>>,
}

impl Multi {
    pub fn new(
        redirect_to: Option<Url>,
        primary: Arc<dyn StorageDriver>,
        secondary: Option<Arc<dyn StorageDriver>>,
    ) -> Self {
        Multi {
            redirect_to,
            primary,
            secondary,
        }
    }
}

/// Copies whatever lives at `path` in `src` to the same path in `dst`,
/// unless it is already there. Directories are walked and copied file by
/// file. A missing source propagates as the original not-found error.
async fn replicate(
    src: Arc<dyn StorageDriver>,
    dst: Arc<dyn StorageDriver>,
    path: String,
) -> Result<(), Error> {
    match dst.stat(&path).await {
        // already exists in the destination - nothing to do
        Ok(_) => return Ok(()),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(Error::StorageError(format!(
                "failed to check in '{}' before replication: {}",
                dst.name(),
                e
            )))
        }
    }

    let src_info = match src.stat(&path).await {
        Ok(info) => info,
        Err(e) if e.is_not_found() => return Err(e),
        Err(e) => {
            return Err(Error::StorageError(format!(
                "failed to check in '{}' before replication: {}",
                src.name(),
                e
            )))
        }
    };

    if !src_info.is_dir {
        return copy_file(&*src, &*dst, &path).await;
    }

    let mut walk = src.walk(&path);
    while let Some(info) = walk.try_next().await? {
        if info.is_dir {
            continue;
        }
        copy_file(&*src, &*dst, &info.path).await?;
    }
    Ok(())
}

async fn copy_file(
    src: &dyn StorageDriver,
    dst: &dyn StorageDriver,
    path: &str,
) -> Result<(), Error> {
    let mut reader = src.reader(path, 0).await?;
    let mut writer = dst.writer(path, false).await.map_err(|e| {
        Error::StorageError(format!("failed to create the '{}' writer: {}", dst.name(), e))
    })?;
    let bytes = tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(|e| {
            Error::StorageError(format!(
                "failed to copy from '{}' to '{}': {}",
                src.name(),
                dst.name(),
                e
            ))
        })?;
    if let Err(e) = writer.commit().await {
        let _ = writer.cancel().await;
        return Err(Error::StorageError(format!(
            "failed to commit '{}' writer: {}",
            dst.name(),
            e
        )));
    }
    debug!(bytes, path, src = %src.name(), dst = %dst.name(), "finished replicating");
    Ok(())
}

#[async_trait]
impl MultiDriver for Multi {
    #[instrument(skip(self))]
    async fn replicate_in_primary(&self, path: &str) -> Result<FileInfo, Error> {
        let Some(secondary) = self.secondary.clone() else {
            return self.primary.stat(path).await;
        };
        // replication survives the caller's cancellation
        let primary = self.primary.clone();
        let content_path = path.to_owned();
        tokio::spawn(replicate(secondary, primary, content_path)).await??;
        self.primary.stat(path).await
    }

    #[instrument(skip(self))]
    async fn replicate_in_secondary(&self, path: &str) -> Result<FileInfo, Error> {
        let Some(secondary) = self.secondary.clone() else {
            return self.primary.stat(path).await;
        };
        let primary = self.primary.clone();
        let content_path = path.to_owned();
        tokio::spawn(replicate(primary, secondary.clone(), content_path)).await??;
        secondary.stat(path).await
    }
}

#[async_trait]
impl StorageDriver for Multi {
    fn name(&self) -> String {
        match &self.secondary {
            Some(secondary) => format!("{}+{}", self.primary.name(), secondary.name()),
            None => self.primary.name(),
        }
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.replicate_in_secondary(path).await?;
        self.read_side().get_content(path).await
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        self.primary
            .put_content(path, content)
            .await
            .map_err(|e| Error::StorageError(format!("put_content primary: {}", e)))?;
        if let Some(secondary) = &self.secondary {
            secondary
                .put_content(path, content)
                .await
                .map_err(|e| Error::StorageError(format!("put_content secondary: {}", e)))?;
        }
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Reader, Error> {
        self.replicate_in_secondary(path).await?;
        self.read_side().reader(path, offset).await
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, Error> {
        let primary = self
            .primary
            .writer(path, append)
            .await
            .map_err(|e| Error::StorageError(format!("writer primary: {}", e)))?;
        let Some(secondary) = &self.secondary else {
            return Ok(primary);
        };
        let secondary = secondary
            .writer(path, append)
            .await
            .map_err(|e| Error::StorageError(format!("writer secondary: {}", e)))?;
        Ok(Box::new(MultiFileWriter {
            primary,
            secondary,
            state: WriteState::Idle,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        self.replicate_in_secondary(path).await
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        self.replicate_in_secondary(path).await?;
        self.read_side().list(path).await
    }

    async fn mv(&self, from: &str, to: &str) -> Result<(), Error> {
        // no replication - writes preceding a move already did it
        self.primary
            .mv(from, to)
            .await
            .map_err(|e| Error::StorageError(format!("mv primary: {}", e)))?;
        if let Some(secondary) = &self.secondary {
            secondary
                .mv(from, to)
                .await
                .map_err(|e| Error::StorageError(format!("mv secondary: {}", e)))?;
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        self.primary
            .delete(path)
            .await
            .map_err(|e| Error::StorageError(format!("delete primary: {}", e)))?;
        if let Some(secondary) = &self.secondary {
            secondary
                .delete(path)
                .await
                .map_err(|e| Error::StorageError(format!("delete secondary: {}", e)))?;
        }
        Ok(())
    }

    async fn url_for(&self, path: &str, method: &str) -> Result<String, Error> {
        let Some(redirect_to) = &self.redirect_to else {
            return Err(Error::UnsupportedMethod);
        };
        if method != "GET" && method != "HEAD" {
            return Err(Error::UnsupportedMethod);
        }
        let mut redirect_url = redirect_to.clone();
        let joined = format!(
            "{}/{}",
            redirect_url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        redirect_url.set_path(&joined);
        info!(redirect_url = %redirect_url, "created redirect url");
        Ok(redirect_url.to_string())
    }

    fn walk<'a>(&'a self, path: &'a str) -> BoxStream<'a, Result<FileInfo, Error>> {
        match &self.secondary {
            Some(secondary) => Box::pin(self.primary.walk(path).chain(secondary.walk(path))),
            None => self.primary.walk(path),
        }
    }
}

impl Multi {
    fn read_side(&self) -> &dyn StorageDriver {
        match &self.secondary {
            Some(secondary) => &**secondary,
            None => &*self.primary,
        }
    }
}

enum WriteState {
    Idle,
    DrainSecondary {
        pending: Vec<u8>,
        written: usize,
        primary_n: usize,
    },
}

/// Fans every chunk out to the primary first, then the secondary, before
/// reporting the write back to the caller. Size reports the primary's
/// count; close, cancel and commit propagate to both, primary first.
struct MultiFileWriter {
    primary: Box<dyn FileWriter>,
    secondary: Box<dyn FileWriter>,
    state: WriteState,
}

impl AsyncWrite for MultiFileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriteState::Idle => {
                    let n = ready!(Pin::new(&mut this.primary).poll_write(cx, buf))?;
                    this.state = WriteState::DrainSecondary {
                        pending: buf[..n].to_vec(),
                        written: 0,
                        primary_n: n,
                    };
                }
                WriteState::DrainSecondary {
                    pending,
                    written,
                    primary_n,
                } => {
                    while *written < pending.len() {
                        let n = ready!(
                            Pin::new(&mut this.secondary).poll_write(cx, &pending[*written..])
                        )?;
                        if n == 0 {
                            return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    let n = *primary_n;
                    this.state = WriteState::Idle;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.primary).poll_flush(cx))?;
        Pin::new(&mut this.secondary).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.primary).poll_shutdown(cx))?;
        Pin::new(&mut this.secondary).poll_shutdown(cx)
    }
}

#[async_trait]
impl FileWriter for MultiFileWriter {
    fn size(&self) -> u64 {
        self.primary.size()
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.primary.commit().await?;
        self.secondary.commit().await
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        self.primary.cancel().await?;
        self.secondary.cancel().await
    }
}
