use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::driver::FileWriter;
use crate::Error;

use async_trait::async_trait;

/// Bridges the driver's writer contract to backends that consume a reader.
///
/// Bytes written here flow through an in-memory pipe to a background task
/// that owns the actual store call (e.g. an MFS `files write` with a
/// streamed body). Shutting down the write side signals end-of-stream; the
/// task's outcome is captured and returned from commit and cancel, also on
/// repeated calls.
pub struct PipeFileWriter {
    writer: Option<DuplexStream>,
    task: Option<JoinHandle<Result<(), Error>>>,
    size: u64,
    outcome: Option<Result<(), String>>,
}

impl PipeFileWriter {
    /// `initial_size` accounts for a pre-existing prefix when appending.
    pub fn new(
        writer: DuplexStream,
        task: JoinHandle<Result<(), Error>>,
        initial_size: u64,
    ) -> Self {
        PipeFileWriter {
            writer: Some(writer),
            task: Some(task),
            size: initial_size,
            outcome: None,
        }
    }

    async fn finish(&mut self) -> Result<(), Error> {
        match self.writer.take() {
            Some(mut writer) => {
                let _ = writer.shutdown().await;
                drop(writer);
                let task = self.task.take().expect("task is taken with the writer");
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::from(e)),
                };
                debug!(size = self.size, ok = result.is_ok(), "pipe writer done");
                self.outcome = Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                result
            }
            None => match self.outcome.as_ref() {
                Some(Ok(())) => Ok(()),
                Some(Err(msg)) => Err(Error::StorageError(msg.clone())),
                None => Err(Error::StorageError("writer already closed".to_owned())),
            },
        }
    }
}

impl AsyncWrite for PipeFileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        let Some(writer) = this.writer.as_mut() else {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "writer already closed",
            )));
        };
        match Pin::new(writer).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.size += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        match this.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        match this.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl FileWriter for PipeFileWriter {
    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.finish().await
    }

    async fn cancel(&mut self) -> Result<(), Error> {
        self.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn relays_bytes_to_the_consumer_task() {
        let (w, mut r) = tokio::io::duplex(8);
        let task = tokio::spawn(async move {
            let mut consumed = Vec::new();
            r.read_to_end(&mut consumed)
                .await
                .map_err(|e| Error::StorageError(e.to_string()))?;
            assert_eq!(b"0123456789abcdef", consumed.as_slice());
            Ok(())
        });

        let mut writer = PipeFileWriter::new(w, task, 0);
        writer.write_all(b"0123456789").await.unwrap();
        writer.write_all(b"abcdef").await.unwrap();
        assert_eq!(16, FileWriter::size(&writer));

        writer.commit().await.unwrap();
        // a second commit returns the captured result
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn surfaces_consumer_failure_on_commit() {
        let (w, mut r) = tokio::io::duplex(8);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let _ = r.read_exact(&mut buf).await;
            Err(Error::StorageError("backend rejected the write".to_owned()))
        });

        let mut writer = PipeFileWriter::new(w, task, 0);
        writer.write_all(b"data").await.unwrap();
        let err = writer.commit().await.unwrap_err();
        assert!(err.to_string().contains("backend rejected"));
    }
}
