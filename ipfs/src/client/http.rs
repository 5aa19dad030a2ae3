use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;
use url::Url;

use super::{FileReader, FileStat, FilesApi, IpfsClient, LsEntry, WriteOpts};
use crate::Error;

/// The error body Kubo's RPC API returns alongside non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct LsResponse {
    #[serde(rename = "Entries", default)]
    entries: Option<Vec<LsEntry>>,
}

/// A [FilesApi] client for a single IPFS node, speaking the Kubo HTTP RPC
/// API (`POST /api/v0/files/...`).
#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: Url) -> Self {
        HttpClient {
            base_url,
            http_client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, command: &str) -> Result<Url, Error> {
        self.base_url
            .join(&format!("api/v0/files/{}", command))
            .map_err(|e| Error::Api(format!("invalid api url: {}", e)))
    }

    /// Issues a files command, mapping error responses. `path` is only used
    /// to label not-found conditions.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<reqwest::Response, Error> {
        let resp = request.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let message = match resp.json::<ApiError>().await {
            Ok(body) => body.message,
            Err(_) => format!("unexpected status {}", status),
        };
        if message.contains("does not exist") {
            return Err(Error::NotFound {
                path: path.to_owned(),
            });
        }
        Err(Error::Api(message))
    }
}

#[async_trait]
impl FilesApi for HttpClient {
    async fn files_read(&self, path: &str, offset: u64) -> Result<FileReader, Error> {
        let mut url = self.endpoint("read")?;
        url.query_pairs_mut()
            .append_pair("arg", path)
            .append_pair("offset", &offset.to_string());
        let resp = self.execute(self.http_client.post(url), path).await?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.without_url()));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn files_write(
        &self,
        path: &str,
        data: FileReader,
        opts: WriteOpts,
    ) -> Result<(), Error> {
        let mut url = self.endpoint("write")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("arg", path);
            if opts.create {
                pairs.append_pair("create", "true");
            }
            if opts.parents {
                pairs.append_pair("parents", "true");
            }
            if opts.truncate {
                pairs.append_pair("truncate", "true");
            }
            if let Some(offset) = opts.offset {
                pairs.append_pair("offset", &offset.to_string());
            }
        }

        debug!(path, "files write");
        let body = reqwest::Body::wrap_stream(ReaderStream::new(data));
        let form = reqwest::multipart::Form::new()
            .part("data", reqwest::multipart::Part::stream(body).file_name("data"));
        self.execute(self.http_client.post(url).multipart(form), path)
            .await?;
        Ok(())
    }

    async fn files_rm(&self, path: &str, force: bool) -> Result<(), Error> {
        let mut url = self.endpoint("rm")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("arg", path);
            if force {
                pairs.append_pair("force", "true").append_pair("recursive", "true");
            }
        }
        self.execute(self.http_client.post(url), path).await?;
        Ok(())
    }

    async fn files_cp(&self, src: &str, dst: &str) -> Result<(), Error> {
        let mut url = self.endpoint("cp")?;
        url.query_pairs_mut()
            .append_pair("arg", src)
            .append_pair("arg", dst);
        self.execute(self.http_client.post(url), src).await?;
        Ok(())
    }

    async fn files_stat(&self, path: &str) -> Result<FileStat, Error> {
        let mut url = self.endpoint("stat")?;
        url.query_pairs_mut().append_pair("arg", path);
        let resp = self.execute(self.http_client.post(url), path).await?;
        Ok(resp.json().await?)
    }

    async fn files_mkdir(&self, path: &str, parents: bool) -> Result<(), Error> {
        let mut url = self.endpoint("mkdir")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("arg", path);
            if parents {
                pairs.append_pair("parents", "true");
            }
        }
        self.execute(self.http_client.post(url), path).await?;
        Ok(())
    }

    async fn files_ls(&self, path: &str) -> Result<Vec<LsEntry>, Error> {
        let mut url = self.endpoint("ls")?;
        url.query_pairs_mut()
            .append_pair("arg", path)
            .append_pair("long", "true");
        let resp = self.execute(self.http_client.post(url), path).await?;
        let body: LsResponse = resp.json().await?;
        Ok(body.entries.unwrap_or_default())
    }

    async fn files_mv(&self, src: &str, dst: &str) -> Result<(), Error> {
        let mut url = self.endpoint("mv")?;
        url.query_pairs_mut()
            .append_pair("arg", src)
            .append_pair("arg", dst);
        self.execute(self.http_client.post(url), src).await?;
        Ok(())
    }
}

#[async_trait]
impl IpfsClient for HttpClient {
    /// A single node serves every path.
    fn client_for(&self, _path: &str) -> Result<Arc<dyn FilesApi>, Error> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_api_path() {
        let client = HttpClient::new(Url::parse("http://localhost:5001/").unwrap());
        assert_eq!(
            "http://localhost:5001/api/v0/files/stat",
            client.endpoint("stat").unwrap().as_str()
        );
    }
}
