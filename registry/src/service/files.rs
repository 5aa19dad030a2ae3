//! Manifest, link and disco.json plumbing for the [super::Disco] service.

use disco_ipfs::cid::ipfs_path;
use disco_ipfs::client::{FilesApi, WriteOpts};
use disco_storage::driver::StorageDriver;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{tolerate_existing, Disco, Error};
use crate::paths::{blob_path, disco_file_path, repo_path, tag_path_for, REPOSITORIES_BASE};

/// The subset of an OCI image manifest Disco reads: the config blob and the
/// ordered layer blobs.
#[derive(Debug, Deserialize)]
pub(crate) struct ImageManifest {
    pub config: BlobRef,
    #[serde(default)]
    pub layers: Vec<BlobRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlobRef {
    pub digest: String,
}

/// One `{digest, cid}` pair in disco.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobCid {
    pub digest: String,
    pub cid: String,
}

/// The per-repository sidecar recording the IPFS CID of every blob, in
/// manifest order: manifest first, config second, layers after.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DiscoFile {
    pub blobs: Vec<BlobCid>,
}

impl DiscoFile {
    /// Compact JSON with a trailing newline - the canonical encoding.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = serde_json::to_vec(self)
            .map_err(|e| Error::Service(format!("failed to encode disco file: {}", e)))?;
        buf.push(b'\n');
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<DiscoFile, Error> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Service(format!("failed to decode disco file: {}", e)))
    }
}

fn strip_digest_prefix(value: &str) -> Result<&str, Error> {
    value
        .strip_prefix("sha256:")
        .ok_or_else(|| Error::Service(format!("malformed digest reference: {}", value)))
}

impl Disco {
    /// Reads the manifest digest out of a tag link file. The link contains
    /// the digest in `sha256:<digest>` format; only the hex is returned.
    pub(crate) async fn digest_from_link(&self, path: &str) -> Result<String, Error> {
        let mut reader = self.ipfs.files_read(path, 0).await?;
        let mut contents = Vec::new();
        reader
            .read_to_end(&mut contents)
            .await
            .map_err(|e| Error::Service(format!("failed to read link file: {}", e)))?;
        let contents = String::from_utf8(contents)
            .map_err(|_| Error::Service("link file is not valid utf-8".to_owned()))?;
        Ok(strip_digest_prefix(contents.trim())?.to_owned())
    }

    async fn read_manifest(&self, digest: &str) -> Result<ImageManifest, Error> {
        let mut reader = self.driver.reader(&blob_path(digest), 0).await?;
        let mut contents = Vec::new();
        reader
            .read_to_end(&mut contents)
            .await
            .map_err(|e| Error::Service(format!("failed to read manifest blob: {}", e)))?;
        serde_json::from_slice(&contents)
            .map_err(|e| Error::Service(format!("failed to decode manifest: {}", e)))
    }

    /// The digests of every blob belonging to the image, in manifest order.
    pub(crate) async fn blob_digests(&self, manifest_digest: &str) -> Result<Vec<String>, Error> {
        let manifest = self.read_manifest(manifest_digest).await?;
        let mut digests = vec![
            manifest_digest.to_owned(),
            strip_digest_prefix(&manifest.config.digest)?.to_owned(),
        ];
        for layer in &manifest.layers {
            digests.push(strip_digest_prefix(&layer.digest)?.to_owned());
        }
        Ok(digests)
    }

    /// The IPFS CID of a stored blob, as known by the node it routes to.
    pub(crate) async fn blob_cid(&self, digest: &str) -> Result<String, Error> {
        let stat = self.ipfs.files_stat(&blob_path(digest)).await?;
        Ok(stat.hash)
    }

    pub(crate) async fn write_disco_file(
        &self,
        repo_name: &str,
        file: &DiscoFile,
    ) -> Result<(), Error> {
        let encoded = file.encode()?;
        self.ipfs
            .files_write(
                &disco_file_path(repo_name),
                Box::new(std::io::Cursor::new(encoded)),
                WriteOpts {
                    create: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Reads disco.json for a repository, first copying the repository from
    /// the IPFS network when it is missing locally.
    pub(crate) async fn read_disco_file(&self, repo_name: &str) -> Result<DiscoFile, Error> {
        let node = self
            .ipfs
            .client_for(&repo_path(repo_name))
            .map_err(|e| Error::Service(format!("failed to route to provider client: {}", e)))?;

        let file_path = disco_file_path(repo_name);
        if !self.has_file(node.as_ref(), &file_path).await? {
            let _ = node.files_mkdir(REPOSITORIES_BASE, true).await;
            tolerate_existing(
                node.files_cp(&ipfs_path(repo_name), &repo_path(repo_name))
                    .await,
            )
            .map_err(|e| {
                Error::Service(format!("failed while copying the repo from the network: {}", e))
            })?;
        }
        debug!(path = %file_path, "reading disco file");

        let mut reader = node.files_read(&file_path, 0).await?;
        let mut contents = Vec::new();
        reader
            .read_to_end(&mut contents)
            .await
            .map_err(|e| Error::Service(format!("failed to read disco file: {}", e)))?;
        DiscoFile::decode(&contents)
    }

    /// Copies the repository's `latest` tag to another tag name.
    pub(crate) async fn create_tag_for_latest(
        &self,
        repo_name: &str,
        tag: &str,
    ) -> Result<(), Error> {
        self.ipfs
            .files_cp(
                &tag_path_for(repo_name, "latest"),
                &tag_path_for(repo_name, tag),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn has_file(
        &self,
        client: &dyn FilesApi,
        path: &str,
    ) -> Result<bool, Error> {
        match client.files_stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::Service(format!(
                "failed to check if file exists: {}",
                e
            ))),
        }
    }
}
