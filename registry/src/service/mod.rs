//! The Disco service: the globalization and cloning state machines running
//! behind the proxy hooks.

use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, info, instrument, warn};

use disco_ipfs::cid::{ipfs_path, is_cid_v1, is_digest_hex, to_cid_v1};
use disco_ipfs::client::{FilesApi, IpfsClient};
use disco_storage::driver::{MultiDriver, StorageDriver};

use crate::paths::{
    blob_dir_path, blob_path, disco_file_path, manifest_link_path, repo_path, REPOSITORIES_BASE,
};

mod files;

pub use files::{BlobCid, DiscoFile};

/// Errors from the globalization and cloning workflows. The proxy maps
/// these to 500 responses; the flows are idempotent, so clients retry.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Ipfs(#[from] disco_ipfs::Error),
    #[error(transparent)]
    Storage(#[from] disco_storage::Error),
    #[error("{0}")]
    Service(String),
}

/// Treats a copy into an already-populated destination as success. Kubo
/// reports this as "directory already has entry by that name".
fn tolerate_existing(result: Result<(), disco_ipfs::Error>) -> Result<(), disco_ipfs::Error> {
    match result {
        Err(e) if e.to_string().contains("already has entry") => Ok(()),
        other => other,
    }
}

/// Disco does Disco things on top of the embedded distribution server: it
/// turns pushed repositories into globally addressable ones and clones
/// globally addressable repositories from the IPFS network.
pub struct Disco {
    ipfs: Arc<dyn IpfsClient>,
    driver: Arc<dyn MultiDriver>,
    noclone: bool,
}

impl Disco {
    pub fn new(ipfs: Arc<dyn IpfsClient>, driver: Arc<dyn MultiDriver>, noclone: bool) -> Self {
        Disco {
            ipfs,
            driver,
            noclone,
        }
    }

    /// Whether the repository name is reserved for pulling: digest- and
    /// CID-named repositories are never pushed to.
    pub fn is_only_pullable(&self, repo_name: &str) -> bool {
        is_cid_v1(repo_name) || is_digest_hex(repo_name)
    }

    /// Makes the repo a globally addressable one, benefiting from the
    /// content addressing and deduplication properties of IPFS.
    ///
    /// Runs after the distribution server accepts a manifest for
    /// `latest`:
    ///  1. Write disco.json into the repo dir so blobs can be copied from
    ///     the network at pull time.
    ///  2. Duplicate the repo under its manifest digest, making
    ///     `<digest>:latest` possible.
    ///  3. Duplicate the repo under the base32 CID v1 of the repo dir.
    ///  4. Tag the digest repo with the CID, so the CID is discoverable
    ///     from the digest.
    ///  5. Remove the repo pushed under its arbitrary name, so no special
    ///     names exist.
    ///
    /// Duplicating repositories in MFS does not duplicate the underlying
    /// blocks, and the result is pullable from any Disco whose IPFS node
    /// reaches the network.
    #[instrument(skip(self))]
    pub async fn make_global_repo(&self, repo_name: &str) -> Result<(), Error> {
        let result = self.globalize(repo_name).await;
        // the arbitrary-name repository goes away on every exit path; a
        // push under an already-canonical name is never deleted
        if !self.is_only_pullable(repo_name) {
            if let Err(e) = self.driver.delete(&repo_path(repo_name)).await {
                warn!(error = %e, "failed to remove the pushed repo");
            }
        }
        result
    }

    async fn globalize(&self, repo_name: &str) -> Result<(), Error> {
        let manifest_digest = self
            .digest_from_link(&manifest_link_path(repo_name))
            .await
            .map_err(|e| {
                Error::Service(format!("failed to read the digest from the link: {}", e))
            })?;

        // presence is judged against the primary store; a composed stat
        // would report the secondary's view instead
        if let Ok(info) = self
            .driver
            .replicate_in_primary(&repo_path(&manifest_digest))
            .await
        {
            if info.size > 0 {
                info!("already made globally accessible - skipping");
                return Ok(());
            }
        }

        let blob_digests = self
            .blob_digests(&manifest_digest)
            .await
            .map_err(|e| Error::Service(format!("failed to populate blobs: {}", e)))?;

        // the upload may have succeeded in the secondary only
        for digest in &blob_digests {
            self.driver.replicate_in_primary(&blob_path(digest)).await?;
        }
        self.driver
            .replicate_in_primary(&repo_path(repo_name))
            .await?;

        let mut blobs = Vec::with_capacity(blob_digests.len());
        for digest in &blob_digests {
            blobs.push(BlobCid {
                digest: digest.clone(),
                cid: self.blob_cid(digest).await?,
            });
        }
        self.write_disco_file(repo_name, &DiscoFile { blobs })
            .await
            .map_err(|e| Error::Service(format!("failed to write the disco file: {}", e)))?;

        let repo_cid = self
            .ipfs
            .files_stat(&repo_path(repo_name))
            .await
            .map_err(|e| Error::Service(format!("failed while getting the repo cid: {}", e)))?
            .hash;
        let repo_cid_v1 = to_cid_v1(&repo_cid)
            .map_err(|e| Error::Service(format!("failed while getting the repo cid: {}", e)))?;

        self.duplicate_repo(&repo_cid, &repo_cid_v1)
            .await
            .map_err(|e| {
                Error::Service(format!("failed while duplicating with base32 cid: {}", e))
            })?;
        self.duplicate_repo(&repo_cid, &manifest_digest)
            .await
            .map_err(|e| Error::Service(format!("failed while duplicating with digest: {}", e)))?;

        self.create_tag_for_latest(&manifest_digest, &repo_cid_v1)
            .await
            .map_err(|_| Error::Service("failed to create tag for latest".to_owned()))?;

        // blobs are shared by content address; only the repo definitions
        // need to reach the secondary
        self.driver
            .replicate_in_secondary(&repo_path(&manifest_digest))
            .await?;
        self.driver
            .replicate_in_secondary(&repo_path(&repo_cid_v1))
            .await?;

        Ok(())
    }

    /// Duplicates the repository content behind `src_cid_v0` under a new
    /// repository name, on the node that name routes to.
    async fn duplicate_repo(
        &self,
        src_cid_v0: &str,
        dst_name: &str,
    ) -> Result<(), disco_ipfs::Error> {
        let dst = repo_path(dst_name);
        let node = self.ipfs.client_for(&dst)?;
        let _ = node.files_mkdir(REPOSITORIES_BASE, true).await;
        let _ = node.files_rm(&dst, true).await;
        tolerate_existing(node.files_cp(&ipfs_path(src_cid_v0), &dst).await)
    }

    /// Clones the repo from the IPFS network to the local node.
    ///
    /// Runs before the distribution server tries to locate a repository:
    ///  1. Pass through unless the name is a base32 CID v1.
    ///  2. If disco.json is already present locally, there is nothing to
    ///     do.
    ///  3. If it is missing from both stores but the repo exists in the
    ///     primary, filling the secondary is enough.
    ///  4. Honor the no-clone switch.
    ///  5. Copy the repo files from the network into MFS and read
    ///     disco.json.
    ///  6. Use disco.json to copy the blobs over the network.
    ///  7. Replicate everything in the secondary.
    #[instrument(skip(self))]
    pub async fn clone_global_repo(&self, repo_name: &str) -> Result<(), Error> {
        if !is_cid_v1(repo_name) {
            return Ok(());
        }

        // presence is judged against the primary store, same as in
        // globalization
        match self
            .driver
            .replicate_in_primary(&disco_file_path(repo_name))
            .await
        {
            Ok(info) if info.size > 0 && !info.is_dir => {
                debug!("repo was cloned before or pushed locally - skipping");
                return Ok(());
            }
            Err(disco_storage::Error::PathNotFound { .. }) => {
                if self
                    .driver
                    .replicate_in_secondary(&repo_path(repo_name))
                    .await
                    .is_ok()
                {
                    debug!("repo found in the primary - filled the secondary");
                    return Ok(());
                }
            }
            _ => {}
        }

        if self.noclone {
            debug!("cloning from the network is disabled - skipping");
            return Ok(());
        }

        let file = self
            .read_disco_file(repo_name)
            .await
            .map_err(|e| Error::Service(format!("failed to read the disco file: {}", e)))?;

        for blob in &file.blobs {
            let path = blob_path(&blob.digest);
            let node = self.ipfs.client_for(&path)?;
            if self.has_file(node.as_ref(), &path).await? {
                continue;
            }
            let _ = node.files_mkdir(&blob_dir_path(&blob.digest), true).await;
            node.files_cp(&ipfs_path(&blob.cid), &path)
                .await
                .map_err(|e| {
                    Error::Service(format!(
                        "failed while copying blob {} ({}) from the network: {}",
                        blob.digest, blob.cid, e
                    ))
                })?;
        }

        self.driver
            .replicate_in_secondary(&repo_path(repo_name))
            .await?;
        for blob in &file.blobs {
            self.driver
                .replicate_in_secondary(&blob_path(&blob.digest))
                .await?;
        }

        Ok(())
    }
}
