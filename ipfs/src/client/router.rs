use md5::{Digest, Md5};

use crate::Error;

/// The storage prefix every routable content path carries.
const REGISTRY_PREFIX: [&str; 3] = ["docker", "registry", "v2"];

/// Deterministically maps registry content paths to one of N IPFS nodes.
///
/// Routing keys on the logical content identifier (repository name, upload
/// UUID or blob digest) rather than the whole path, so every operation on
/// the same content reaches the same node. MD5 is used purely as a cheap
/// uniform hash; nothing security-relevant hangs off it.
#[derive(Debug, Clone)]
pub struct Router {
    node_count: u64,
}

impl Router {
    pub fn new(node_count: usize) -> Self {
        Router {
            node_count: node_count as u64,
        }
    }

    /// Returns the content id the path addresses and the index of the node
    /// it routes to.
    ///
    /// There are three kinds of content on the distribution storage to
    /// multiplex:
    ///  - `.../repositories/*`
    ///  - `.../blobs/*`
    ///  - `.../uploads/*` (rewritten from `.../repositories/<repo>/_uploads/*`)
    pub fn route_content(&self, path: &str) -> Result<(String, usize), Error> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(Error::InvalidPath {
                path: path.to_owned(),
                reason: "has no leading slash",
            });
        };
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() < 5 {
            return Err(Error::InvalidPath {
                path: path.to_owned(),
                reason: "has less than 5 segments",
            });
        }
        if segments[..3] != REGISTRY_PREFIX {
            return Err(Error::InvalidPath {
                path: path.to_owned(),
                reason: "has invalid first 3 segments",
            });
        }

        // strip /docker/registry/v2
        let segments = &segments[3..];

        let id = match segments[0] {
            // repository name, upload UUID
            "repositories" | "uploads" => segments[1],

            // blob hash after the shard dir, e.g. .../sha256/a8/a8b19f...
            "blobs" => segments[3],

            _ => {
                return Err(Error::InvalidPath {
                    path: path.to_owned(),
                    reason: "has invalid content kind segment",
                })
            }
        };

        let hash: [u8; 16] = Md5::digest(id.as_bytes()).into();
        let index = u128::from_be_bytes(hash) % self.node_count as u128;
        Ok((id.to_owned(), index as usize))
    }
}
