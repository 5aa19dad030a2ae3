//! Canonical on-storage path construction.

pub const REGISTRY_BASE: &str = "/docker/registry/v2";
pub const REPOSITORIES_BASE: &str = "/docker/registry/v2/repositories";
pub const BLOBS_BASE: &str = "/docker/registry/v2/blobs/sha256";

/// "link" is a file which contains the digest in sha256:<digest> format.
const MANIFEST_LINK_SUFFIX: &str = "/_manifests/tags/latest/current/link";

pub fn repo_path(repo_name: &str) -> String {
    format!("{}/{}", REPOSITORIES_BASE, repo_name)
}

pub fn manifest_link_path(repo_name: &str) -> String {
    format!("{}{}", repo_path(repo_name), MANIFEST_LINK_SUFFIX)
}

pub fn blob_dir_path(digest: &str) -> String {
    format!("{}/{}/{}", BLOBS_BASE, &digest[..2], digest)
}

/// "data" is a file which contains the blob bytes.
pub fn blob_path(digest: &str) -> String {
    format!("{}/data", blob_dir_path(digest))
}

pub fn disco_file_path(repo_name: &str) -> String {
    format!("{}/disco.json", repo_path(repo_name))
}

pub fn tag_path_for(repo_name: &str, tag: &str) -> String {
    format!("{}/_manifests/tags/{}", repo_path(repo_name), tag)
}
