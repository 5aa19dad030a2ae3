use async_trait::async_trait;
use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncReadExt;

use super::{FileReader, FileStat, FilesApi, IpfsClient, LsEntry, WriteOpts};
use crate::Error;

const SHA2_256: u64 = 0x12;

#[derive(Debug, Clone)]
enum Node {
    File { content: Vec<u8>, cid: Option<String> },
    Dir,
}

#[derive(Debug, Clone)]
struct NetworkFile {
    rel: String,
    content: Vec<u8>,
    cid: Option<String>,
}

#[derive(Default)]
struct State {
    /// Normalized absolute paths to nodes. The root directory is implicit.
    nodes: BTreeMap<String, Node>,
    /// Pinned directory CIDs, overriding derivation.
    dir_cids: HashMap<String, String>,
    /// The "rest of the network": content that can be fetched by
    /// `cp /ipfs/<cid>`, keyed by CID. A single entry with an empty
    /// relative path is a file; anything else is a directory tree.
    network: HashMap<String, Vec<NetworkFile>>,
}

/// An in-memory MFS emulating a single IPFS node, including CID derivation
/// and a seedable `/ipfs/` content namespace. Backs the test suites.
#[derive(Default, Clone)]
pub struct MemoryClient {
    state: Arc<RwLock<State>>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}

fn parent_of(path: &str) -> Option<String> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        Some("/".to_owned())
    } else {
        Some(path[..idx].to_owned())
    }
}

fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path.to_owned();
    while let Some(parent) = parent_of(&current) {
        if parent == "/" {
            break;
        }
        out.push(parent.clone());
        current = parent;
    }
    out.reverse();
    out
}

fn cid_v0_of(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mh = Multihash::<64>::wrap(SHA2_256, &digest).expect("sha256 digest fits a multihash");
    Cid::new_v0(mh).expect("sha256 multihash makes a valid cid v0").to_string()
}

impl State {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .keys()
            .filter(|p| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
            .cloned()
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<(String, Node)> {
        let prefix = format!("{}/", path);
        self.nodes
            .iter()
            .filter(|(p, _)| p.as_str() == path || p.starts_with(&prefix))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect()
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.nodes
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }

    fn make_parents(&mut self, path: &str, create: bool) -> Result<(), Error> {
        for dir in ancestors(path) {
            match self.nodes.get(&dir) {
                Some(Node::Dir) => {}
                Some(Node::File { .. }) => {
                    return Err(Error::Api(format!("{} is not a directory", dir)))
                }
                None if create => {
                    self.nodes.insert(dir, Node::Dir);
                }
                None => {
                    return Err(Error::NotFound { path: dir });
                }
            }
        }
        Ok(())
    }

    /// The CID of a node, preferring an explicitly seeded one. Directory
    /// CIDs are derived from the sorted (name, child cid) pairs, so they
    /// change whenever the contents change.
    fn node_cid(&self, path: &str) -> String {
        match self.nodes.get(path) {
            Some(Node::File { content, cid }) => {
                cid.clone().unwrap_or_else(|| cid_v0_of(content))
            }
            _ => {
                if let Some(cid) = self.dir_cids.get(path) {
                    return cid.clone();
                }
                let mut buf = Vec::new();
                for child in self.children(path) {
                    buf.extend_from_slice(child.as_bytes());
                    buf.extend_from_slice(self.node_cid(&child).as_bytes());
                }
                cid_v0_of(&buf)
            }
        }
    }

    /// Registers the node's current contents in the network namespace, the
    /// way announcing content to the swarm would.
    fn publish(&mut self, path: &str) {
        let cid = self.node_cid(path);

        let mut files = Vec::new();
        let mut file_entries = Vec::new();
        let prefix = format!("{}/", path);
        for (p, node) in self.subtree(path) {
            let Node::File { content, cid } = node else {
                continue;
            };
            let file_cid = cid.unwrap_or_else(|| cid_v0_of(&content));
            let rel = if p == path {
                String::new()
            } else {
                p[prefix.len()..].to_owned()
            };
            // individual files stay fetchable by their own CID
            file_entries.push((file_cid.clone(), content.clone()));
            files.push(NetworkFile {
                rel,
                content,
                cid: Some(file_cid),
            });
        }
        for (file_cid, content) in file_entries {
            self.network.insert(
                file_cid.clone(),
                vec![NetworkFile {
                    rel: String::new(),
                    content,
                    cid: Some(file_cid),
                }],
            );
        }
        self.network.insert(cid, files);
    }

    fn cumulative_size(&self, path: &str) -> u64 {
        self.subtree(path)
            .into_iter()
            .map(|(_, node)| match node {
                Node::File { content, .. } => content.len() as u64,
                Node::Dir => 0,
            })
            .sum()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a file, creating intermediate directories.
    pub fn put_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let path = normalize(path);
        let mut state = self.state.write().unwrap();
        state.make_parents(&path, true).expect("seeding cannot fail");
        state.nodes.insert(
            path,
            Node::File {
                content: content.into(),
                cid: None,
            },
        );
    }

    /// Pins the CID reported for a path, overriding derivation.
    pub fn set_cid(&self, path: &str, cid: &str) {
        let path = normalize(path);
        let mut state = self.state.write().unwrap();
        match state.nodes.get_mut(&path) {
            Some(Node::File { cid: slot, .. }) => *slot = Some(cid.to_owned()),
            Some(Node::Dir) | None => {
                state.dir_cids.insert(path, cid.to_owned());
            }
        }
    }

    /// Makes a single file fetchable from the fake network by CID.
    pub fn add_network_file(&self, cid: &str, content: impl Into<Vec<u8>>) {
        let mut state = self.state.write().unwrap();
        state.network.insert(
            cid.to_owned(),
            vec![NetworkFile {
                rel: String::new(),
                content: content.into(),
                cid: Some(cid.to_owned()),
            }],
        );
    }

    /// Makes a directory tree fetchable from the fake network by CID.
    /// Entries are (relative path, content, optional file CID).
    pub fn add_network_tree(&self, cid: &str, files: Vec<(String, Vec<u8>, Option<String>)>) {
        let mut state = self.state.write().unwrap();
        state.network.insert(
            cid.to_owned(),
            files
                .into_iter()
                .map(|(rel, content, cid)| NetworkFile { rel, content, cid })
                .collect(),
        );
    }

    /// Drops all seeded and published network content, severing the node
    /// from the fake swarm.
    pub fn clear_network(&self) {
        self.state.write().unwrap().network.clear();
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.read().unwrap().exists(&normalize(path))
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.read().unwrap().nodes.get(&normalize(path)) {
            Some(Node::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl FilesApi for MemoryClient {
    async fn files_read(&self, path: &str, offset: u64) -> Result<FileReader, Error> {
        let path = normalize(path);
        let state = self.state.read().unwrap();
        match state.nodes.get(&path) {
            Some(Node::File { content, .. }) => {
                let start = (offset as usize).min(content.len());
                Ok(Box::new(Cursor::new(content[start..].to_vec())))
            }
            Some(Node::Dir) => Err(Error::Api(format!("{} is a directory", path))),
            None => Err(Error::NotFound { path }),
        }
    }

    async fn files_write(
        &self,
        path: &str,
        mut data: FileReader,
        opts: WriteOpts,
    ) -> Result<(), Error> {
        let mut incoming = Vec::new();
        data.read_to_end(&mut incoming)
            .await
            .map_err(|e| Error::Api(format!("failed to read write body: {}", e)))?;

        let path = normalize(path);
        let mut state = self.state.write().unwrap();
        if !state.exists(&path) && !opts.create {
            return Err(Error::NotFound { path });
        }
        state.make_parents(&path, opts.parents)?;

        let mut content = match state.nodes.get(&path) {
            Some(Node::File { content, .. }) if !opts.truncate => content.clone(),
            Some(Node::Dir) => return Err(Error::Api(format!("{} is a directory", path))),
            _ => Vec::new(),
        };
        let offset = opts.offset.unwrap_or(0) as usize;
        if content.len() < offset {
            content.resize(offset, 0);
        }
        let end = offset + incoming.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(&incoming);

        state.nodes.insert(path, Node::File { content, cid: None });
        Ok(())
    }

    async fn files_rm(&self, path: &str, force: bool) -> Result<(), Error> {
        let path = normalize(path);
        let mut state = self.state.write().unwrap();
        if !state.exists(&path) {
            return Err(Error::NotFound { path });
        }
        if state.is_dir(&path) && !force {
            return Err(Error::Api(format!(
                "{} is a directory, use -r to remove directories",
                path
            )));
        }
        state.remove_subtree(&path);
        Ok(())
    }

    async fn files_cp(&self, src: &str, dst: &str) -> Result<(), Error> {
        let dst = normalize(dst);
        let mut state = self.state.write().unwrap();
        if state.exists(&dst) {
            return Err(Error::Api(format!(
                "cp: cannot put node in path {}: directory already has entry by that name",
                dst
            )));
        }
        match parent_of(&dst) {
            Some(parent) if state.exists(&parent) && state.is_dir(&parent) => {}
            Some(parent) => return Err(Error::NotFound { path: parent }),
            None => return Err(Error::Api(format!("invalid destination path {}", dst))),
        }

        if let Some(cid) = src.strip_prefix("/ipfs/") {
            let files = state
                .network
                .get(cid)
                .cloned()
                .ok_or_else(|| Error::Api(format!("ipld: could not find node {}", cid)))?;
            for file in files {
                let target = if file.rel.is_empty() {
                    dst.clone()
                } else {
                    format!("{}/{}", dst, file.rel)
                };
                state.make_parents(&target, true)?;
                state.nodes.insert(
                    target,
                    Node::File {
                        content: file.content,
                        cid: file.cid,
                    },
                );
            }
            if state.nodes.get(&dst).is_none() {
                // a tree without a "" entry materializes as a directory
                state.nodes.insert(dst, Node::Dir);
            }
            return Ok(());
        }

        let src = normalize(src);
        if !state.exists(&src) {
            return Err(Error::NotFound { path: src });
        }
        if state.is_dir(&src) {
            state.nodes.insert(dst.clone(), Node::Dir);
            for (p, node) in state.subtree(&src) {
                if p == src {
                    continue;
                }
                let target = format!("{}{}", dst, &p[src.len()..]);
                state.nodes.insert(target, node);
            }
        } else {
            let node = state.nodes.get(&src).cloned().expect("checked above");
            state.nodes.insert(dst, node);
        }
        Ok(())
    }

    async fn files_stat(&self, path: &str) -> Result<FileStat, Error> {
        let path = normalize(path);
        let mut state = self.state.write().unwrap();
        if !state.exists(&path) {
            return Err(Error::NotFound { path });
        }
        let stat = match state.nodes.get(&path) {
            Some(Node::File { content, cid }) => FileStat {
                hash: cid.clone().unwrap_or_else(|| cid_v0_of(content)),
                size: content.len() as u64,
                cumulative_size: content.len() as u64,
                node_type: "file".to_owned(),
            },
            _ => FileStat {
                hash: state.node_cid(&path),
                size: 0,
                cumulative_size: state.cumulative_size(&path),
                node_type: "directory".to_owned(),
            },
        };
        state.publish(&path);
        Ok(stat)
    }

    async fn files_mkdir(&self, path: &str, parents: bool) -> Result<(), Error> {
        let path = normalize(path);
        let mut state = self.state.write().unwrap();
        if state.exists(&path) {
            if parents && state.is_dir(&path) {
                return Ok(());
            }
            return Err(Error::Api(format!("{}: file already exists", path)));
        }
        state.make_parents(&path, parents)?;
        state.nodes.insert(path, Node::Dir);
        Ok(())
    }

    async fn files_ls(&self, path: &str) -> Result<Vec<LsEntry>, Error> {
        let path = normalize(path);
        let state = self.state.read().unwrap();
        if !state.exists(&path) {
            return Err(Error::NotFound { path });
        }
        if !state.is_dir(&path) {
            let name = path.rsplit('/').next().unwrap_or_default().to_owned();
            return Ok(vec![LsEntry {
                name,
                entry_type: 0,
                size: state.cumulative_size(&path),
                hash: state.node_cid(&path),
            }]);
        }
        let mut entries: Vec<LsEntry> = state
            .children(&path)
            .into_iter()
            .map(|child| {
                let name = child.rsplit('/').next().unwrap_or_default().to_owned();
                LsEntry {
                    entry_type: if state.is_dir(&child) { 1 } else { 0 },
                    size: state.cumulative_size(&child),
                    hash: state.node_cid(&child),
                    name,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn files_mv(&self, src: &str, dst: &str) -> Result<(), Error> {
        let src = normalize(src);
        let dst = normalize(dst);
        let mut state = self.state.write().unwrap();
        if !state.exists(&src) {
            return Err(Error::NotFound { path: src });
        }
        match parent_of(&dst) {
            Some(parent) if state.exists(&parent) => {}
            Some(parent) => return Err(Error::NotFound { path: parent }),
            None => return Err(Error::Api(format!("invalid destination path {}", dst))),
        }
        state.remove_subtree(&dst);
        let moved = state.subtree(&src);
        state.remove_subtree(&src);
        for (p, node) in moved {
            let target = if p == src {
                dst.clone()
            } else {
                format!("{}{}", dst, &p[src.len()..])
            };
            state.nodes.insert(target, node);
        }
        Ok(())
    }
}

#[async_trait]
impl IpfsClient for MemoryClient {
    fn client_for(&self, _path: &str) -> Result<Arc<dyn FilesApi>, Error> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(client: &MemoryClient, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        client
            .files_read(path, 0)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let client = MemoryClient::new();
        client
            .files_write(
                "/a/b/c",
                Box::new(Cursor::new(b"data".to_vec())),
                WriteOpts::create_with_parents(),
            )
            .await
            .unwrap();
        assert_eq!(b"data".to_vec(), read_all(&client, "/a/b/c").await);

        // offset read
        let mut buf = Vec::new();
        client
            .files_read("/a/b/c", 2)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(b"ta".to_vec(), buf);
    }

    #[tokio::test]
    async fn write_without_parents_requires_directories() {
        let client = MemoryClient::new();
        let err = client
            .files_write(
                "/missing/file",
                Box::new(Cursor::new(b"x".to_vec())),
                WriteOpts {
                    create: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn stat_reports_types_and_sizes() {
        let client = MemoryClient::new();
        client.put_file("/dir/file", b"12345".to_vec());

        let file = client.files_stat("/dir/file").await.unwrap();
        assert!(!file.is_dir());
        assert_eq!(5, file.size);

        let dir = client.files_stat("/dir").await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(5, dir.cumulative_size);

        assert!(client
            .files_stat("/nope")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn stat_publishes_content_to_the_network() {
        let client = MemoryClient::new();
        client.put_file("/dir/file", b"published".to_vec());
        let stat = client.files_stat("/dir").await.unwrap();

        let other = MemoryClient::new();
        // carry the published tree over to a second node
        for (_, files) in client.state.read().unwrap().network.iter() {
            for file in files {
                if let Some(cid) = &file.cid {
                    other.add_network_file(cid, file.content.clone());
                }
            }
        }
        other.add_network_tree(
            &stat.hash,
            vec![("file".to_owned(), b"published".to_vec(), None)],
        );

        other
            .files_cp(&format!("/ipfs/{}", stat.hash), "/cloned")
            .await
            .unwrap();
        assert_eq!(Some(b"published".to_vec()), other.file_content("/cloned/file"));
    }

    #[tokio::test]
    async fn cp_to_existing_path_reports_existing_entry() {
        let client = MemoryClient::new();
        client.put_file("/a/file", b"x".to_vec());
        client.put_file("/b/file", b"y".to_vec());
        let err = client.files_cp("/a/file", "/b/file").await.unwrap_err();
        assert!(err.to_string().contains("already has entry"));
    }

    #[tokio::test]
    async fn rm_requires_force_for_directories() {
        let client = MemoryClient::new();
        client.put_file("/dir/file", b"x".to_vec());
        assert!(client.files_rm("/dir", false).await.is_err());
        client.files_rm("/dir", true).await.unwrap();
        assert!(!client.contains("/dir/file"));
    }

    #[tokio::test]
    async fn ls_lists_sorted_children() {
        let client = MemoryClient::new();
        client.put_file("/dir/b", b"x".to_vec());
        client.put_file("/dir/a", b"y".to_vec());
        client.files_mkdir("/dir/sub", true).await.unwrap();

        let names: Vec<String> = client
            .files_ls("/dir")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(vec!["a", "b", "sub"], names);
    }

    #[tokio::test]
    async fn explicit_cid_overrides_derived() {
        let client = MemoryClient::new();
        client.put_file("/file", b"x".to_vec());
        client.set_cid("/file", "QmQahNfao3EqrFMKExRB8bedoSgot5mQJH5GDPBuMZH41r");
        let stat = client.files_stat("/file").await.unwrap();
        assert_eq!("QmQahNfao3EqrFMKExRB8bedoSgot5mQJH5GDPBuMZH41r", stat.hash);
    }
}
