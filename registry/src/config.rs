//! The registry configuration file.
//!
//! Disco extends the distribution-style YAML configuration with a
//! `storage.ipfs` block declaring the IPFS node router, the optional
//! secondary cache and redirect settings, plus a `disco` block with
//! Disco's own switches:
//!
//! ```yaml
//! version: 0.1
//! http:
//!   addr: :5000
//! storage:
//!   ipfs:
//!     router:
//!       nodes:
//!         - url: http://localhost:5001
//!     cache:
//!       filesystem:
//!         rootdirectory: /var/cache/disco
//!     cacheonly: false
//!     redirect: https://cache.example.com
//! disco:
//!   noclone: false
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use disco_storage::driver::DriverConfig;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open config file: {0}")]
    Open(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub disco: DiscoConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// The embedded distribution server's listen address, e.g. `:5000`.
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub ipfs: IpfsStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpfsStorageConfig {
    pub router: RouterConfig,
    /// The optional secondary cache driver declaration.
    #[serde(default)]
    pub cache: Option<DriverConfig>,
    /// Refuse to pull from the wider IPFS network, serving local content
    /// only.
    #[serde(default)]
    pub cacheonly: bool,
    /// A public base URL blobs can be redirected to, served from the
    /// secondary.
    #[serde(default)]
    pub redirect: Option<Url>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub url: Url,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoConfig {
    /// Do not attempt to fetch from the IPFS network during pulls.
    #[serde(default)]
    pub noclone: bool,
}

impl Config {
    /// Reads and validates the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        if config.storage.ipfs.router.nodes.is_empty() {
            return Err(Error::Invalid("please specify 'router' nodes in ipfs driver config"));
        }
        Ok(config)
    }

    /// The URL the embedded distribution server answers on.
    pub fn upstream_url(&self) -> Result<Url, Error> {
        Url::parse(&format!("http://localhost{}", self.http.addr))
            .map_err(|_| Error::Invalid("invalid http.addr"))
    }

    /// Whether pull-time network cloning is disabled.
    pub fn noclone(&self) -> bool {
        self.disco.noclone || self.storage.ipfs.cacheonly
    }
}

/// Expands a leading `~/` against `$HOME`, for the default config path.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_CONFIG: &str = r#"
version: 0.1
http:
  addr: :5000
storage:
  ipfs:
    router:
      nodes:
        - url: http://localhost:5001
        - url: http://localhost:5002
    cache:
      filesystem:
        rootdirectory: /var/cache/disco
    cacheonly: false
    redirect: https://cache.example.com
disco:
  noclone: true
"#;

    const MINIMAL_CONFIG: &str = r#"
http:
  addr: :5000
storage:
  ipfs:
    router:
      nodes:
        - url: http://localhost:5001
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_a_full_config() {
        let file = write_config(FULL_CONFIG);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(2, config.storage.ipfs.router.nodes.len());
        assert!(config.storage.ipfs.cache.is_some());
        assert_eq!(
            "https://cache.example.com/",
            config.storage.ipfs.redirect.as_ref().unwrap().as_str()
        );
        assert!(config.noclone());
        assert_eq!(
            "http://localhost:5000/",
            config.upstream_url().unwrap().as_str()
        );
    }

    #[test]
    fn parses_a_minimal_config() {
        let file = write_config(MINIMAL_CONFIG);
        let config = Config::load(file.path()).unwrap();

        assert!(config.storage.ipfs.cache.is_none());
        assert!(config.storage.ipfs.redirect.is_none());
        assert!(!config.noclone());
    }

    #[test]
    fn cacheonly_also_disables_cloning() {
        let file = write_config(MINIMAL_CONFIG);
        let mut config = Config::load(file.path()).unwrap();
        config.storage.ipfs.cacheonly = true;
        assert!(config.noclone());
    }

    #[test]
    fn requires_router_nodes() {
        let file = write_config(
            r#"
http:
  addr: :5000
storage:
  ipfs:
    router:
      nodes: []
"#,
        );
        assert!(Config::load(file.path()).is_err());
    }
}
