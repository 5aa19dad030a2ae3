//! End-to-end flows over a live proxy socket, with the distribution server
//! stubbed and the stores backed by an in-memory MFS plus a filesystem
//! cache.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use disco_ipfs::client::MemoryClient;
use disco_registry::paths::{blob_path, disco_file_path, manifest_link_path, repo_path, tag_path_for};
use disco_registry::proxy;
use disco_registry::service::Disco;
use disco_storage::driver::{FilesystemDriver, IpfsDriver, Multi, MultiDriver, StorageDriver};

const CID_V0: &str = "QmQahNfao3EqrFMKExRB8bedoSgot5mQJH5GDPBuMZH41r";
const CID_V1: &str = "bafybeibbkcck6lz37hcipp2mwtfdgstydizjq45z4fkqq4va73mp7qzutu";
const MANIFEST_DIGEST: &str = "dca71257cd2e72840a21f0323234bb2e33fea6d949fa0f21c5102146f583486b";
const CONFIG_DIGEST: &str = "69593048aa3acfee0f75f20b77acb549de2472063053f6730c4091b53f2dfb02";
const LAYER_DIGEST: &str = "b71f96345d44b237decc0c2d6c2f9ad0d17fde83dad7579608f1f0764d9686f2";
const MANIFEST_CID: &str = "QmZFwJdqgfMKCK4by7nsTRCmQiPWJbVrvup62jjBhmgRP9";
const CONFIG_CID: &str = "QmXjXzaQbKkz8D8T1fHy6C3JeWX7Ez6JqTsJrRyzqW1cMS";
const LAYER_CID: &str = "QmZDpp1fytMpa7YJKR1CQcjM1vDbkA7K3giL7vTyEwjFdN";

const MANIFEST: &str = r#"{
	"schemaVersion": 2,
	"config": {
		"digest": "sha256:69593048aa3acfee0f75f20b77acb549de2472063053f6730c4091b53f2dfb02"
	},
	"layers": [
		{
			"digest": "sha256:b71f96345d44b237decc0c2d6c2f9ad0d17fde83dad7579608f1f0764d9686f2"
		}
	]
}"#;

const DISCO_FILE: &str = "{\"blobs\":[{\"digest\":\"dca71257cd2e72840a21f0323234bb2e33fea6d949fa0f21c5102146f583486b\",\"cid\":\"QmZFwJdqgfMKCK4by7nsTRCmQiPWJbVrvup62jjBhmgRP9\"},{\"digest\":\"69593048aa3acfee0f75f20b77acb549de2472063053f6730c4091b53f2dfb02\",\"cid\":\"QmXjXzaQbKkz8D8T1fHy6C3JeWX7Ez6JqTsJrRyzqW1cMS\"},{\"digest\":\"b71f96345d44b237decc0c2d6c2f9ad0d17fde83dad7579608f1f0764d9686f2\",\"cid\":\"QmZDpp1fytMpa7YJKR1CQcjM1vDbkA7K3giL7vTyEwjFdN\"}]}\n";

/// One full Disco stack behind a live socket.
struct Instance {
    client: MemoryClient,
    cache_dir: tempfile::TempDir,
    driver: Arc<dyn MultiDriver>,
    addr: SocketAddr,
    upstream_hits: Arc<AtomicUsize>,
}

impl Instance {
    async fn start(noclone: bool) -> Instance {
        let upstream_hits = Arc::new(AtomicUsize::new(0));
        let counter = upstream_hits.clone();
        let upstream_app = Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        });
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream_app.into_make_service())
                .await
                .unwrap();
        });

        let client = MemoryClient::new();
        let cache_dir = tempfile::tempdir().unwrap();
        let secondary = FilesystemDriver::new(cache_dir.path()).await.unwrap();
        let primary = IpfsDriver::new(Arc::new(client.clone()));
        let driver: Arc<dyn MultiDriver> = Arc::new(Multi::new(
            None,
            Arc::new(primary),
            Some(Arc::new(secondary)),
        ));
        let disco = Arc::new(Disco::new(
            Arc::new(client.clone()),
            driver.clone(),
            noclone,
        ));

        let app = proxy::router(
            disco,
            url::Url::parse(&format!("http://{}", upstream_addr)).unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            proxy::serve(listener, app).await.unwrap();
        });

        Instance {
            client,
            cache_dir,
            driver,
            addr,
            upstream_hits,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Seeds the storage state a successful push of the test image leaves
    /// behind.
    fn seed_push(&self, repo_name: &str) {
        self.client.put_file(
            &manifest_link_path(repo_name),
            format!("sha256:{}", MANIFEST_DIGEST).into_bytes(),
        );
        self.client
            .put_file(&blob_path(MANIFEST_DIGEST), MANIFEST.as_bytes().to_vec());
        self.client
            .put_file(&blob_path(CONFIG_DIGEST), b"config blob".to_vec());
        self.client
            .put_file(&blob_path(LAYER_DIGEST), b"layer blob".to_vec());
        self.client.set_cid(&blob_path(MANIFEST_DIGEST), MANIFEST_CID);
        self.client.set_cid(&blob_path(CONFIG_DIGEST), CONFIG_CID);
        self.client.set_cid(&blob_path(LAYER_DIGEST), LAYER_CID);
        self.client.set_cid(&repo_path(repo_name), CID_V0);
    }

    /// Seeds the fake swarm with the globalized repository and its blobs.
    fn seed_network(&self) {
        self.client.add_network_tree(
            CID_V1,
            vec![
                (
                    "disco.json".to_owned(),
                    DISCO_FILE.as_bytes().to_vec(),
                    None,
                ),
                (
                    "_manifests/tags/latest/current/link".to_owned(),
                    format!("sha256:{}", MANIFEST_DIGEST).into_bytes(),
                    None,
                ),
            ],
        );
        self.client
            .add_network_file(MANIFEST_CID, MANIFEST.as_bytes().to_vec());
        self.client
            .add_network_file(CONFIG_CID, b"config blob".to_vec());
        self.client
            .add_network_file(LAYER_CID, b"layer blob".to_vec());
    }

    fn cached(&self, content_path: &str) -> bool {
        self.cache_dir
            .path()
            .join(content_path.trim_start_matches('/'))
            .exists()
    }
}

#[tokio::test]
async fn push_globalizes_and_both_canonical_names_are_pullable() {
    let instance = Instance::start(false).await;
    instance.seed_push("myrepo");
    let http = reqwest::Client::new();

    let resp = http
        .put(instance.url("/v2/myrepo/manifests/latest"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());

    // the arbitrary name is gone, the canonical twins exist
    assert!(!instance.client.contains(&repo_path("myrepo")));
    assert!(instance.client.contains(&repo_path(MANIFEST_DIGEST)));
    assert!(instance.client.contains(&repo_path(CID_V1)));
    assert!(instance
        .client
        .contains(&tag_path_for(MANIFEST_DIGEST, CID_V1)));

    // repo definitions reached the filesystem cache
    assert!(instance.cached(&disco_file_path(MANIFEST_DIGEST)));
    assert!(instance.cached(&disco_file_path(CID_V1)));

    // both canonical names answer pulls
    for name in [MANIFEST_DIGEST, CID_V1] {
        let resp = http
            .get(instance.url(&format!("/v2/{}/manifests/latest", name)))
            .send()
            .await
            .unwrap();
        assert_eq!(200, resp.status().as_u16(), "{}", name);
    }
    assert_eq!(3, instance.upstream_hits.load(Ordering::SeqCst));
}

#[tokio::test]
async fn fresh_instance_clones_by_cid_from_the_network() {
    let instance = Instance::start(false).await;
    instance.seed_network();
    let http = reqwest::Client::new();

    let resp = http
        .get(instance.url(&format!("/v2/{}/manifests/latest", CID_V1)))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());

    // repository and blobs landed in the primary
    assert!(instance.client.contains(&repo_path(CID_V1)));
    assert!(instance.client.contains(&blob_path(MANIFEST_DIGEST)));
    assert!(instance.client.contains(&blob_path(CONFIG_DIGEST)));
    assert!(instance.client.contains(&blob_path(LAYER_DIGEST)));

    // and in the cache
    assert!(instance.cached(&disco_file_path(CID_V1)));
    assert!(instance.cached(&blob_path(MANIFEST_DIGEST)));
    assert!(instance.cached(&blob_path(CONFIG_DIGEST)));
    assert!(instance.cached(&blob_path(LAYER_DIGEST)));

    // a second pull needs no network
    instance.client.clear_network();
    let resp = http
        .get(instance.url(&format!("/v2/{}/manifests/latest", CID_V1)))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());
}

#[tokio::test]
async fn purged_cache_entry_is_refilled_by_read_through() {
    let instance = Instance::start(false).await;
    instance.seed_push("myrepo");
    let http = reqwest::Client::new();

    http.put(instance.url("/v2/myrepo/manifests/latest"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert!(instance.cached(&disco_file_path(CID_V1)));

    // drop the CID repo from the cache
    std::fs::remove_dir_all(
        instance
            .cache_dir
            .path()
            .join(repo_path(CID_V1).trim_start_matches('/')),
    )
    .unwrap();
    assert!(!instance.cached(&disco_file_path(CID_V1)));

    // the pull still succeeds against the primary
    let resp = http
        .get(instance.url(&format!("/v2/{}/manifests/latest", CID_V1)))
        .send()
        .await
        .unwrap();
    assert_eq!(200, resp.status().as_u16());

    // the distribution server serves the repo by reading through the
    // composed driver, and those reads put the purged entries back
    let link = instance
        .driver
        .get_content(&manifest_link_path(CID_V1))
        .await
        .unwrap();
    assert_eq!(format!("sha256:{}", MANIFEST_DIGEST).into_bytes(), link);
    instance
        .driver
        .get_content(&disco_file_path(CID_V1))
        .await
        .unwrap();
    assert!(instance.cached(&manifest_link_path(CID_V1)));
    assert!(instance.cached(&disco_file_path(CID_V1)));
}

#[tokio::test]
async fn noclone_instance_serves_local_content_without_the_network() {
    let instance = Instance::start(true).await;
    instance.seed_push("myrepo");
    let http = reqwest::Client::new();

    http.put(instance.url("/v2/myrepo/manifests/latest"))
        .body("{}")
        .send()
        .await
        .unwrap();

    // sever the swarm entirely; local pulls still succeed
    instance.client.clear_network();
    for name in [MANIFEST_DIGEST, CID_V1] {
        let resp = http
            .get(instance.url(&format!("/v2/{}/manifests/latest", name)))
            .send()
            .await
            .unwrap();
        assert_eq!(200, resp.status().as_u16(), "{}", name);
    }

    // the cross-reference tag is discoverable from the cache
    assert!(instance.cached(&tag_path_for(MANIFEST_DIGEST, CID_V1)));
}

#[tokio::test]
async fn unknown_cid_pull_fails_closed() {
    let instance = Instance::start(false).await;
    let http = reqwest::Client::new();

    let resp = http
        .get(instance.url(&format!("/v2/{}/manifests/latest", CID_V1)))
        .send()
        .await
        .unwrap();
    assert_eq!(500, resp.status().as_u16());
    // nothing reached the upstream and no partial repo state remains
    assert_eq!(0, instance.upstream_hits.load(Ordering::SeqCst));
    assert!(!instance.client.contains(&repo_path(CID_V1)));
}

#[tokio::test]
async fn pushes_to_canonical_names_are_rejected() {
    let instance = Instance::start(false).await;
    let http = reqwest::Client::new();

    for name in [MANIFEST_DIGEST, CID_V1] {
        let resp = http
            .put(instance.url(&format!("/v2/{}/manifests/latest", name)))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(401, resp.status().as_u16(), "{}", name);
    }
    assert_eq!(0, instance.upstream_hits.load(Ordering::SeqCst));
}
