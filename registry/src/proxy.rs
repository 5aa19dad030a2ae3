//! The reverse proxy in front of the embedded distribution server.
//!
//! All traffic is forwarded as-is; the hooks only look at the method and
//! path. A manifest PUT for `latest` triggers globalization after the
//! upstream has accepted it, and manifest HEAD/GET triggers cloning before
//! the upstream resolves the repository. Pushes to digest- or CID-named
//! repositories are rejected outright.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use url::Url;

use crate::service::Disco;

/// Blob uploads are large and slow; requests get a whole hour.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct ProxyState {
    disco: Arc<Disco>,
    upstream: Url,
    client: reqwest::Client,
}

/// Builds the proxy application routing every request through the hooks.
pub fn router(disco: Arc<Disco>, upstream: Url) -> Router {
    Router::new().fallback(handle).with_state(ProxyState {
        disco,
        upstream,
        client: reqwest::Client::new(),
    })
}

/// Serves the proxy until the listener fails or the task is aborted.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "disco proxy listening");
    axum::serve(listener, app.into_make_service()).await
}

/// The repository name is the second path segment, e.g.
/// `/v2/<name>/manifests/latest`.
fn repo_name(path: &str) -> Option<&str> {
    let segments: Vec<&str> = path.strip_prefix('/')?.split('/').collect();
    match segments.get(1) {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

async fn handle(State(state): State<ProxyState>, req: axum::extract::Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let is_manifest_put = method == Method::PUT && path.contains("/manifests/latest");
    let is_manifest_read =
        (method == Method::HEAD || method == Method::GET) && path.contains("/manifests/");

    // disallow overwriting CID v1 and digest repos
    if is_manifest_put {
        if let Some(name) = repo_name(&path) {
            if state.disco.is_only_pullable(name) {
                warn!(repo = name, "rejected push to a pullable-only repo");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    if is_manifest_read {
        if let Some(name) = repo_name(&path) {
            if let Err(e) = state.disco.clone_global_repo(name).await {
                error!(error = %e, repo = name, "failed to clone global repo");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    let response = match tokio::time::timeout(REQUEST_TIMEOUT, forward(&state, req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(error = %e, "failed to reach the distribution server");
            return StatusCode::BAD_GATEWAY.into_response();
        }
        Err(_) => {
            error!("request to the distribution server timed out");
            return StatusCode::GATEWAY_TIMEOUT.into_response();
        }
    };

    if is_manifest_put {
        if let Some(name) = repo_name(&path) {
            if let Err(e) = state.disco.make_global_repo(name).await {
                error!(error = %e, repo = name, "failed to make global repo");
            }
        }
    }

    response
}

async fn forward(
    state: &ProxyState,
    req: axum::extract::Request,
) -> Result<Response, reqwest::Error> {
    let (parts, body) = req.into_parts();

    let mut url = state.upstream.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut headers = parts.headers;
    headers.remove(header::HOST);

    let upstream_response = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let mut response = Response::builder().status(upstream_response.status());
    for (name, value) in upstream_response.headers() {
        // hop-by-hop headers do not survive re-framing
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        response = response.header(name, value);
    }
    Ok(response
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .expect("building a response from upstream parts cannot fail"))
}
