//! Path rewriting shared by the drivers.

/// Where rewritten upload session paths live.
const UPLOADS_BASE: &str = "/docker/registry/v2/uploads";

/// Rewrites `.../repositories/<name>/_uploads/...` to a flat
/// `/docker/registry/v2/uploads/...`.
///
/// The distribution server keeps upload session state under the repository
/// being pushed. Flattening it lets the content router select a node by the
/// upload UUID instead of the ephemeral repository name.
pub fn fix_upload_path(path: &str) -> String {
    if !path.contains("/_uploads") {
        return path.to_owned();
    }
    let mut new_path = String::from(UPLOADS_BASE);
    let mut append = false;
    for segment in path.split('/') {
        if append {
            new_path.push('/');
            new_path.push_str(segment);
        }
        if segment == "_uploads" {
            append = true;
        }
    }
    new_path
}
