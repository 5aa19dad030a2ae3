//! Conversions between CIDs, SHA-256 digest hex and IPFS content paths.
//!
//! Repository names produced by globalization are CID v1 in base32 with the
//! `dag-pb` codec, which is what Kubo reports for MFS directories. Everything
//! in here is a pure function over strings.

use cid::{Cid, Version};
use data_encoding::HEXLOWER;
use multihash::Multihash;

/// The `dag-pb` multicodec, used by Kubo for UnixFS nodes.
const DAG_PB: u64 = 0x70;

/// The `sha2-256` multihash code.
const SHA2_256: u64 = 0x12;

/// Converts an IPFS CID v0 (base58) to its CID v1 (base32) form.
pub fn to_cid_v1(cid_v0: &str) -> Result<String, cid::Error> {
    let parsed = Cid::try_from(cid_v0)?;
    Ok(Cid::new_v1(DAG_PB, *parsed.hash()).to_string())
}

/// Whether the given string is a CID v1.
pub fn is_cid_v1(s: &str) -> bool {
    match Cid::try_from(s) {
        Ok(parsed) => parsed.version() == Version::V1,
        Err(_) => false,
    }
}

/// Whether the given string is a 64-char SHA-256 digest hex.
pub fn is_digest_hex(digest: &str) -> bool {
    digest.len() == 64 && HEXLOWER.decode(digest.as_bytes()).is_ok()
}

/// Whether the given string is an IPFS content path of the form
/// `/ipfs/<cid>`.
pub fn is_ipfs_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() != 2 || segments[0] != "ipfs" {
        return false;
    }
    Cid::try_from(segments[1]).is_ok()
}

/// Converts a SHA-256 digest hex to a CID v1 carrying the digest as a
/// `sha2-256` multihash. The codec is `dag-pb` so the result resembles the
/// CIDs Kubo produces for stored content.
pub fn sha256_hex_to_cid_v1(digest_hex: &str) -> Result<String, crate::Error> {
    let bytes = HEXLOWER
        .decode(digest_hex.as_bytes())
        .map_err(|_| crate::Error::InvalidDigest(digest_hex.to_owned()))?;

    let mh = Multihash::<64>::wrap(SHA2_256, &bytes)
        .map_err(|e| crate::Error::InvalidDigest(format!("{}: {}", digest_hex, e)))?;

    Ok(Cid::new_v1(DAG_PB, mh).to_string())
}

/// Builds the `/ipfs/<cid>` content path for a CID.
pub fn ipfs_path(cid: &str) -> String {
    format!("/ipfs/{}", cid)
}
