use thiserror::Error;

/// Errors surfaced by the IPFS clients and the content router.
#[derive(Debug, Error)]
pub enum Error {
    /// The path is not present in the node's MFS. Recognized from the
    /// "does not exist" message Kubo returns.
    #[error("{path} does not exist")]
    NotFound { path: String },

    /// A content path the router cannot map to a node.
    #[error("path {path} {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// A CID that fails to parse.
    #[error("invalid content id: {0}")]
    InvalidCid(#[from] ::cid::Error),

    /// A digest hex that fails to decode.
    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    /// An error response from the node's RPC API.
    #[error("ipfs api error: {0}")]
    Api(String),

    /// Failure at the HTTP transport level.
    #[error("ipfs transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error means the target path is absent. Kubo reports
    /// this only through the error message, so a substring check on
    /// [Error::Api] is part of the contract.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Api(msg) => msg.contains("does not exist"),
            _ => false,
        }
    }
}
