//! The Disco registry service.
//!
//! Disco fronts an embedded OCI Distribution server with a reverse proxy
//! whose hooks rewrite pushed repositories into globally addressable
//! digest- and CID-named twins on IPFS, and clone CID-named repositories
//! back from the network before pulls.

pub mod config;
pub mod deps;
pub mod paths;
pub mod proxy;
pub mod service;
