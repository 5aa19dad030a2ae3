//! Client-side plumbing for talking to IPFS nodes.
//!
//! This crate provides the [client::FilesApi] abstraction over the IPFS
//! Mutable File System, a deterministic [client::Router] that multiplexes
//! registry content across several nodes, and the CID/digest conversion
//! helpers used to derive globally addressable repository names.

pub mod cid;
pub mod client;
mod errors;

pub use errors::Error;
