//! Remote blocked-list client for blocksync.
//!
//! The authoritative copy of the blocked list lives behind a small REST API.
//! This crate defines the contract the reconciliation engine consumes, an
//! HTTP implementation of it, and an in-memory implementation with fault
//! injection for tests.

pub mod client;
pub mod http;
pub mod memory;

pub use client::{
    BulkAddResult, BulkItemResult, ConnectionCheck, RemoteEntry, RemoteList, ALREADY_BLOCKED_MESSAGE,
};
pub use http::{HttpRemoteList, RemoteConfig};
pub use memory::{Fault, MemoryRemote, RemoteCalls};
