//! Key-value store abstraction for blocksync.
//!
//! The blocked list, the API key and the sync bookkeeping all live in a
//! small synchronized key-value store. This crate defines that contract and
//! ships two backends: an in-memory store for tests and embedding, and a
//! JSON file store for the command-line host.
//!
//! # Design Principles
//! - Values are JSON so any backend can hold them verbatim
//! - Async operations: every read and write may suspend
//! - Change feed: every mutation that alters a value is broadcast

pub mod local;
pub mod memory;
pub mod store;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use store::{keys, KeyValueStore, KeyValueStoreExt, StoreChange};
