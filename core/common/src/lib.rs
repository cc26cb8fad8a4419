//! Common utilities and types shared across the blocksync crates.
//!
//! This module provides the error taxonomy used by every layer and the two
//! value types that flow through all of them: blockable identities and the
//! API credential.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Credential, Identity};
