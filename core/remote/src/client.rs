//! Remote list contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use blocksync_common::{Credential, Identity, Result};

/// Bulk item message the remote uses for identities it already holds.
pub const ALREADY_BLOCKED_MESSAGE: &str = "User is already blocked";

/// One entry of the remote blocked list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub identity: Identity,
}

/// Per-identity outcome of a bulk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub identity: Identity,
    pub success: bool,
    pub message: Option<String>,
}

impl BulkItemResult {
    /// Whether the remote already held this identity. Counts as success.
    pub fn is_already_blocked(&self) -> bool {
        self.message.as_deref() == Some(ALREADY_BLOCKED_MESSAGE)
    }

    /// Whether the identity needs a retry.
    pub fn is_failure(&self) -> bool {
        !self.success && !self.is_already_blocked()
    }
}

/// Result of a bulk upload. Partial failure is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkAddResult {
    /// Number of identities newly added.
    pub successful: usize,
    pub results: Vec<BulkItemResult>,
}

impl BulkAddResult {
    /// Items that failed for a reason other than "already blocked".
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.results.iter().filter(|r| r.is_failure())
    }
}

/// Outcome of a connectivity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCheck {
    pub success: bool,
    pub error: Option<String>,
    pub is_auth_error: bool,
    pub is_network_error: bool,
}

/// Authenticated access to the remote blocked list.
///
/// Implementations report failures with the classified `Error` variants;
/// they do not apply the idempotence rules themselves. A 409 on `add` and a
/// 404 on `remove` come back as `Error::Conflict` and `Error::NotFound`, and
/// callers decide to treat them as success.
#[async_trait]
pub trait RemoteList: Send + Sync {
    /// Get the client name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Fetch the complete remote list.
    ///
    /// # Errors
    /// - Network failure or timeout
    /// - Authentication (401)
    /// - Server error (5xx)
    async fn list(&self, credential: &Credential) -> Result<Vec<RemoteEntry>>;

    /// Add one identity.
    ///
    /// # Errors
    /// - `Conflict` if the identity is already listed
    async fn add(&self, credential: &Credential, identity: &Identity) -> Result<()>;

    /// Remove one identity.
    ///
    /// # Errors
    /// - `NotFound` if the identity is not listed
    async fn remove(&self, credential: &Credential, identity: &Identity) -> Result<()>;

    /// Add many identities in one call, reporting per-item outcomes.
    async fn bulk_add(
        &self,
        credential: &Credential,
        identities: &[Identity],
    ) -> Result<BulkAddResult>;

    /// Probe the remote with a list call.
    async fn check_connection(&self, credential: &Credential) -> ConnectionCheck {
        match self.list(credential).await {
            Ok(_) => ConnectionCheck {
                success: true,
                error: None,
                is_auth_error: false,
                is_network_error: false,
            },
            Err(err) => ConnectionCheck {
                success: false,
                error: Some(err.to_string()),
                is_auth_error: err.is_auth(),
                is_network_error: err.is_network(),
            },
        }
    }
}
