//! In-memory remote list for testing.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use blocksync_common::{Credential, Error, Identity, Result};

use crate::client::{BulkAddResult, BulkItemResult, RemoteEntry, RemoteList, ALREADY_BLOCKED_MESSAGE};

/// Injected failure, materialized into an `Error` on each call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Connection failure.
    Network,
    /// HTTP-style failure with the given status.
    Status(u16),
}

impl Fault {
    fn to_error(&self) -> Error {
        match self {
            Fault::Network => Error::Network("Injected network failure".to_string()),
            Fault::Status(status) => {
                Error::from_status(*status, format!("Injected HTTP {}", status))
            }
        }
    }
}

/// Number of calls received per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    pub list: usize,
    pub add: usize,
    pub remove: usize,
    pub bulk_add: usize,
}

impl RemoteCalls {
    pub fn total(&self) -> usize {
        self.list + self.add + self.remove + self.bulk_add
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeSet<Identity>,
    api_key: Option<String>,
    offline: bool,
    list_fault: Option<Fault>,
    bulk_fault: Option<Fault>,
    add_faults: HashMap<Identity, Fault>,
    remove_faults: HashMap<Identity, Fault>,
    bulk_rejections: HashMap<Identity, String>,
    calls: RemoteCalls,
}

/// In-memory remote list.
///
/// Behaves like the REST API: `add` of a listed identity answers 409,
/// `remove` of an unlisted identity answers 404, and bulk uploads report
/// listed identities as already blocked. Failures can be injected per
/// operation and per identity. Faults stay in place until cleared.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    /// Create an empty remote that accepts any credential.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote holding the given identities.
    pub fn with_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let remote = Self::new();
        remote.with_inner(|inner| {
            inner.entries = entries
                .into_iter()
                .filter_map(|s| Identity::new(s).ok())
                .collect();
        });
        remote
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    /// Only accept this API key; anything else answers 401.
    pub fn require_api_key(&self, key: impl Into<String>) {
        let key = key.into();
        self.with_inner(|inner| inner.api_key = Some(key));
    }

    /// Fail every call with a network error while set.
    pub fn set_offline(&self, offline: bool) {
        self.with_inner(|inner| inner.offline = offline);
    }

    pub fn fail_list(&self, fault: Fault) {
        self.with_inner(|inner| inner.list_fault = Some(fault));
    }

    /// Fail the whole bulk call.
    pub fn fail_bulk(&self, fault: Fault) {
        self.with_inner(|inner| inner.bulk_fault = Some(fault));
    }

    pub fn fail_add(&self, identity: &str, fault: Fault) {
        if let Ok(identity) = Identity::new(identity) {
            self.with_inner(|inner| inner.add_faults.insert(identity, fault));
        }
    }

    pub fn fail_remove(&self, identity: &str, fault: Fault) {
        if let Ok(identity) = Identity::new(identity) {
            self.with_inner(|inner| inner.remove_faults.insert(identity, fault));
        }
    }

    /// Report this identity as failed inside an otherwise working bulk call.
    pub fn reject_in_bulk(&self, identity: &str, message: impl Into<String>) {
        let message = message.into();
        if let Ok(identity) = Identity::new(identity) {
            self.with_inner(|inner| inner.bulk_rejections.insert(identity, message));
        }
    }

    /// Remove every injected fault and go back online.
    pub fn clear_faults(&self) {
        self.with_inner(|inner| {
            inner.offline = false;
            inner.list_fault = None;
            inner.bulk_fault = None;
            inner.add_faults.clear();
            inner.remove_faults.clear();
            inner.bulk_rejections.clear();
        });
    }

    /// Identities currently listed, sorted.
    pub fn entries(&self) -> Vec<String> {
        self.with_inner(|inner| inner.entries.iter().map(|i| i.to_string()).collect())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.with_inner(|inner| inner.entries.iter().any(|i| i.as_str() == identity))
    }

    pub fn calls(&self) -> RemoteCalls {
        self.with_inner(|inner| inner.calls)
    }

    /// Common gate: offline mode, then credential check.
    fn admit(inner: &Inner, credential: &Credential) -> Result<()> {
        if inner.offline {
            return Err(Fault::Network.to_error());
        }
        match &inner.api_key {
            Some(key) if key != credential.expose() => {
                Err(Error::Authentication("Invalid API key".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteList for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, credential: &Credential) -> Result<Vec<RemoteEntry>> {
        self.with_inner(|inner| {
            inner.calls.list += 1;
            Self::admit(inner, credential)?;
            if let Some(fault) = &inner.list_fault {
                return Err(fault.to_error());
            }
            Ok(inner
                .entries
                .iter()
                .map(|identity| RemoteEntry {
                    identity: identity.clone(),
                })
                .collect())
        })
    }

    async fn add(&self, credential: &Credential, identity: &Identity) -> Result<()> {
        self.with_inner(|inner| {
            inner.calls.add += 1;
            Self::admit(inner, credential)?;
            if let Some(fault) = inner.add_faults.get(identity) {
                return Err(fault.to_error());
            }
            if !inner.entries.insert(identity.clone()) {
                return Err(Error::Conflict(ALREADY_BLOCKED_MESSAGE.to_string()));
            }
            Ok(())
        })
    }

    async fn remove(&self, credential: &Credential, identity: &Identity) -> Result<()> {
        self.with_inner(|inner| {
            inner.calls.remove += 1;
            Self::admit(inner, credential)?;
            if let Some(fault) = inner.remove_faults.get(identity) {
                return Err(fault.to_error());
            }
            if !inner.entries.remove(identity) {
                return Err(Error::NotFound("User not in blocked list".to_string()));
            }
            Ok(())
        })
    }

    async fn bulk_add(
        &self,
        credential: &Credential,
        identities: &[Identity],
    ) -> Result<BulkAddResult> {
        self.with_inner(|inner| {
            inner.calls.bulk_add += 1;
            Self::admit(inner, credential)?;
            if let Some(fault) = &inner.bulk_fault {
                return Err(fault.to_error());
            }

            let mut result = BulkAddResult::default();
            for identity in identities {
                let item = if let Some(message) = inner.bulk_rejections.get(identity) {
                    BulkItemResult {
                        identity: identity.clone(),
                        success: false,
                        message: Some(message.clone()),
                    }
                } else if inner.entries.insert(identity.clone()) {
                    result.successful += 1;
                    BulkItemResult {
                        identity: identity.clone(),
                        success: true,
                        message: None,
                    }
                } else {
                    BulkItemResult {
                        identity: identity.clone(),
                        success: false,
                        message: Some(ALREADY_BLOCKED_MESSAGE.to_string()),
                    }
                };
                result.results.push(item);
            }
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Credential {
        Credential::new("k").unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_remove_idempotence_errors() {
        let remote = MemoryRemote::new();

        remote.add(&key(), &id("alice")).await.unwrap();
        assert!(matches!(
            remote.add(&key(), &id("alice")).await,
            Err(Error::Conflict(_))
        ));

        remote.remove(&key(), &id("alice")).await.unwrap();
        assert!(matches!(
            remote.remove(&key(), &id("alice")).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(remote.calls().add, 2);
        assert_eq!(remote.calls().remove, 2);
    }

    #[tokio::test]
    async fn test_bulk_reports_per_item() {
        let remote = MemoryRemote::with_entries(["bob"]);
        remote.reject_in_bulk("carol", "rate limited");

        let result = remote
            .bulk_add(&key(), &[id("alice"), id("bob"), id("carol")])
            .await
            .unwrap();

        assert_eq!(result.successful, 1);
        assert!(result.results[1].is_already_blocked());
        let failed: Vec<_> = result.failures().map(|r| r.identity.to_string()).collect();
        assert_eq!(failed, vec!["carol"]);
        assert_eq!(remote.entries(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_wrong_key_is_auth_error() {
        let remote = MemoryRemote::new();
        remote.require_api_key("right");

        let err = remote.list(&key()).await.unwrap_err();
        assert!(err.is_auth());
        assert!(remote.list(&Credential::new("right").unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_faults_until_cleared() {
        let remote = MemoryRemote::new();
        remote.fail_add("alice", Fault::Status(502));
        remote.set_offline(true);

        assert!(remote.list(&key()).await.unwrap_err().is_network());
        remote.set_offline(false);
        assert!(remote.add(&key(), &id("alice")).await.unwrap_err().is_server());

        remote.clear_faults();
        remote.add(&key(), &id("alice")).await.unwrap();
        assert!(remote.contains("alice"));
    }
}
