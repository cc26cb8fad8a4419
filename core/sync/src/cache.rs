//! Local cache of blocked identities and the union-merge plan.

use serde::{Deserialize, Serialize};
use std::collections::btree_set;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use blocksync_common::{Identity, Result};
use blocksync_storage::{keys, KeyValueStore, KeyValueStoreExt};

/// Set of blocked identities.
///
/// Persisted as a sorted sequence of strings. Entries that are not valid
/// identities are dropped when loading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct BlockedSet(BTreeSet<Identity>);

impl BlockedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.0.contains(identity)
    }

    /// Returns `true` if the identity was not present.
    pub fn insert(&mut self, identity: Identity) -> bool {
        self.0.insert(identity)
    }

    /// Returns `true` if the identity was present.
    pub fn remove(&mut self, identity: &Identity) -> bool {
        self.0.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identities in sorted order.
    pub fn iter(&self) -> btree_set::Iter<'_, Identity> {
        self.0.iter()
    }

    /// Entries of `self` missing from `other`.
    pub fn difference<'a>(&'a self, other: &'a BlockedSet) -> impl Iterator<Item = &'a Identity> {
        self.0.difference(&other.0)
    }
}

impl FromIterator<Identity> for BlockedSet {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BlockedSet {
    type Item = Identity;
    type IntoIter = btree_set::IntoIter<Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BlockedSet {
    type Item = &'a Identity;
    type IntoIter = btree_set::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<String>> for BlockedSet {
    fn from(raw: Vec<String>) -> Self {
        raw.into_iter().filter_map(|s| Identity::new(s).ok()).collect()
    }
}

impl From<BlockedSet> for Vec<String> {
    fn from(set: BlockedSet) -> Self {
        set.0.into_iter().map(String::from).collect()
    }
}

/// Work computed by a full sync from the local and remote sets.
///
/// `merged = local ∪ to_download`. Remote absence never removes a local
/// entry; only explicit unblocks do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Blocked locally, missing remotely.
    pub to_upload: Vec<Identity>,
    /// Blocked remotely, missing locally.
    pub to_download: Vec<Identity>,
    pub merged: BlockedSet,
}

impl MergePlan {
    /// Compute the plan.
    ///
    /// Identities in `suppressed` (those with a pending unblock) are not
    /// downloaded even if the remote still lists them.
    pub fn compute(local: &BlockedSet, remote: &BlockedSet, suppressed: &BlockedSet) -> Self {
        let to_upload: Vec<Identity> = local.difference(remote).cloned().collect();
        let to_download: Vec<Identity> = remote
            .difference(local)
            .filter(|identity| !suppressed.contains(identity))
            .cloned()
            .collect();

        let mut merged = local.clone();
        for identity in &to_download {
            merged.insert(identity.clone());
        }

        Self {
            to_upload,
            to_download,
            merged,
        }
    }
}

/// Handle over the `blockedUsers` record.
///
/// Every mutation is a read-modify-write under one lock and writes only when
/// the set actually changed.
pub struct LocalCache<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    lock: Mutex<()>,
}

impl<S: KeyValueStore + ?Sized> LocalCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Current blocked set. A missing record is an empty set.
    pub async fn load(&self) -> Result<BlockedSet> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Add an identity. Returns `true` if it was not already blocked.
    pub async fn insert(&self, identity: &Identity) -> Result<bool> {
        self.modify(|set| set.insert(identity.clone())).await
    }

    /// Remove an identity. Returns `true` if it was blocked.
    pub async fn remove(&self, identity: &Identity) -> Result<bool> {
        self.modify(|set| set.remove(identity)).await
    }

    /// Union `additions` into the current set and return the result.
    pub async fn merge(&self, additions: &[Identity]) -> Result<BlockedSet> {
        self.modify(|set| {
            for identity in additions {
                set.insert(identity.clone());
            }
            set.clone()
        })
        .await
    }

    /// Empty the cache, returning what it held.
    pub async fn clear(&self) -> Result<BlockedSet> {
        self.modify(std::mem::take).await
    }

    async fn modify<T>(&self, f: impl FnOnce(&mut BlockedSet) -> T + Send) -> Result<T> {
        let _guard = self.lock.lock().await;
        let before = self.read().await?;
        let mut after = before.clone();
        let result = f(&mut after);

        if after != before {
            self.store.set_typed(keys::BLOCKED_USERS, &after).await?;
        }
        Ok(result)
    }

    async fn read(&self) -> Result<BlockedSet> {
        match self.store.get_typed::<BlockedSet>(keys::BLOCKED_USERS).await {
            Ok(set) => Ok(set.unwrap_or_default()),
            Err(blocksync_common::Error::Serialization(e)) => {
                warn!("Ignoring unreadable blocked list: {}", e);
                Ok(BlockedSet::default())
            }
            Err(e) => Err(e),
        }
    }
}
