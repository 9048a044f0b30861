//! In-memory resource storage for maruberu
//!
//! This crate provides an in-memory implementation of the `ResourceStorage`
//! trait from the maruberu crate, useful for development and testing where
//! persistence across restarts is not required.
//!
//! Every key that exists gets its own async mutex. A scope holds the owned
//! guard of that mutex together with a private copy of the resource, so the
//! lock survives across awaits and is released on every exit path when the
//! scope is dropped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::Arc;

use maruberu::errors::{StorageError, StorageResult};
use maruberu::resource::BellResource;
use maruberu::storage::{page_newest_first, ResourceScope, ResourceStorage};
use maruberu::types::ResourceId;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

type KeyLock = Arc<Mutex<()>>;

#[derive(Debug)]
struct StoredResource {
    resource: BellResource,
    // insertion order, breaks created_at ties
    seq: u64,
}

#[derive(Debug, Default)]
struct Resources {
    entries: HashMap<ResourceId, StoredResource>,
    next_seq: u64,
}

impl Resources {
    fn load(&self, id: &ResourceId) -> Option<BellResource> {
        self.entries.get(id).map(|stored| {
            let mut resource = stored.resource.clone();
            resource.clear_validation_cache();
            resource
        })
    }
}

/// Thread-safe in-memory resource storage.
///
/// Cloning shares the same underlying map and lock table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResourceStorage {
    resources: Arc<RwLock<Resources>>,
    locks: Arc<RwLock<HashMap<ResourceId, KeyLock>>>,
}

impl InMemoryResourceStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.resources.read().entries.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The key's mutex, or `None` if the key is absent.
    ///
    /// The presence check runs under the lock table's write lock, so a
    /// deletion cannot slip in between and leave an entry for a gone key.
    fn key_lock(&self, id: &ResourceId) -> Option<KeyLock> {
        let mut locks = self.locks.write();
        if !self.resources.read().entries.contains_key(id) {
            return None;
        }
        Some(Arc::clone(locks.entry(id.clone()).or_default()))
    }

    fn is_current_lock(&self, id: &ResourceId, lock: &KeyLock) -> bool {
        self.locks
            .read()
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, lock))
    }

    /// Waits for exclusive access to `id`.
    ///
    /// Returns `None` if the key is absent. A deletion retires the key's
    /// mutex, so a waiter that wakes up holding a retired mutex starts over.
    async fn lock_key(&self, id: &ResourceId) -> Option<OwnedMutexGuard<()>> {
        loop {
            let lock = self.key_lock(id)?;
            let guard = Arc::clone(&lock).lock_owned().await;
            if self.is_current_lock(id, &lock) {
                return Some(guard);
            }
            debug!(resource = %id, "[memory.lock] key lock retired while waiting, retrying");
        }
    }
}

/// Exclusive access to one key of an [`InMemoryResourceStorage`].
#[derive(Debug)]
pub struct InMemoryScope {
    id: ResourceId,
    resource: Option<BellResource>,
    resources: Arc<RwLock<Resources>>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl ResourceScope for InMemoryScope {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn resource(&self) -> Option<&BellResource> {
        self.resource.as_ref()
    }

    fn resource_mut(&mut self) -> Option<&mut BellResource> {
        self.resource.as_mut()
    }

    fn take(&mut self) -> Option<BellResource> {
        self.resource.take()
    }

    #[instrument(name = "memory.commit", skip(self), fields(resource = %self.id))]
    async fn commit(self) -> StorageResult<()> {
        let Some(mut resource) = self.resource else {
            return Ok(());
        };
        resource.clear_validation_cache();

        let mut resources = self.resources.write();
        if let Some(stored) = resources.entries.get_mut(&self.id) {
            stored.resource = resource;
            debug!("[memory.commit] resource written back");
        }
        Ok(())
    }
}

impl ResourceStorage for InMemoryResourceStorage {
    type Scope = InMemoryScope;

    #[instrument(name = "memory.scoped_resource", skip(self))]
    async fn scoped_resource(&self, id: &ResourceId) -> StorageResult<InMemoryScope> {
        let guard = self.lock_key(id).await;
        let resource = if guard.is_some() {
            self.resources.read().load(id)
        } else {
            None
        };

        Ok(InMemoryScope {
            id: id.clone(),
            resource,
            resources: Arc::clone(&self.resources),
            _guard: guard,
        })
    }

    #[instrument(name = "memory.create_resource", skip(self, resource), fields(resource = %resource.id()))]
    async fn create_resource(&self, mut resource: BellResource) -> StorageResult<()> {
        resource.clear_validation_cache();

        let mut resources = self.resources.write();
        if resources.entries.contains_key(resource.id()) {
            return Err(StorageError::AlreadyExists(resource.id().clone()));
        }

        let seq = resources.next_seq;
        resources.next_seq += 1;
        let _ = resources
            .entries
            .insert(resource.id().clone(), StoredResource { resource, seq });
        debug!("[memory.create_resource] resource created");
        Ok(())
    }

    #[instrument(name = "memory.delete_resource", skip(self))]
    async fn delete_resource(&self, id: &ResourceId) -> StorageResult<BellResource> {
        let guard = self
            .lock_key(id)
            .await
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        let removed = self.resources.write().entries.remove(id);
        let _ = self.locks.write().remove(id);
        drop(guard);

        let mut resource = removed
            .ok_or_else(|| StorageError::NotFound(id.clone()))?
            .resource;
        resource.clear_validation_cache();
        debug!("[memory.delete_resource] resource deleted");
        Ok(resource)
    }

    #[instrument(name = "memory.list_resources", skip(self))]
    async fn list_resources(
        &self,
        start_key: Option<&ResourceId>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<BellResource>> {
        let (start, mut snapshot) = {
            let resources = self.resources.read();
            let start = match start_key {
                Some(key) => Some(
                    resources
                        .load(key)
                        .ok_or_else(|| StorageError::NotFound(key.clone()))?,
                ),
                None => None,
            };
            let snapshot: Vec<(u64, BellResource)> = resources
                .entries
                .values()
                .map(|stored| (stored.seq, stored.resource.clone()))
                .collect();
            (start, snapshot)
        };

        snapshot.sort_by(|(left_seq, left), (right_seq, right)| {
            left.created_at()
                .cmp(&right.created_at())
                .then(left_seq.cmp(right_seq))
        });
        let oldest_first = snapshot
            .into_iter()
            .map(|(_, mut resource)| {
                resource.clear_validation_cache();
                resource
            })
            .collect();

        Ok(page_newest_first(oldest_first, start.as_ref(), limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use maruberu::resource::ResourceStatus;
    use maruberu::types::DurationMillis;

    fn resource() -> BellResource {
        BellResource::new(DurationMillis::try_new(1000).unwrap(), None, None).unwrap()
    }

    #[tokio::test]
    async fn new_storage_is_empty() {
        let storage = InMemoryResourceStorage::new();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn clone_shares_storage() {
        let first = InMemoryResourceStorage::new();
        #[allow(clippy::redundant_clone)]
        let second = first.clone();

        assert!(Arc::ptr_eq(&first.resources, &second.resources));
        assert!(Arc::ptr_eq(&first.locks, &second.locks));
    }

    #[tokio::test]
    async fn absent_key_gets_no_lock_entry() {
        let storage = InMemoryResourceStorage::new();
        let id = ResourceId::generate();

        let scope = storage.scoped_resource(&id).await.unwrap();

        assert!(scope.resource().is_none());
        assert!(storage.locks.read().is_empty());
        scope.commit().await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn delete_retires_key_lock() {
        let storage = InMemoryResourceStorage::new();
        let created = resource();
        let id = created.id().clone();
        storage.create_resource(created).await.unwrap();
        drop(storage.scoped_resource(&id).await.unwrap());
        assert!(storage.locks.read().contains_key(&id));

        let _ = storage.delete_resource(&id).await.unwrap();

        assert!(!storage.locks.read().contains_key(&id));
    }

    #[tokio::test]
    async fn delete_waits_for_open_scope() {
        let storage = InMemoryResourceStorage::new();
        let created = resource();
        let id = created.id().clone();
        storage.create_resource(created).await.unwrap();

        let mut scope = storage.scoped_resource(&id).await.unwrap();
        let deleting = tokio::spawn({
            let storage = storage.clone();
            let id = id.clone();
            async move { storage.delete_resource(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!deleting.is_finished());

        let used = resource()
            .with_id(id.clone())
            .with_status(ResourceStatus::Used)
            .unwrap();
        let _ = scope.replace(used);
        scope.commit().await.unwrap();

        let deleted = deleting.await.unwrap().unwrap();
        assert!(deleted.is_used());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn waiter_on_deleted_key_sees_empty_scope() {
        let storage = InMemoryResourceStorage::new();
        let created = resource();
        let id = created.id().clone();
        storage.create_resource(created).await.unwrap();

        let holder = storage.scoped_resource(&id).await.unwrap();
        let deleting = tokio::spawn({
            let storage = storage.clone();
            let id = id.clone();
            async move { storage.delete_resource(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiter = tokio::spawn({
            let storage = storage.clone();
            let id = id.clone();
            async move {
                storage
                    .scoped_resource(&id)
                    .await
                    .map(|scope| scope.resource().is_some())
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(holder);

        assert!(deleting.await.unwrap().is_ok());
        assert!(!waiter.await.unwrap().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scopes_racing_delete_leave_no_lock_behind() {
        let storage = InMemoryResourceStorage::new();

        for _ in 0..50 {
            let created = resource();
            let id = created.id().clone();
            storage.create_resource(created).await.unwrap();

            let openers: Vec<_> = (0..4)
                .map(|_| {
                    let storage = storage.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        drop(storage.scoped_resource(&id).await.unwrap());
                    })
                })
                .collect();
            let _ = storage.delete_resource(&id).await.unwrap();
            for opener in openers {
                opener.await.unwrap();
            }

            assert!(!storage.locks.read().contains_key(&id));
        }

        assert!(storage.is_empty());
        assert!(storage.locks.read().is_empty());
    }

    #[test]
    fn absent_key_has_no_key_lock() {
        let storage = InMemoryResourceStorage::new();

        assert!(storage.key_lock(&ResourceId::generate()).is_none());
        assert!(storage.locks.read().is_empty());
    }

    #[tokio::test]
    async fn listing_breaks_creation_time_ties_by_insertion_order() {
        let storage = InMemoryResourceStorage::new();
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = resource().with_created_at(instant);
        let second = resource().with_created_at(instant);
        storage.create_resource(first.clone()).await.unwrap();
        storage.create_resource(second.clone()).await.unwrap();

        let listed = storage.list_resources(None, None).await.unwrap();

        assert_eq!(listed, vec![second, first]);
    }

    #[tokio::test]
    async fn stored_copy_is_detached_from_caller() {
        let storage = InMemoryResourceStorage::new();
        let mut created = resource();
        let id = created.id().clone();
        storage.create_resource(created.clone()).await.unwrap();

        created = created.with_sticky(true);

        let scope = storage.scoped_resource(&id).await.unwrap();
        assert!(created.is_sticky());
        assert!(!scope.resource().unwrap().is_sticky());
    }
}
