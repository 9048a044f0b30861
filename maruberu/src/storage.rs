//! Storage contract for bell resources.
//!
//! Storage is the only durable owner of a resource. Callers never mutate a
//! resource they did not obtain through [`ResourceStorage::scoped_resource`]:
//! the scope grants exclusive access to one key, hands out a working copy,
//! and either writes that copy back on [`ResourceScope::commit`] or discards
//! it when dropped. Dropping releases the key on every exit path, so an
//! early return through `?` never leaves a key locked.
//!
//! ```rust,ignore
//! let mut scope = storage.scoped_resource(&token).await?;
//! if let Some(resource) = scope.resource_mut() {
//!     resource.ring(&bell)?; // an error here drops the scope unwritten
//! }
//! scope.commit().await?;
//! ```
//!
//! Implementations include:
//! - `maruberu-memory`: owned map with one async mutex per key
//! - `maruberu-postgres`: PostgreSQL rows guarded by advisory locks with a lease

use std::future::Future;

use crate::errors::StorageResult;
use crate::resource::BellResource;
use crate::types::ResourceId;

/// Exclusive access to one resource key for the lifetime of the value.
pub trait ResourceScope: Send {
    /// The key this scope was opened for.
    fn id(&self) -> &ResourceId;

    /// The working copy, or `None` if the key does not exist.
    fn resource(&self) -> Option<&BellResource>;

    /// Mutable access to the working copy.
    fn resource_mut(&mut self) -> Option<&mut BellResource>;

    /// Removes the working copy. A later commit writes nothing.
    fn take(&mut self) -> Option<BellResource>;

    /// Overwrites the working copy and returns the previous one.
    ///
    /// Only an existing key can be overwritten: for an absent key `resource`
    /// is discarded and `None` is returned. Storage keeps the value under the
    /// scope's key, so `resource` should carry the same id.
    fn replace(&mut self, resource: BellResource) -> Option<BellResource> {
        self.resource_mut()
            .map(|current| std::mem::replace(current, resource))
    }

    /// Writes the working copy back verbatim and releases the key.
    ///
    /// The working copy's validation cache is cleared before it is stored.
    /// Committing a scope for an absent key writes nothing.
    fn commit(self) -> impl Future<Output = StorageResult<()>> + Send;
}

/// Trait defining the contract for resource storage backends.
///
/// Per-key operations are strictly serialized: no two scopes on the same key
/// overlap, and `create_resource`/`delete_resource` take the same per-key
/// exclusion. Operations on different keys carry no ordering guarantee.
pub trait ResourceStorage: Send + Sync {
    /// Scope handle returned by [`ResourceStorage::scoped_resource`].
    type Scope: ResourceScope + 'static;

    /// Acquires exclusive access to `id` and loads its current value.
    ///
    /// Suspends until the key is free. An absent key yields a scope with no
    /// resource.
    fn scoped_resource(
        &self,
        id: &ResourceId,
    ) -> impl Future<Output = StorageResult<Self::Scope>> + Send;

    /// Inserts a new resource.
    ///
    /// Fails with `StorageError::AlreadyExists` if the key is taken.
    fn create_resource(
        &self,
        resource: BellResource,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Removes a resource and returns its last stored value.
    ///
    /// Fails with `StorageError::NotFound` if the key is absent.
    fn delete_resource(
        &self,
        id: &ResourceId,
    ) -> impl Future<Output = StorageResult<BellResource>> + Send;

    /// Point-in-time listing, most recently created first.
    ///
    /// With `start_key`, only resources created at or after that resource
    /// are considered, and `limit` keeps the oldest `limit` of those before
    /// the newest-first ordering is applied, so successive pages walk
    /// forward in time. Fails with `StorageError::NotFound` if `start_key`
    /// does not exist. No lock is held across the call.
    fn list_resources(
        &self,
        start_key: Option<&ResourceId>,
        limit: Option<usize>,
    ) -> impl Future<Output = StorageResult<Vec<BellResource>>> + Send;
}

/// Applies the listing window to resources sorted oldest first.
///
/// Shared by backends that sort in process.
pub fn page_newest_first(
    oldest_first: Vec<BellResource>,
    start: Option<&BellResource>,
    limit: Option<usize>,
) -> Vec<BellResource> {
    let mut page: Vec<BellResource> = oldest_first
        .into_iter()
        .filter(|resource| start.map_or(true, |start| resource.created_at() >= start.created_at()))
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    page.reverse();
    page
}
