use std::future::Future;

use maruberu::{
    BellResource, Operation, ResourceId, ResourceScope, ResourceStorage, StorageError,
    StorageResult,
};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use maruberu_testing::chaos::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    commit_failure_probability: Probability,
}

fn clamped(probability: f32) -> Probability {
    Probability::try_new(probability.clamp(0.0, 1.0)).expect("clamped value is always valid")
}

impl ChaosConfig {
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Probability that opening a scope, creating, deleting or listing fails.
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = clamped(probability);
        self
    }

    /// Probability that a scope's write back fails.
    pub fn with_commit_failure_probability(mut self, probability: f32) -> Self {
        self.commit_failure_probability = clamped(probability);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: clamped(0.0),
            commit_failure_probability: clamped(0.0),
        }
    }
}

pub trait ChaosResourceStorageExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosResourceStorage<Self>;
}

/// Storage wrapper that injects infrastructure failures.
pub struct ChaosResourceStorage<S> {
    storage: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosResourceStorage<S> {
    pub fn new(storage: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            storage,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The wrapped storage, bypassing fault injection.
    pub fn inner(&self) -> &S {
        &self.storage
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(probability))
    }
}

/// Scope whose commit may be made to fail.
pub struct ChaosScope<T> {
    scope: T,
    fail_commit: bool,
}

impl<T: ResourceScope> ResourceScope for ChaosScope<T> {
    fn id(&self) -> &ResourceId {
        self.scope.id()
    }

    fn resource(&self) -> Option<&BellResource> {
        self.scope.resource()
    }

    fn resource_mut(&mut self) -> Option<&mut BellResource> {
        self.scope.resource_mut()
    }

    fn take(&mut self) -> Option<BellResource> {
        self.scope.take()
    }

    fn commit(self) -> impl Future<Output = StorageResult<()>> + Send {
        async move {
            if self.fail_commit {
                // dropping the inner scope releases the key unwritten
                return Err(StorageError::StoreFailure {
                    operation: Operation::SaveResource,
                });
            }

            self.scope.commit().await
        }
    }
}

impl<S> ResourceStorage for ChaosResourceStorage<S>
where
    S: ResourceStorage,
{
    type Scope = ChaosScope<S::Scope>;

    fn scoped_resource(
        &self,
        id: &ResourceId,
    ) -> impl Future<Output = StorageResult<Self::Scope>> + Send {
        let should_fail = self.should_inject(self.config.failure_probability);
        let fail_commit = self.should_inject(self.config.commit_failure_probability);
        let storage = &self.storage;

        async move {
            if should_fail {
                return Err(StorageError::StoreFailure {
                    operation: Operation::AcquireLock,
                });
            }

            let scope = storage.scoped_resource(id).await?;
            Ok(ChaosScope { scope, fail_commit })
        }
    }

    fn create_resource(
        &self,
        resource: BellResource,
    ) -> impl Future<Output = StorageResult<()>> + Send {
        let should_fail = self.should_inject(self.config.failure_probability);
        let storage = &self.storage;

        async move {
            if should_fail {
                return Err(StorageError::StoreFailure {
                    operation: Operation::CreateResource,
                });
            }

            storage.create_resource(resource).await
        }
    }

    fn delete_resource(
        &self,
        id: &ResourceId,
    ) -> impl Future<Output = StorageResult<BellResource>> + Send {
        let should_fail = self.should_inject(self.config.failure_probability);
        let storage = &self.storage;

        async move {
            if should_fail {
                return Err(StorageError::StoreFailure {
                    operation: Operation::DeleteResource,
                });
            }

            storage.delete_resource(id).await
        }
    }

    fn list_resources(
        &self,
        start_key: Option<&ResourceId>,
        limit: Option<usize>,
    ) -> impl Future<Output = StorageResult<Vec<BellResource>>> + Send {
        let should_fail = self.should_inject(self.config.failure_probability);
        let storage = &self.storage;

        async move {
            if should_fail {
                return Err(StorageError::StoreFailure {
                    operation: Operation::ListResources,
                });
            }

            storage.list_resources(start_key, limit).await
        }
    }
}

impl<S> ChaosResourceStorageExt for S
where
    S: ResourceStorage,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosResourceStorage<Self> {
        ChaosResourceStorage::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maruberu::DurationMillis;
    use maruberu_memory::InMemoryResourceStorage;

    fn resource() -> BellResource {
        BellResource::new(DurationMillis::try_new(100).unwrap(), None, None).unwrap()
    }

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[tokio::test]
    async fn zero_probability_passthrough_allows_normal_operations() {
        let storage = InMemoryResourceStorage::new().with_chaos(ChaosConfig::default());
        let created = resource();
        let id = created.id().clone();

        let create_result = storage.create_resource(created).await;
        let scope = storage.scoped_resource(&id).await.unwrap();
        let commit_result = scope.commit().await;

        assert!(create_result.is_ok() && commit_result.is_ok());
    }

    #[tokio::test]
    async fn certain_commit_failure_leaves_stored_value_untouched() {
        let storage = InMemoryResourceStorage::new()
            .with_chaos(ChaosConfig::default().with_commit_failure_probability(1.0));
        let created = resource();
        let id = created.id().clone();
        storage.create_resource(created).await.unwrap();

        let mut scope = storage.scoped_resource(&id).await.unwrap();
        let _ = scope.replace(resource().with_id(id.clone()).with_sticky(true));
        let result = scope.commit().await;

        assert_eq!(
            result,
            Err(StorageError::StoreFailure {
                operation: Operation::SaveResource
            })
        );
        let reloaded = storage.inner().scoped_resource(&id).await.unwrap();
        assert!(!reloaded.resource().unwrap().is_sticky());
    }

    #[test]
    fn deterministic_half_probability_does_not_inject_immediately() {
        let storage = ChaosResourceStorage::new(
            InMemoryResourceStorage::new(),
            ChaosConfig::deterministic().with_failure_probability(0.5),
        );

        assert!(!storage.should_inject(Probability::try_new(0.5).unwrap()));
    }
}
