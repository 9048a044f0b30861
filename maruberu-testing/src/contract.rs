use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use maruberu::{
    BellResource, DurationMillis, ResourceId, ResourceScope, ResourceStatus, ResourceStorage,
    StorageError,
};

use crate::doubles::AcceptingBell;

/// How long a contract scenario waits before concluding that an operation
/// is blocked.
const BLOCKED_PROBE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn storage_error(scenario: &'static str, operation: &'static str, error: StorageError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_resource() -> BellResource {
    BellResource::new(
        DurationMillis::try_new(1000).expect("positive duration"),
        None,
        None,
    )
    .expect("open-ended window is valid")
}

async fn create_contract_resource<S: ResourceStorage>(
    scenario: &'static str,
    storage: &S,
    resource: BellResource,
) -> Result<ResourceId, ContractTestFailure> {
    let id = resource.id().clone();
    storage
        .create_resource(resource)
        .await
        .map_err(|error| ContractTestFailure::storage_error(scenario, "create_resource", error))?;
    Ok(id)
}

async fn open_scope<S: ResourceStorage>(
    scenario: &'static str,
    storage: &S,
    id: &ResourceId,
) -> Result<S::Scope, ContractTestFailure> {
    storage
        .scoped_resource(id)
        .await
        .map_err(|error| ContractTestFailure::storage_error(scenario, "scoped_resource", error))
}

async fn commit_scope<T: ResourceScope>(scenario: &'static str, scope: T) -> ContractTestResult {
    scope
        .commit()
        .await
        .map_err(|error| ContractTestFailure::storage_error(scenario, "commit", error))
}

async fn load<S: ResourceStorage>(
    scenario: &'static str,
    storage: &S,
    id: &ResourceId,
) -> Result<Option<BellResource>, ContractTestFailure> {
    let scope = open_scope(scenario, storage, id).await?;
    Ok(scope.resource().cloned())
}

fn ring_in_scope<T: ResourceScope>(scenario: &'static str, scope: &mut T) -> ContractTestResult {
    let resource = scope.resource_mut().ok_or_else(|| {
        ContractTestFailure::assertion(scenario, "expected scope to hold the created resource")
    })?;
    resource.ring(&AcceptingBell).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("ring was rejected: {error}"))
    })
}

/// How far ahead of the clock listing scenarios create their resources.
const LISTING_DAYS_AHEAD: i64 = 365 * 3000;

/// Creation times far enough ahead that no other scenario's resources
/// sort after them, and later on every run against a reused database.
fn isolated_creation_times(count: i64) -> Vec<DateTime<Utc>> {
    creation_times_from(Utc::now() + chrono::Duration::days(LISTING_DAYS_AHEAD), count)
}

fn creation_times_from(base: DateTime<Utc>, count: i64) -> Vec<DateTime<Utc>> {
    (0..count)
        .map(|offset| base + chrono::Duration::seconds(offset))
        .collect()
}

pub async fn test_create_and_load<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "create_and_load";

    let storage = make_storage();
    let created = contract_resource().with_sticky(true).with_api(true);
    let id = create_contract_resource(SCENARIO, &storage, created.clone()).await?;

    let loaded = load(SCENARIO, &storage, &id).await?.ok_or_else(|| {
        ContractTestFailure::assertion(SCENARIO, "created resource was not found")
    })?;

    if loaded != created {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("loaded resource differs from created one: {loaded:?} != {created:?}"),
        ));
    }

    Ok(())
}

pub async fn test_duplicate_create_rejected<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "duplicate_create_rejected";

    let storage = make_storage();
    let original = contract_resource();
    let id = create_contract_resource(SCENARIO, &storage, original.clone()).await?;

    let duplicate = contract_resource().with_id(id.clone()).with_sticky(true);
    match storage.create_resource(duplicate).await {
        Err(StorageError::AlreadyExists(existing)) if existing == id => {}
        Err(error) => {
            return Err(ContractTestFailure::storage_error(
                SCENARIO,
                "create_resource",
                error,
            ))
        }
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected AlreadyExists but duplicate create succeeded",
            ))
        }
    }

    let stored = load(SCENARIO, &storage, &id).await?;
    if stored.as_ref() != Some(&original) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "rejected duplicate overwrote the stored resource",
        ));
    }

    Ok(())
}

pub async fn test_commit_persists_changes<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "commit_persists_changes";

    let storage = make_storage();
    let id = create_contract_resource(SCENARIO, &storage, contract_resource()).await?;

    let mut scope = open_scope(SCENARIO, &storage, &id).await?;
    ring_in_scope(SCENARIO, &mut scope)?;
    let expected = scope.resource().cloned();
    commit_scope(SCENARIO, scope).await?;

    let stored = load(SCENARIO, &storage, &id).await?;
    if stored != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("committed change was not persisted: {stored:?}"),
        ));
    }

    if stored.map(|resource| resource.status()) != Some(ResourceStatus::Using) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected persisted status USING",
        ));
    }

    Ok(())
}

pub async fn test_uncommitted_scope_discards_changes<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "uncommitted_scope_discards_changes";

    let storage = make_storage();
    let created = contract_resource();
    let id = create_contract_resource(SCENARIO, &storage, created.clone()).await?;

    let mut scope = open_scope(SCENARIO, &storage, &id).await?;
    ring_in_scope(SCENARIO, &mut scope)?;
    drop(scope);

    if load(SCENARIO, &storage, &id).await?.as_ref() != Some(&created) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "dropped scope wrote its working copy",
        ));
    }

    let mut scope = open_scope(SCENARIO, &storage, &id).await?;
    ring_in_scope(SCENARIO, &mut scope)?;
    let _ = scope.take();
    commit_scope(SCENARIO, scope).await?;

    if load(SCENARIO, &storage, &id).await?.as_ref() != Some(&created) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "committing a taken scope wrote a value",
        ));
    }

    Ok(())
}

pub async fn test_absent_key_scope_is_empty<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "absent_key_scope_is_empty";

    let storage = make_storage();
    let id = ResourceId::generate();

    let mut scope = open_scope(SCENARIO, &storage, &id).await?;
    if scope.resource().is_some() || scope.id() != &id {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "scope for an absent key should be empty and carry the key",
        ));
    }
    if scope.replace(contract_resource().with_id(id.clone())).is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "replacing in an empty scope should return nothing",
        ));
    }
    commit_scope(SCENARIO, scope).await?;

    if load(SCENARIO, &storage, &id).await?.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "committing an empty scope created a resource",
        ));
    }

    // the key must not be left locked
    let probe = tokio::time::timeout(BLOCKED_PROBE * 10, open_scope(SCENARIO, &storage, &id)).await;
    if probe.is_err() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "absent key stayed locked after its scope was committed",
        ));
    }

    Ok(())
}

pub async fn test_delete_returns_last_value<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "delete_returns_last_value";

    let storage = make_storage();
    let id = create_contract_resource(SCENARIO, &storage, contract_resource()).await?;

    let mut scope = open_scope(SCENARIO, &storage, &id).await?;
    ring_in_scope(SCENARIO, &mut scope)?;
    let expected = scope.resource().cloned();
    commit_scope(SCENARIO, scope).await?;

    let deleted = storage
        .delete_resource(&id)
        .await
        .map_err(|error| ContractTestFailure::storage_error(SCENARIO, "delete_resource", error))?;
    if Some(deleted) != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "delete did not return the last committed value",
        ));
    }

    if load(SCENARIO, &storage, &id).await?.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "deleted resource is still visible",
        ));
    }

    match storage.delete_resource(&id).await {
        Err(StorageError::NotFound(missing)) if missing == id => Ok(()),
        Err(error) => Err(ContractTestFailure::storage_error(
            SCENARIO,
            "delete_resource",
            error,
        )),
        Ok(_) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected NotFound when deleting twice",
        )),
    }
}

pub async fn test_listing_pages_newest_first<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "listing_pages_newest_first";

    let storage = make_storage();
    let times = isolated_creation_times(3);
    let oldest = contract_resource().with_created_at(times[0]);
    let middle = contract_resource().with_created_at(times[1]);
    let newest = contract_resource().with_created_at(times[2]);

    // insertion order differs from creation order on purpose
    for resource in [&middle, &newest, &oldest] {
        let _ = create_contract_resource(SCENARIO, &storage, resource.clone()).await?;
    }

    let list = |start: &BellResource, limit: Option<usize>| {
        let storage = &storage;
        let start = start.id().clone();
        async move {
            storage
                .list_resources(Some(&start), limit)
                .await
                .map_err(|error| {
                    ContractTestFailure::storage_error(SCENARIO, "list_resources", error)
                })
        }
    };

    let ids = |page: &[BellResource]| page.iter().map(|r| r.id().clone()).collect::<Vec<_>>();

    let all = list(&oldest, None).await?;
    let expected = ids(&[newest.clone(), middle.clone(), oldest.clone()]);
    if ids(&all) != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected newest-first listing {expected:?}, observed {:?}", ids(&all)),
        ));
    }

    let first_page = list(&oldest, Some(2)).await?;
    let expected = ids(&[middle.clone(), oldest.clone()]);
    if ids(&first_page) != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "limit should keep the oldest entries from the start key, observed {:?}",
                ids(&first_page)
            ),
        ));
    }

    let later_page = list(&middle, Some(5)).await?;
    let expected = ids(&[newest.clone(), middle.clone()]);
    if ids(&later_page) != expected {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "start key should exclude older entries, observed {:?}",
                ids(&later_page)
            ),
        ));
    }

    let unfiltered = storage
        .list_resources(None, None)
        .await
        .map_err(|error| ContractTestFailure::storage_error(SCENARIO, "list_resources", error))?;
    let positions: Vec<Option<usize>> = [&newest, &middle, &oldest]
        .iter()
        .map(|wanted| unfiltered.iter().position(|r| r.id() == wanted.id()))
        .collect();
    let in_order = positions.windows(2).all(|pair| match (pair[0], pair[1]) {
        (Some(left), Some(right)) => left < right,
        _ => false,
    });
    if !in_order {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unfiltered listing lost or misordered entries: {positions:?}"),
        ));
    }

    let missing = ResourceId::generate();
    match storage.list_resources(Some(&missing), None).await {
        Err(StorageError::NotFound(id)) if id == missing => Ok(()),
        Err(error) => Err(ContractTestFailure::storage_error(
            SCENARIO,
            "list_resources",
            error,
        )),
        Ok(_) => Err(ContractTestFailure::assertion(
            SCENARIO,
            "expected NotFound for an unknown start key",
        )),
    }
}

pub async fn test_overwritten_creation_time_orders_listing<F, S>(
    make_storage: F,
) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "overwritten_creation_time_orders_listing";

    let storage = make_storage();
    // a day behind the listing scenario so neither sees the other's rows
    let base = Utc::now() + chrono::Duration::days(LISTING_DAYS_AHEAD - 1);
    let times = creation_times_from(base, 3);
    let moved = contract_resource().with_created_at(times[0]);
    let staying = contract_resource().with_created_at(times[1]);
    let moved_id = create_contract_resource(SCENARIO, &storage, moved.clone()).await?;
    let staying_id = create_contract_resource(SCENARIO, &storage, staying).await?;

    let mut scope = open_scope(SCENARIO, &storage, &moved_id).await?;
    let _ = scope.replace(moved.with_created_at(times[2]));
    commit_scope(SCENARIO, scope).await?;

    let ours = |page: Vec<BellResource>| {
        page.into_iter()
            .filter(|r| r.id() == &moved_id || r.id() == &staying_id)
            .collect::<Vec<_>>()
    };

    let from_staying = storage
        .list_resources(Some(&staying_id), None)
        .await
        .map_err(|error| ContractTestFailure::storage_error(SCENARIO, "list_resources", error))?;
    let from_staying = ours(from_staying);
    let observed: Vec<ResourceId> = from_staying.iter().map(|r| r.id().clone()).collect();
    if observed != vec![moved_id.clone(), staying_id.clone()] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("overwritten resource should list as newest, observed {observed:?}"),
        ));
    }
    if from_staying[0].created_at() != times[2] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "listed creation time {} differs from the committed {}",
                from_staying[0].created_at(),
                times[2]
            ),
        ));
    }

    let from_moved = storage
        .list_resources(Some(&moved_id), None)
        .await
        .map_err(|error| ContractTestFailure::storage_error(SCENARIO, "list_resources", error))?;
    let observed: Vec<ResourceId> = ours(from_moved).iter().map(|r| r.id().clone()).collect();
    if observed != vec![moved_id] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("start key should filter by the committed creation time, observed {observed:?}"),
        ));
    }

    Ok(())
}

pub async fn test_same_key_scopes_serialize<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + Clone + 'static,
{
    const SCENARIO: &str = "same_key_scopes_serialize";

    let storage = make_storage();
    let id = create_contract_resource(SCENARIO, &storage, contract_resource()).await?;

    let mut holder = open_scope(SCENARIO, &storage, &id).await?;
    let waiter = tokio::spawn({
        let storage = storage.clone();
        let id = id.clone();
        async move {
            let scope = storage.scoped_resource(&id).await?;
            Ok::<_, StorageError>(scope.resource().map(BellResource::status))
        }
    });

    tokio::time::sleep(BLOCKED_PROBE).await;
    if waiter.is_finished() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "second scope on the same key opened while the first was held",
        ));
    }

    ring_in_scope(SCENARIO, &mut holder)?;
    commit_scope(SCENARIO, holder).await?;

    let observed = waiter
        .await
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?
        .map_err(|error| ContractTestFailure::storage_error(SCENARIO, "scoped_resource", error))?;
    if observed != Some(ResourceStatus::Using) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("waiting scope should see the committed change, observed {observed:?}"),
        ));
    }

    Ok(())
}

pub async fn test_different_keys_do_not_block<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + 'static,
{
    const SCENARIO: &str = "different_keys_do_not_block";

    let storage = make_storage();
    let left = create_contract_resource(SCENARIO, &storage, contract_resource()).await?;
    let right = create_contract_resource(SCENARIO, &storage, contract_resource()).await?;

    let _held = open_scope(SCENARIO, &storage, &left).await?;
    let other = tokio::time::timeout(BLOCKED_PROBE * 10, open_scope(SCENARIO, &storage, &right))
        .await
        .map_err(|_| {
            ContractTestFailure::assertion(SCENARIO, "scope on another key was blocked")
        })??;

    if other.resource().map(|resource| resource.id()) != Some(&right) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "scope on another key loaded the wrong resource",
        ));
    }

    Ok(())
}

pub async fn test_concurrent_updates_are_not_lost<F, S>(make_storage: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: ResourceStorage + Clone + 'static,
{
    const SCENARIO: &str = "concurrent_updates_are_not_lost";
    const WRITERS: u32 = 8;

    let storage = make_storage();
    let id = create_contract_resource(SCENARIO, &storage, contract_resource().with_sticky(true))
        .await?;

    let writers = (0..WRITERS).map(|_| {
        let storage = storage.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let mut scope = storage
                .scoped_resource(&id)
                .await
                .map_err(|error| ContractTestFailure::storage_error(SCENARIO, "scoped_resource", error))?;
            ring_in_scope(SCENARIO, &mut scope)?;
            tokio::task::yield_now().await;
            if let Some(resource) = scope.resource_mut() {
                resource.fail().map_err(|error| {
                    ContractTestFailure::assertion(SCENARIO, format!("fail was rejected: {error}"))
                })?;
            }
            commit_scope(SCENARIO, scope).await
        })
    });

    for outcome in join_all(writers).await {
        outcome.map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))??;
    }

    let stored = load(SCENARIO, &storage, &id).await?;
    let failed_count = stored.as_ref().map(BellResource::failed_count);
    if failed_count != Some(WRITERS) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected failed_count {WRITERS} after serialized updates, observed {failed_count:?}"),
        ));
    }

    Ok(())
}

#[macro_export]
macro_rules! resource_storage_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_storage = $make_storage:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_absent_key_scope_is_empty, test_commit_persists_changes,
                test_concurrent_updates_are_not_lost, test_create_and_load,
                test_delete_returns_last_value, test_different_keys_do_not_block,
                test_duplicate_create_rejected, test_listing_pages_newest_first,
                test_overwritten_creation_time_orders_listing, test_same_key_scopes_serialize,
                test_uncommitted_scope_discards_changes,
            };

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn create_and_load_contract() {
                test_create_and_load($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn duplicate_create_rejected_contract() {
                test_duplicate_create_rejected($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn commit_persists_changes_contract() {
                test_commit_persists_changes($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn uncommitted_scope_discards_changes_contract() {
                test_uncommitted_scope_discards_changes($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn absent_key_scope_is_empty_contract() {
                test_absent_key_scope_is_empty($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn delete_returns_last_value_contract() {
                test_delete_returns_last_value($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn listing_pages_newest_first_contract() {
                test_listing_pages_newest_first($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn overwritten_creation_time_orders_listing_contract() {
                test_overwritten_creation_time_orders_listing($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn same_key_scopes_serialize_contract() {
                test_same_key_scopes_serialize($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn different_keys_do_not_block_contract() {
                test_different_keys_do_not_block($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            $(#[$attr])*
            async fn concurrent_updates_are_not_lost_contract() {
                test_concurrent_updates_are_not_lost($make_storage)
                    .await
                    .expect("resource storage contract failed");
            }
        }
    };
}

pub use resource_storage_contract_tests;
