//! Request-handler style helpers shared by the integration tests.

// not every test binary uses every helper
#![allow(dead_code)]

use std::time::Duration;

use maruberu::{
    Bell, BellResource, DurationMillis, MaruBell, ResourceError, ResourceId, ResourceScope,
    ResourceStorage,
};

/// Longest a test waits for the worker to record an outcome.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn token(duration_ms: u64) -> BellResource {
    BellResource::new(DurationMillis::try_new(duration_ms).unwrap(), None, None).unwrap()
}

pub async fn create<S: ResourceStorage>(storage: &S, resource: BellResource) -> ResourceId {
    let id = resource.id().clone();
    storage
        .create_resource(resource)
        .await
        .expect("resource should be created");
    id
}

/// Rings `id` the way a request handler does: scope, ring, commit.
pub async fn ring_token<S, B>(storage: &S, bell: &B, id: &ResourceId) -> Result<(), ResourceError>
where
    S: ResourceStorage,
    B: Bell,
{
    let mut scope = storage.scoped_resource(id).await.expect("scope should open");
    scope
        .resource_mut()
        .expect("resource should exist")
        .ring(bell)?;
    scope.commit().await.expect("ring should be recorded");
    Ok(())
}

pub async fn load<S: ResourceStorage>(storage: &S, id: &ResourceId) -> BellResource {
    storage
        .scoped_resource(id)
        .await
        .expect("scope should open")
        .take()
        .expect("resource should exist")
}

/// Waits until the bell has written back its last outcome.
pub async fn wait_until_idle(bell: &MaruBell) {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !bell.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bell should settle");
}
