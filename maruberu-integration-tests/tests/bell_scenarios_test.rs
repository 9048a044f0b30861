//! End-to-end ring scenarios against the in-memory backend.
//!
//! Each test wires a `MaruBell` worker to `InMemoryResourceStorage` and a
//! scripted actuator, rings through a storage scope like a request handler,
//! and checks the state the worker writes back.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use maruberu::{
    seed_sample_resources, BellResource, DurationMillis, MaruBell, ResourceError, ResourceScope,
    ResourceStatus, ResourceStorage,
};
use maruberu_memory::InMemoryResourceStorage;
use maruberu_testing::{Outcome, ScriptedActuator};
use tracing_test::traced_test;

use common::{create, load, ring_token, token, wait_until_idle};

#[tokio::test]
async fn one_time_token_is_used_after_successful_ring() {
    let storage = InMemoryResourceStorage::new();
    let actuator = ScriptedActuator::succeeding();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000)).await;

    ring_token(&storage, &bell, &id).await.unwrap();
    wait_until_idle(&bell).await;

    let rung = load(&storage, &id).await;
    assert_eq!(rung.status(), ResourceStatus::Used);
    assert_eq!(actuator.durations(), vec![DurationMillis::try_new(1000).unwrap()]);
    assert_eq!(
        ring_token(&storage, &bell, &id).await,
        Err(ResourceError::Disabled)
    );
}

#[tokio::test]
async fn sticky_token_rings_again_after_success() {
    let storage = InMemoryResourceStorage::new();
    let actuator = ScriptedActuator::succeeding();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000).with_sticky(true)).await;

    ring_token(&storage, &bell, &id).await.unwrap();
    wait_until_idle(&bell).await;
    assert_eq!(load(&storage, &id).await.status(), ResourceStatus::Unused);

    ring_token(&storage, &bell, &id).await.unwrap();
    wait_until_idle(&bell).await;

    assert_eq!(load(&storage, &id).await.status(), ResourceStatus::Unused);
    assert_eq!(actuator.call_count(), 2);
}

#[tokio::test]
async fn token_before_its_window_is_rejected_untouched() {
    let storage = InMemoryResourceStorage::new();
    let actuator = ScriptedActuator::succeeding();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let not_before = Utc::now() + ChronoDuration::days(365);
    let future = BellResource::new(DurationMillis::try_new(1000).unwrap(), Some(not_before), None)
        .unwrap();
    let id = create(&storage, future).await;

    let result = ring_token(&storage, &bell, &id).await;

    assert_eq!(result, Err(ResourceError::BeforePeriod));
    assert_eq!(load(&storage, &id).await.status(), ResourceStatus::Unused);
    assert!(bell.is_idle());
    assert_eq!(actuator.call_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn three_failed_rings_raise_diagnostic_but_keep_token_usable() {
    let storage = InMemoryResourceStorage::new();
    let actuator = ScriptedActuator::failing();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000).with_sticky(true)).await;

    for _ in 0..3 {
        ring_token(&storage, &bell, &id).await.unwrap();
        wait_until_idle(&bell).await;
    }

    let failed = load(&storage, &id).await;
    assert_eq!(failed.failed_count(), 3);
    assert_eq!(failed.status(), ResourceStatus::Unused);
    assert!(logs_contain("[bell.actuate] ring failed"));
    assert!(logs_contain("failed 3 times"));
}

#[tokio::test]
async fn success_after_failures_resets_failed_count() {
    let storage = InMemoryResourceStorage::new();
    let actuator = ScriptedActuator::with_outcomes([Outcome::Failure, Outcome::Failure]);
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000)).await;

    for expected_failures in 1..=2 {
        ring_token(&storage, &bell, &id).await.unwrap();
        wait_until_idle(&bell).await;
        assert_eq!(load(&storage, &id).await.failed_count(), expected_failures);
    }
    ring_token(&storage, &bell, &id).await.unwrap();
    wait_until_idle(&bell).await;

    let rung = load(&storage, &id).await;
    assert_eq!(rung.failed_count(), 0);
    assert_eq!(rung.status(), ResourceStatus::Used);
}

#[tokio::test]
async fn ring_while_another_is_in_flight_is_busy() {
    let storage = InMemoryResourceStorage::new();
    let (actuator, gate) = ScriptedActuator::gated();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let first = create(&storage, token(1000)).await;
    let second = create(&storage, token(1000)).await;

    ring_token(&storage, &bell, &first).await.unwrap();
    actuator.wait_for_calls(1).await;
    let refused = ring_token(&storage, &bell, &second).await;

    assert_eq!(refused, Err(ResourceError::Busy));
    assert_eq!(load(&storage, &second).await.status(), ResourceStatus::Unused);
    assert_eq!(load(&storage, &first).await.status(), ResourceStatus::Using);

    gate.open(1);
    wait_until_idle(&bell).await;
    assert_eq!(load(&storage, &first).await.status(), ResourceStatus::Used);
    ring_token(&storage, &bell, &second).await.unwrap();
}

#[tokio::test]
async fn same_token_cannot_ring_while_in_use() {
    let storage = InMemoryResourceStorage::new();
    let (actuator, gate) = ScriptedActuator::gated();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000).with_sticky(true)).await;

    ring_token(&storage, &bell, &id).await.unwrap();
    actuator.wait_for_calls(1).await;

    assert_eq!(
        ring_token(&storage, &bell, &id).await,
        Err(ResourceError::InUse)
    );
    gate.open(1);
    wait_until_idle(&bell).await;
}

#[tokio::test]
async fn worker_judges_outcome_against_stored_state() {
    let storage = InMemoryResourceStorage::new();
    let (actuator, gate) = ScriptedActuator::gated();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000)).await;

    ring_token(&storage, &bell, &id).await.unwrap();
    actuator.wait_for_calls(1).await;

    // made sticky after the ring was queued
    let mut scope = storage.scoped_resource(&id).await.unwrap();
    let stored = scope.resource().unwrap().clone().with_sticky(true);
    let _ = scope.replace(stored);
    scope.commit().await.unwrap();

    gate.open(1);
    wait_until_idle(&bell).await;

    assert_eq!(load(&storage, &id).await.status(), ResourceStatus::Unused);
}

#[tokio::test]
async fn window_closing_during_ring_retires_sticky_token() {
    let storage = InMemoryResourceStorage::new();
    let (actuator, gate) = ScriptedActuator::gated();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let not_after = Utc::now() + ChronoDuration::milliseconds(200);
    let closing = BellResource::new(DurationMillis::try_new(1000).unwrap(), None, Some(not_after))
        .unwrap()
        .with_sticky(true);
    let id = create(&storage, closing).await;

    ring_token(&storage, &bell, &id).await.unwrap();
    actuator.wait_for_calls(1).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    gate.open(1);
    wait_until_idle(&bell).await;

    assert_eq!(load(&storage, &id).await.status(), ResourceStatus::Used);
}

#[tokio::test]
async fn shutdown_lets_in_flight_ring_finish() {
    let storage = InMemoryResourceStorage::new();
    let (actuator, gate) = ScriptedActuator::gated();
    let (bell, worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let id = create(&storage, token(1000)).await;

    ring_token(&storage, &bell, &id).await.unwrap();
    actuator.wait_for_calls(1).await;
    bell.shutdown().await;
    assert!(!worker.is_finished());

    gate.open(1);
    worker.await.unwrap();

    assert_eq!(load(&storage, &id).await.status(), ResourceStatus::Used);
    assert!(bell.is_idle());
    let late = create(&storage, token(10)).await;
    assert_eq!(
        ring_token(&storage, &bell, &late).await,
        Err(ResourceError::Busy)
    );
}

#[tokio::test]
async fn seeded_samples_behave_as_documented() {
    let storage = InMemoryResourceStorage::new();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), ScriptedActuator::succeeding());
    seed_sample_resources(&storage).await.unwrap();
    let listed = storage.list_resources(None, None).await.unwrap();
    let id_of = |digit: char| {
        listed
            .iter()
            .find(|resource| resource.id().as_ref().starts_with(digit))
            .map(|resource| resource.id().clone())
            .unwrap()
    };

    assert_eq!(listed.len(), 6);
    assert_eq!(
        ring_token(&storage, &bell, &id_of('4')).await,
        Err(ResourceError::Disabled)
    );
    assert_eq!(
        ring_token(&storage, &bell, &id_of('5')).await,
        Err(ResourceError::BeforePeriod)
    );

    ring_token(&storage, &bell, &id_of('1')).await.unwrap();
    wait_until_idle(&bell).await;
    assert_eq!(load(&storage, &id_of('1')).await.status(), ResourceStatus::Unused);
}
