//! Admission under contention and outcome bookkeeping over many rings.

mod common;

use futures::future::join_all;
use maruberu::{MaruBell, ResourceError, ResourceStatus};
use maruberu_memory::InMemoryResourceStorage;
use maruberu_testing::{Outcome, ScriptedActuator};
use proptest::prelude::*;

use common::{create, load, ring_token, token, wait_until_idle};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rings_admit_exactly_one() {
    let storage = InMemoryResourceStorage::new();
    let (actuator, gate) = ScriptedActuator::gated();
    let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator.clone());
    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(create(&storage, token(100)).await);
    }

    let results = join_all(ids.iter().map(|id| {
        let storage = storage.clone();
        let bell = bell.clone();
        let id = id.clone();
        tokio::spawn(async move { ring_token(&storage, &bell, &id).await })
    }))
    .await;

    let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    let admitted = results.iter().filter(|result| result.is_ok()).count();
    let busy = results
        .iter()
        .filter(|result| **result == Err(ResourceError::Busy))
        .count();
    assert_eq!((admitted, busy), (1, 15));

    gate.open(1);
    wait_until_idle(&bell).await;
    let mut statuses = Vec::new();
    for id in &ids {
        statuses.push(load(&storage, id).await.status());
    }
    assert_eq!(
        statuses
            .iter()
            .filter(|status| **status == ResourceStatus::Used)
            .count(),
        1
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|status| **status == ResourceStatus::Unused)
            .count(),
        15
    );
    assert_eq!(actuator.call_count(), 1);
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![Just(Outcome::Success), Just(Outcome::Failure)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A sticky token in an open window stays usable whatever the actuator
    /// does, and its failure count is the length of the trailing failure run.
    #[test]
    fn sticky_token_tracks_trailing_failures(outcomes in prop::collection::vec(outcome(), 1..8)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (status, failed_count) = rt.block_on(async {
            let storage = InMemoryResourceStorage::new();
            let actuator = ScriptedActuator::with_outcomes(outcomes.clone());
            let (bell, _worker) = MaruBell::spawn(storage.clone(), actuator);
            let id = create(&storage, token(10).with_sticky(true)).await;

            for _ in &outcomes {
                ring_token(&storage, &bell, &id).await.unwrap();
                wait_until_idle(&bell).await;
            }

            let rung = load(&storage, &id).await;
            (rung.status(), rung.failed_count())
        });

        let trailing_failures = outcomes
            .iter()
            .rev()
            .take_while(|outcome| **outcome == Outcome::Failure)
            .count();
        prop_assert_eq!(status, ResourceStatus::Unused);
        prop_assert_eq!(usize::try_from(failed_count).unwrap(), trailing_failures);
    }
}
