//! Property-based tests for container sync convergence
//!
//! For any sequence of runtime listings, one sync pass must leave the catalog
//! holding exactly the listed ids with their listed statuses, and a second
//! pass over the same listing must change nothing.

mod common;

use chrono::Utc;
use common::{container, reconciler_with, FakeRuntime};
use fleet_manager::reconciler::diff_containers;
use fleet_manager::runtime::RuntimeContainer;
use fleet_manager::state::{ContainerStatus, ManagedContainer};
use fleet_manager::SyncOutcome;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn status_strategy() -> impl Strategy<Value = ContainerStatus> {
    prop_oneof![
        Just(ContainerStatus::Created),
        Just(ContainerStatus::Running),
        Just(ContainerStatus::Paused),
        Just(ContainerStatus::Exited),
        Just(ContainerStatus::Dead),
    ]
}

/// Small id space so listings overlap between steps.
fn listing_strategy() -> impl Strategy<Value = Vec<RuntimeContainer>> {
    prop::collection::vec((0u8..8, status_strategy()), 0..8).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(n, status)| container(&format!("c{}", n), status))
            .collect()
    })
}

/// What the catalog should hold after syncing `listing`: last entry per id wins.
fn expected(listing: &[RuntimeContainer]) -> BTreeMap<String, ContainerStatus> {
    listing.iter().map(|c| (c.id.clone(), c.status)).collect()
}

fn apply(
    persisted: &[ManagedContainer],
    listing: &[RuntimeContainer],
) -> Vec<ManagedContainer> {
    let changes = diff_containers("h1", persisted, listing, Utc::now());
    let mut rows: BTreeMap<String, ManagedContainer> = persisted
        .iter()
        .map(|c| (c.id.clone(), c.clone()))
        .collect();
    for id in &changes.deletes {
        rows.remove(id);
    }
    for (id, status) in &changes.status_updates {
        if let Some(row) = rows.get_mut(id) {
            row.status = *status;
        }
    }
    for insert in changes.inserts {
        rows.insert(insert.id.clone(), insert);
    }
    rows.into_values().collect()
}

proptest! {
    #[test]
    fn prop_diff_converges_in_one_pass(
        steps in prop::collection::vec(listing_strategy(), 1..6)
    ) {
        let mut persisted: Vec<ManagedContainer> = Vec::new();
        for listing in &steps {
            persisted = apply(&persisted, listing);

            let held: BTreeMap<String, ContainerStatus> =
                persisted.iter().map(|c| (c.id.clone(), c.status)).collect();
            prop_assert_eq!(&held, &expected(listing));

            let again = diff_containers("h1", &persisted, listing, Utc::now());
            prop_assert!(again.is_empty(), "second pass not empty: {:?}", again);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_sync_converges_against_catalog(
        steps in prop::collection::vec(listing_strategy(), 1..5)
    ) {
        let rt = tokio::runtime::Runtime::new().expect("Failed to build runtime");
        rt.block_on(async {
            let runtime = FakeRuntime::new();
            let (_store, reconciler) = reconciler_with(runtime.clone()).await;

            for listing in &steps {
                runtime.set_containers(listing.clone());
                let outcome = reconciler.sync_containers().await.unwrap();
                let report = match outcome {
                    SyncOutcome::Synced(report) => report,
                    SyncOutcome::RuntimeUnavailable => panic!("runtime is up"),
                };

                let want = expected(listing);
                let held: BTreeMap<String, ContainerStatus> = reconciler
                    .list_containers(None)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|c| (c.id, c.status))
                    .collect();
                assert_eq!(held, want);

                let running = want.values().filter(|s| **s == ContainerStatus::Running).count();
                assert_eq!(report.system.total_containers as usize, want.len());
                assert_eq!(report.system.running_containers as usize, running);
            }
        });
    }
}
