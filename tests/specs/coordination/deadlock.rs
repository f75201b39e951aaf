// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deadlock prevention specs
//!
//! A request that would close a cycle in the wait-for graph is refused
//! without waiting; it is never queued.

use crate::prelude::*;

async fn hold(plane: &ControlPlane, resource: &str, holder: &str) {
    assert!(
        plane
            .acquire_lock(resource, &HolderId::new(holder), LockMode::Exclusive, Duration::ZERO)
            .await
    );
}

fn wait_for(plane: &Arc<ControlPlane>, resource: &'static str, holder: &'static str) -> tokio::task::JoinHandle<bool> {
    let plane = Arc::clone(plane);
    tokio::spawn(async move {
        plane
            .acquire_lock(resource, &HolderId::new(holder), LockMode::Exclusive, Duration::from_secs(60))
            .await
    })
}

async fn until_waiting(plane: &ControlPlane, resource: &str) {
    while plane.locks().waiting_count(resource) == 0 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn crossing_requests_are_rejected_immediately() {
    let plane = plane(ControlConfig::new());
    hold(&plane, "r1", "a").await;
    hold(&plane, "r2", "b").await;
    let a_waits = wait_for(&plane, "r2", "a");
    until_waiting(&plane, "r2").await;
    let start = tokio::time::Instant::now();

    let result: Result<(), ControlError<Failure>> = plane
        .run_with_lock(
            "r1",
            &HolderId::new("b"),
            LockMode::Exclusive,
            Some(Duration::from_secs(60)),
            || async { Ok(()) },
        )
        .await;

    assert!(matches!(result, Err(ControlError::DeadlockRejected { .. })));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(plane.locks().waiting_count("r1"), 0);

    // the rejected side backs off and the survivor proceeds
    plane.release_all(&HolderId::new("b"));
    assert!(a_waits.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn longer_cycles_are_detected() {
    let plane = plane(ControlConfig::new());
    hold(&plane, "r1", "a").await;
    hold(&plane, "r2", "b").await;
    hold(&plane, "r3", "c").await;
    let a_waits = wait_for(&plane, "r2", "a");
    until_waiting(&plane, "r2").await;
    let b_waits = wait_for(&plane, "r3", "b");
    until_waiting(&plane, "r3").await;

    let c_wants_r1 = plane
        .locks()
        .acquire_outcome("r1", &HolderId::new("c"), LockMode::Exclusive, Duration::from_secs(60))
        .await;

    assert_eq!(c_wants_r1, bulwark_core::LockOutcome::DeadlockRejected);

    plane.release_all(&HolderId::new("c"));
    assert!(b_waits.await.unwrap());
    plane.release_all(&HolderId::new("b"));
    assert!(a_waits.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn unrelated_contention_still_waits() {
    let plane = plane(ControlConfig::new());
    hold(&plane, "r1", "a").await;
    let b_waits = wait_for(&plane, "r1", "b");
    until_waiting(&plane, "r1").await;

    // c waiting behind a as well closes no cycle
    let c_waits = wait_for(&plane, "r1", "c");
    while plane.locks().waiting_count("r1") < 2 {
        tokio::task::yield_now().await;
    }

    plane.release_lock("r1", &HolderId::new("a"));
    assert!(b_waits.await.unwrap());
    plane.release_lock("r1", &HolderId::new("b"));
    assert!(c_waits.await.unwrap());
}
