// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lock exclusion specs
//!
//! Verify exclusive/shared compatibility and reentrancy under load.

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_and_shared_holders_never_coexist() {
    let plane = plane(ControlConfig::new());
    let exclusive = Arc::new(AtomicUsize::new(0));
    let shared = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..32 {
        let plane = Arc::clone(&plane);
        let (exclusive, shared, violations) = (
            Arc::clone(&exclusive),
            Arc::clone(&shared),
            Arc::clone(&violations),
        );
        tasks.push(tokio::spawn(async move {
            let mode = if i % 4 == 0 {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            };
            let holder = HolderId::new(format!("worker-{}", i));
            let result: Result<(), ControlError<Failure>> = plane
                .run_with_lock("config", &holder, mode, Some(Duration::from_secs(30)), || async {
                    let counter = match mode {
                        LockMode::Exclusive => &exclusive,
                        LockMode::Shared => &shared,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (x, s) = (exclusive.load(Ordering::SeqCst), shared.load(Ordering::SeqCst));
                    if x > 1 || (x > 0 && s > 0) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(result.is_ok(), "worker-{} failed: {:?}", i, result);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(plane.locks().holders("config").is_empty());
}

#[tokio::test]
async fn holder_reacquires_in_any_mode_without_blocking() {
    let plane = plane(ControlConfig::new());
    let holder = HolderId::new("task-1");

    assert!(
        plane
            .acquire_lock("db", &holder, LockMode::Exclusive, Duration::ZERO)
            .await
    );
    assert!(
        plane
            .acquire_lock("db", &holder, LockMode::Shared, Duration::ZERO)
            .await
    );
    assert!(
        plane
            .acquire_lock("db", &holder, LockMode::Exclusive, Duration::ZERO)
            .await
    );

    assert!(plane.release_lock("db", &holder));
    assert!(plane.locks().holders("db").is_empty());
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order() {
    let plane = plane(ControlConfig::new());
    plane
        .acquire_lock("db", &HolderId::new("owner"), LockMode::Exclusive, Duration::ZERO)
        .await;
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for name in ["first", "second", "third"] {
        let worker = Arc::clone(&plane);
        let order = Arc::clone(&order);
        let queued = plane.locks().waiting_count("db");
        tasks.push(tokio::spawn(async move {
            let holder = HolderId::new(name);
            let result: Result<(), ControlError<Failure>> = worker
                .run_with_lock("db", &holder, LockMode::Exclusive, Some(Duration::from_secs(60)), || async {
                    order.lock().unwrap().push(name);
                    Ok(())
                })
                .await;
            assert!(result.is_ok());
        }));
        while plane.locks().waiting_count("db") == queued {
            tokio::task::yield_now().await;
        }
    }

    plane.release_lock("db", &HolderId::new("owner"));
    for task in tasks {
        task.await.unwrap();
    }

    similar_asserts::assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}
