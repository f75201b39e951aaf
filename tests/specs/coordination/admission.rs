// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission control and resource queue specs

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn category_and_global_bounds_hold_end_to_end() {
    let plane = plane(small_config());
    let in_x = Arc::new(Occupancy::default());
    let total = Arc::new(Occupancy::default());

    let mut tasks = Vec::new();
    for (i, category) in ["x", "x", "x", "y", "y", "z"].into_iter().enumerate() {
        let plane = Arc::clone(&plane);
        let (in_x, total) = (Arc::clone(&in_x), Arc::clone(&total));
        tasks.push(tokio::spawn(async move {
            let task_id = format!("task-{}", i);
            let result: Result<(), ControlError<Failure>> = plane
                .run_with_concurrency(&task_id, category, Duration::from_secs(30), 0, || async {
                    total.enter();
                    if category == "x" {
                        in_x.enter();
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if category == "x" {
                        in_x.leave();
                    }
                    total.leave();
                    Ok(())
                })
                .await;
            assert!(result.is_ok());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(in_x.peak(), 1);
    assert!(total.peak() <= 2);
    assert_eq!(plane.limiter().active_count(), 0);
}

#[tokio::test]
async fn permits_return_to_pre_acquire_values() {
    let plane = plane(small_config());
    let global = plane.limiter().global_available();
    let category = plane.limiter().category_available("x");

    assert!(plane.acquire_slot("t1", "x", Duration::ZERO).await);
    assert!(plane.release_slot("t1"));

    assert_eq!(plane.limiter().global_available(), global);
    assert_eq!(plane.limiter().category_available("x"), category);
}

#[tokio::test(start_paused = true)]
async fn starved_category_does_not_strand_global_capacity() {
    let plane = plane(small_config());
    assert!(plane.acquire_slot("hog", "x", Duration::ZERO).await);

    // each attempt takes the last global permit, then gives it back
    for i in 0..3 {
        assert!(!plane.acquire_slot(&format!("starved-{}", i), "x", Duration::from_millis(50)).await);
    }

    assert!(plane.acquire_slot("other", "y", Duration::ZERO).await);
}

#[tokio::test(start_paused = true)]
async fn resource_queue_serves_priority_then_arrival() {
    let plane = plane(ControlConfig::new());
    assert!(plane.request_resource("camera", "owner", 0, Duration::ZERO).await);

    let mut waiters = Vec::new();
    for (requester, priority) in [("background", 9), ("interactive", 1), ("batch", 9)] {
        let worker = Arc::clone(&plane);
        let queued = plane.queue().queue_len("camera");
        waiters.push(tokio::spawn(async move {
            worker
                .request_resource("camera", requester, priority, Duration::from_secs(60))
                .await
        }));
        while plane.queue().queue_len("camera") == queued {
            tokio::task::yield_now().await;
        }
    }

    let mut served = Vec::new();
    while let Some(next) = plane.release_resource("camera") {
        served.push(next);
    }
    for waiter in waiters {
        assert!(waiter.await.unwrap());
    }

    similar_asserts::assert_eq!(
        served,
        ["interactive", "background", "batch"].map(String::from).to_vec()
    );
}
