// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control plane lifecycle specs
//!
//! Verify start/stop, background cleanup and status snapshots.

use crate::prelude::*;

#[tokio::test]
async fn stop_is_safe_without_start() {
    let plane = plane(ControlConfig::new());

    plane.stop().await;
    plane.stop().await;

    assert!(!plane.is_running());
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_the_maintenance_loop() {
    let plane = plane(ControlConfig::new());

    assert!(plane.start());
    assert!(plane.is_running());
    assert!(plane.status().running);

    plane.stop().await;
    assert!(!plane.is_running());
}

#[tokio::test(start_paused = true)]
async fn background_loop_reclaims_abandoned_slots_and_locks() {
    let clock = FakeClock::new();
    let config = small_config()
        .with_cleanup_interval(Duration::from_secs(1))
        .with_lock_lease(Duration::from_secs(30))
        .with_slot_lease(Duration::from_secs(30));
    init_tracing();
    let plane = bulwark_core::ControlPlane::with_clock(config, clock.clone()).unwrap();
    assert!(plane.acquire_slot("crashed", "x", Duration::ZERO).await);
    assert!(
        plane
            .acquire_lock("db", &HolderId::new("crashed"), LockMode::Exclusive, Duration::ZERO)
            .await
    );

    plane.start();
    clock.advance(Duration::from_secs(31));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(plane.limiter().active_count(), 0);
    assert_eq!(plane.limiter().global_available(), 2);
    assert!(plane.locks().holders("db").is_empty());
    plane.stop().await;
}

#[tokio::test]
async fn status_reports_every_manager() {
    let plane = plane(small_config());
    assert!(plane.acquire_slot("t1", "x", Duration::ZERO).await);
    assert!(
        plane
            .acquire_lock("db", &HolderId::new("t1"), LockMode::Exclusive, Duration::ZERO)
            .await
    );
    assert!(plane.request_resource("camera", "t1", 0, Duration::ZERO).await);

    let status = plane.status();

    assert_eq!(status.locks.active_locks, 1);
    assert_eq!(status.limiter.global_active, 1);
    similar_asserts::assert_eq!(
        status.limiter.categories["x"].active,
        status.limiter.categories["x"].limit
    );
    assert_eq!(status.queue.busy, 1);
    let json = status.to_json().unwrap();
    assert!(json.contains("\"camera\""));
    assert!(json.contains("\"exclusive\""));
}
