// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Failover specs
//!
//! Probes are driven by a shared switchboard; failure ages come from a fake
//! clock.

use crate::prelude::*;
use async_trait::async_trait;
use bulwark_core::HealthCheck;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Clone, Default)]
struct Switchboard {
    down: Arc<Mutex<HashSet<String>>>,
}

impl Switchboard {
    fn down(&self, device: &str) {
        self.down.lock().unwrap().insert(device.to_string());
    }

    fn up(&self, device: &str) {
        self.down.lock().unwrap().remove(device);
    }
}

#[async_trait]
impl HealthCheck for Switchboard {
    async fn check(&self, device: &DeviceId) -> Result<(), HealthError> {
        if self.down.lock().unwrap().contains(device.as_str()) {
            Err(HealthError::Unreachable(device.to_string()))
        } else {
            Ok(())
        }
    }
}

fn ids(names: &[&str]) -> Vec<DeviceId> {
    names.iter().map(|n| DeviceId::new(*n)).collect()
}

fn failover_plane(clock: FakeClock, board: &Switchboard, devices: &[&str]) -> ControlPlane<FakeClock> {
    init_tracing();
    let plane = ControlPlane::with_clock(ControlConfig::new(), clock).unwrap();
    for device in devices {
        plane
            .failover()
            .register_health_check(DeviceId::new(*device), board.clone());
    }
    plane
}

#[tokio::test]
async fn unhealthy_candidate_is_skipped_and_old_primary_recovers() {
    let clock = FakeClock::new();
    let board = Switchboard::default();
    let plane = failover_plane(clock.clone(), &board, &["p", "s1", "s2"]);
    let failover = plane.failover();
    failover
        .register_service("camera", DeviceId::new("p"), ids(&["s1", "s2"]))
        .unwrap();
    board.down("p");
    board.down("s1");

    let promoted = failover.failover("camera").await.unwrap();

    assert_eq!(promoted, DeviceId::new("s2"));
    assert!(failover.failed("camera").contains(&DeviceId::new("p")));

    board.up("p");
    clock.advance(failover.config().recovery_timeout);
    failover.recover("camera").await.unwrap();

    similar_asserts::assert_eq!(failover.secondaries("camera"), ids(&["p"]));
    assert_eq!(failover.primary("camera"), Some(DeviceId::new("s2")));
}

#[tokio::test]
async fn maintenance_tick_drives_failover() {
    let clock = FakeClock::new();
    let board = Switchboard::default();
    let plane = failover_plane(clock.clone(), &board, &["a", "b"]);
    plane
        .failover()
        .register_service("weather", DeviceId::new("a"), ids(&["b"]))
        .unwrap();
    board.down("a");

    let report = plane.maintenance_tick().await;

    let monitor = report.monitor.unwrap();
    assert_eq!(monitor.promoted.get("weather"), Some(&DeviceId::new("b")));
    assert_eq!(plane.failover().primary("weather"), Some(DeviceId::new("b")));
    let status = plane.status();
    assert_eq!(status.failover.services["weather"].failovers, 1);
}

#[tokio::test]
async fn failed_devices_are_never_discarded() {
    let clock = FakeClock::new();
    let board = Switchboard::default();
    let plane = failover_plane(clock.clone(), &board, &["a", "b", "c"]);
    let failover = plane.failover();
    failover
        .register_service("arm", DeviceId::new("a"), ids(&["b", "c"]))
        .unwrap();
    board.down("a");
    board.down("b");
    failover.failover("arm").await.unwrap();

    // b keeps failing; it stays in the failed set rather than vanishing
    clock.advance(failover.config().recovery_timeout);
    board.up("a");
    let recovered = failover.recover("arm").await.unwrap();

    assert_eq!(recovered, ids(&["a"]));
    assert_eq!(failover.failed("arm"), ids(&["b"]));

    board.up("b");
    clock.advance(failover.config().recovery_timeout);
    failover.recover("arm").await.unwrap();
    similar_asserts::assert_eq!(failover.secondaries("arm"), ids(&["a", "b"]));
}
