// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker and retry specs
//!
//! The breaker's clock is faked so cool-downs are instant; backoff sleeps
//! run on paused tokio time.

use crate::prelude::*;
use bulwark_core::CircuitState;

fn breaker_plane(clock: FakeClock) -> ControlPlane<FakeClock> {
    init_tracing();
    let config = small_config().with_breaker(
        BreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_half_open_max_calls(1)
            .with_timeout(Duration::from_secs(30))
            .with_window_size(Duration::from_secs(60)),
    );
    ControlPlane::with_clock(config, clock).unwrap()
}

#[tokio::test(start_paused = true)]
async fn breaker_walks_closed_open_half_open_closed() {
    let clock = FakeClock::new();
    let plane = breaker_plane(clock.clone());
    let breaker = plane.breakers().get_or_create("weather");
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let failed: Result<(), ControlError<Failure>> = breaker
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::Permanent) }
            })
            .await;
        assert!(failed.is_err_and(|e| e.upstream() == Some(&Failure::Permanent)));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // open: rejected without running
    let rejected: Result<(), ControlError<Failure>> = breaker
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
    assert!(rejected.is_err_and(|e| e.is_breaker_open()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(30));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    let first = breaker.can_execute().unwrap();
    assert!(breaker.can_execute().is_none());
    breaker.record_success(first);
    let second = breaker.can_execute().unwrap();
    breaker.record_success(second);

    assert_eq!(breaker.state(), CircuitState::Closed);
    let counters = breaker.counters();
    assert_eq!((counters.rejections, counters.times_opened), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_reopens() {
    let clock = FakeClock::new();
    let plane = breaker_plane(clock.clone());
    let breaker = plane.breakers().get_or_create("camera");
    for _ in 0..3 {
        let call = breaker.can_execute().unwrap();
        breaker.record_failure(call);
    }
    clock.advance(Duration::from_secs(30));

    let probe: Result<(), ControlError<Failure>> =
        breaker.execute(|| async { Err(Failure::Transient) }).await;

    assert!(probe.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn retry_sleeps_k_growing_delays_then_succeeds() {
    let plane = breaker_plane(FakeClock::new());
    let calls = AtomicUsize::new(0);
    let start = tokio::time::Instant::now();

    let result: Result<usize, ControlError<Failure>> = plane
        .execute_with_resilience("llm", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Err(Failure::Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result.ok(), Some(3));
    // 100ms + 200ms
    assert_eq!(start.elapsed(), Duration::from_millis(300));
    assert_eq!(plane.retry().stats().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_budget() {
    let plane = plane(small_config());
    let calls = AtomicUsize::new(0);

    let result: Result<(), ControlError<Failure>> = plane
        .run_with_concurrency("t1", "y", Duration::ZERO, 2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Failure::Transient) }
        })
        .await;

    assert_eq!(result.unwrap_err().into_upstream(), Some(Failure::Transient));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failures_are_not_retried() {
    let plane = plane(small_config());
    let calls = AtomicUsize::new(0);

    let result: Result<(), ControlError<Failure>> = plane
        .execute_with_resilience("db", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Failure::Permanent) }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
