//! Integration tests for the polling loop.
//!
//! These tests verify that:
//! - Transient failures are retried with the configured backoff
//! - A fatal failure stops the loop without retries
//! - Deadline and cancellation end the loop with distinct outcomes

use async_trait::async_trait;
use chatflow_core::{BackoffPolicy, FailureKind};
use chatflow_polling::{
    FlakyService, PollAttemptOutcome, PollFailure, PollOutcome, PollTarget, PollingActivity,
    PollingLoop,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn scenario_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(30))
}

/// Probe that always refuses.
struct Forbidden {
    probes: AtomicU32,
}

#[async_trait]
impl PollTarget for Forbidden {
    type Output = ();

    async fn probe(&self) -> PollAttemptOutcome<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        PollAttemptOutcome::FatalFailure("403 Forbidden".to_string())
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_outages_then_success() {
    let service = Arc::new(FlakyService::new(3));
    let mut polling = PollingLoop::new(PollingActivity::new(Arc::clone(&service)), scenario_backoff());
    let started = Instant::now();

    let report = polling.run(None).await;

    assert_eq!(
        report.outcome,
        PollOutcome::Succeeded("OK after 4 calls".to_string())
    );
    assert_eq!(report.attempts, 4);
    assert_eq!(
        report.delays,
        [1, 2, 4].map(Duration::from_secs).to_vec()
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
    assert_eq!(service.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_k_transient_failures_take_k_plus_one_attempts() {
    for k in 0..6 {
        let service = Arc::new(FlakyService::new(k));
        let mut polling = PollingLoop::new(PollingActivity::new(service), scenario_backoff());

        let report = polling.run(None).await;

        assert!(report.succeeded());
        assert_eq!(report.attempts, k + 1);
        let expected: Vec<Duration> = (0..k)
            .map(|n| scenario_backoff().capped_delay(n))
            .collect();
        assert_eq!(report.delays, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_is_not_retried() {
    let mut polling = PollingLoop::new(
        Forbidden {
            probes: AtomicU32::new(0),
        },
        scenario_backoff(),
    );

    let report = polling.run(None).await;

    assert_eq!(
        report.outcome,
        PollOutcome::Failed(PollFailure::Fatal {
            cause: "403 Forbidden".to_string()
        })
    );
    assert_eq!(report.attempts, 1);
    assert!(report.delays.is_empty());
    assert_eq!(polling.target().probes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exceeded_while_service_stays_down() {
    let service = Arc::new(FlakyService::new(u32::MAX));
    let mut polling = PollingLoop::new(PollingActivity::new(service), scenario_backoff());

    let report = polling.run(Some(Duration::from_secs(10))).await;

    let PollOutcome::Failed(failure) = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert_eq!(failure.kind(), FailureKind::DeadlineExceeded);
    // Probes at 0s, 1s, 3s and 7s; the next wait would end at 15s.
    assert_eq!(report.attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_wait_is_distinct() {
    let service = Arc::new(FlakyService::new(u32::MAX));
    let mut polling = PollingLoop::new(PollingActivity::new(Arc::clone(&service)), scenario_backoff());
    let cancel = polling.cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
    });

    let report = polling.run(Some(Duration::from_secs(60))).await;

    assert_eq!(report.outcome, PollOutcome::Failed(PollFailure::Cancelled));
    assert_eq!(report.attempts, 2);
    assert_eq!(service.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_jittered_delays_stay_under_cap() {
    let service = Arc::new(FlakyService::new(8));
    let backoff = BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(5))
        .with_jitter(true);
    let mut polling = PollingLoop::new(PollingActivity::new(service), backoff);

    let report = polling.run(None).await;

    assert!(report.succeeded());
    assert_eq!(report.delays.len(), 8);
    for (n, delay) in (0_u32..).zip(&report.delays) {
        let capped = backoff.capped_delay(n);
        assert!(*delay <= capped);
        assert!(*delay >= capped / 2);
    }
}
