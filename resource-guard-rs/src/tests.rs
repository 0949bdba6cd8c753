use std::sync::Arc;
use std::time::Duration;

use super::*;

fn guard(max_requests: u32, window_secs: u64) -> ResourceGuard {
    ResourceGuard::new(
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(window_secs),
        },
        CircuitBreakerConfig {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
            max_cooldown: Duration::from_secs(300),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn eleventh_call_in_window_is_rate_limited() {
    let guard = guard(10, 60);
    for _ in 0..10 {
        let permit = guard.admit().expect("within limit");
        guard.record_success(permit);
    }

    let denial = guard.admit().unwrap_err();
    assert_eq!(denial.resource(), ExhaustedResource::RateLimit);
    let retry = denial.retry_after_seconds();
    assert!(retry > 0 && retry <= 60, "retry_after_seconds = {retry}");

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(guard.admit().is_ok());
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_five_failures() {
    let guard = guard(100, 60);
    for _ in 0..5 {
        let permit = guard.admit().expect("closed breaker admits");
        guard.record_failure(permit);
    }
    assert_eq!(guard.circuit_state(), CircuitState::Open);

    let denial = guard.admit().unwrap_err();
    assert_eq!(denial.resource(), ExhaustedResource::CircuitOpen);
    assert_eq!(denial.retry_after_seconds(), 30);

    let status = guard.status();
    assert_eq!(status.circuit_state, CircuitState::Open);
    assert_eq!(status.cooldown_remaining_secs, Some(30));
    assert_eq!(status.requests_in_window, 5);
}

#[tokio::test(start_paused = true)]
async fn probe_after_cooldown_closes_on_success() {
    let guard = guard(100, 60);
    for _ in 0..5 {
        let permit = guard.admit().unwrap();
        guard.record_failure(permit);
    }

    tokio::time::advance(Duration::from_secs(30)).await;
    let probe = guard.admit().expect("probe admitted");
    assert!(probe.is_probe());
    assert_eq!(guard.circuit_state(), CircuitState::HalfOpen);
    assert!(matches!(guard.admit(), Err(GuardDenial::CircuitOpen { .. })));

    guard.record_success(probe);
    assert_eq!(guard.circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_call_does_not_claim_probe() {
    let guard = guard(5, 60);
    for _ in 0..5 {
        let permit = guard.admit().unwrap();
        guard.record_failure(permit);
    }

    tokio::time::advance(Duration::from_secs(30)).await;
    // Window still holds five admissions from t=0.
    assert!(matches!(guard.admit(), Err(GuardDenial::RateLimited { .. })));
    assert_eq!(guard.circuit_state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn reset_restores_capacity() {
    let guard = guard(1, 60);
    let permit = guard.admit().unwrap();
    guard.record_failure(permit);
    assert!(guard.admit().is_err());

    guard.reset();
    let status = guard.status();
    assert_eq!(status.requests_in_window, 0);
    assert_eq!(status.circuit_state, CircuitState::Closed);
    assert!(guard.admit().is_ok());
}

#[tokio::test(start_paused = true)]
async fn stale_success_cannot_close_half_open_circuit() {
    let guard = guard(100, 60);
    let mut in_flight = Vec::new();
    for _ in 0..6 {
        in_flight.push(guard.admit().unwrap());
    }
    // Five of six concurrent calls fail and open the circuit.
    let slow = in_flight.pop().unwrap();
    for permit in in_flight {
        guard.record_failure(permit);
    }
    assert_eq!(guard.circuit_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    let probe = guard.admit().expect("probe admitted");

    guard.record_success(slow);
    assert_eq!(guard.circuit_state(), CircuitState::HalfOpen);
    assert!(matches!(guard.admit(), Err(GuardDenial::CircuitOpen { .. })));

    guard.record_success(probe);
    assert_eq!(guard.circuit_state(), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_the_limit() {
    const LIMIT: u32 = 25;
    let guard = Arc::new(guard(LIMIT, 60));

    let callers: Vec<_> = (0..LIMIT + 15)
        .map(|_| {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.admit().is_ok() })
        })
        .collect();

    let mut admitted = 0;
    for caller in callers {
        if caller.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, LIMIT);
    assert_eq!(guard.status().requests_in_window, LIMIT);
}

#[test]
fn denial_lifts_into_resource_exhausted_error() {
    let denial = GuardDenial::RateLimited {
        retry_after: Duration::from_millis(1_200),
    };
    let err = denial.to_error();
    assert_eq!(err.kind, ErrorKind::ResourceExhausted);
    assert!(err.is_transient());
    assert_eq!(err.context["retry_after_seconds"], 2);
}
