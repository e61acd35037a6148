use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use coursegen_infra::{BreakerConfig, BreakerError, BreakerRegistry, CircuitState};

fn config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        failure_window: Duration::from_secs(60),
        recovery_timeout: Duration::from_secs(30),
        call_timeout: Duration::from_secs(10),
    }
}

#[tokio::test(start_paused = true)]
async fn full_cycle_through_the_registry() {
    let registry = BreakerRegistry::new(config());
    let breaker = registry.get("generation");
    let attempts = Arc::new(AtomicUsize::new(0));

    let call = |ok: bool| {
        let attempts = attempts.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            if ok { Ok(()) } else { Err("503") }
        }
    };

    for _ in 0..3 {
        let result = breaker.call(call(false), |_| true).await;
        assert!(matches!(result, Err(BreakerError::Inner("503"))));
    }
    assert_eq!(registry.snapshot()["generation"], CircuitState::Open);

    // Open: rejected with no attempt.
    let result = breaker.call(call(true), |_| true).await;
    assert!(matches!(result, Err(BreakerError::Open { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Trial fails: reopened, timer restarted.
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(breaker.call(call(false), |_| true).await.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    tokio::time::advance(Duration::from_secs(15)).await;
    assert!(matches!(
        breaker.call(call(true), |_| true).await,
        Err(BreakerError::Open { .. })
    ));

    // Trial succeeds: closed again.
    tokio::time::advance(Duration::from_secs(15)).await;
    assert!(breaker.call(call(true), |_| true).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn only_one_trial_while_half_open() {
    let registry = BreakerRegistry::new(config());
    let breaker = registry.get("generation");
    for _ in 0..3 {
        let _ = breaker.call(async { Err::<(), _>("timeout") }, |_| true).await;
    }
    tokio::time::advance(Duration::from_secs(30)).await;

    let trial = breaker.try_acquire().expect("one trial after recovery timeout");
    assert!(trial.is_trial());
    for _ in 0..5 {
        assert!(breaker.try_acquire().is_none());
    }
    trial.failure();
    assert_eq!(breaker.state(), CircuitState::Open);
}
