//! A persistently failing operation must open the breaker, stop executing,
//! and be re-probed only after the reset window.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use orq_routines::{BreakerState, LoopSpec, RoutinePool};
use tokio::sync::watch;

#[tokio::test]
async fn failing_op_opens_breaker_then_half_open_probe() {
    let pool = RoutinePool::new();
    let (_tx, rx) = watch::channel(false);
    let attempts = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&attempts);
    pool.start_loop(
        rx,
        LoopSpec {
            key: "failing".to_string(),
            threshold: 2,
            reset_timeout: Duration::from_millis(200),
            interval: Duration::from_millis(20),
        },
        move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("backend unreachable"))
            }
        },
    );

    // Two failures (immediate run + one tick) open the breaker.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let snap = pool.manager("failing").expect("routine exists");
    assert_eq!(snap.state, BreakerState::Open);
    let after_open = attempts.load(Ordering::SeqCst);
    assert_eq!(after_open, 2, "exactly threshold attempts before opening");

    // While open, ticks are refused without invoking the operation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), after_open);

    // After the reset window one probe is admitted; it fails and re-opens.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let probed = attempts.load(Ordering::SeqCst);
    assert!(
        probed >= after_open + 1,
        "a half-open probe should have run after the reset window"
    );
    let snap = pool.manager("failing").expect("routine exists");
    assert_eq!(snap.state, BreakerState::Open, "failed probe re-opens");
}

#[tokio::test]
async fn reset_routine_closes_the_breaker_manually() {
    let pool = RoutinePool::new();
    let (_tx, rx) = watch::channel(false);

    pool.start_loop(
        rx,
        LoopSpec {
            key: "resettable".to_string(),
            threshold: 1,
            reset_timeout: Duration::from_secs(3600),
            interval: Duration::from_secs(3600),
        },
        || async { Err(anyhow!("always fails")) },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        pool.manager("resettable").expect("exists").state,
        BreakerState::Open
    );

    assert!(pool.reset_routine("resettable"));
    assert_eq!(
        pool.manager("resettable").expect("exists").state,
        BreakerState::Closed
    );
}
