//! Force trigger provokes immediate execution on an hourly loop, unless the
//! breaker is open.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use orq_routines::{BreakerState, LoopSpec, RoutinePool};
use tokio::sync::watch;

#[tokio::test]
async fn force_update_runs_op_immediately_on_slow_interval() {
    let pool = RoutinePool::new();
    let (_tx, rx) = watch::channel(false);
    let count = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&count);
    pool.start_loop(
        rx,
        LoopSpec {
            key: "hourly".to_string(),
            threshold: 3,
            reset_timeout: Duration::from_millis(200),
            interval: Duration::from_secs(3600),
        },
        move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "immediate first run only");

    assert!(pool.force_update("hourly"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2, "trigger ran the op");
}

#[tokio::test]
async fn force_update_is_ineffective_while_breaker_open() {
    let pool = RoutinePool::new();
    let (_tx, rx) = watch::channel(false);
    let count = Arc::new(AtomicU32::new(0));

    let c = Arc::clone(&count);
    pool.start_loop(
        rx,
        LoopSpec {
            key: "broken-hourly".to_string(),
            threshold: 1,
            reset_timeout: Duration::from_secs(3600),
            interval: Duration::from_secs(3600),
        },
        move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("always fails"))
            }
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(
        pool.manager("broken-hourly").expect("exists").state,
        BreakerState::Open
    );

    // The trigger is accepted onto the channel, but the breaker refuses the
    // execution: the operation must not run.
    pool.force_update("broken-hourly");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "open breaker blocks trigger");
}

#[tokio::test]
async fn force_update_on_unknown_key_is_a_noop() {
    let pool = RoutinePool::new();
    assert!(!pool.force_update("nope"));
}
