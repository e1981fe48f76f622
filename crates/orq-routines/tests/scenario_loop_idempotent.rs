//! Starting the same key repeatedly must yield exactly one loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orq_routines::{LoopSpec, RoutinePool};
use tokio::sync::watch;

fn spec(key: &str, interval: Duration) -> LoopSpec {
    LoopSpec {
        key: key.to_string(),
        threshold: 3,
        reset_timeout: Duration::from_millis(200),
        interval,
    }
}

#[tokio::test]
async fn start_loop_is_idempotent_per_key() {
    let pool = RoutinePool::new();
    let (_tx, rx) = watch::channel(false);
    let count = Arc::new(AtomicU32::new(0));

    let mut spawned = 0;
    for _ in 0..5 {
        let c = Arc::clone(&count);
        let started = pool.start_loop(rx.clone(), spec("sync", Duration::from_millis(20)), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        if started {
            spawned += 1;
        }
    }

    assert_eq!(spawned, 1, "only the first start may spawn a loop");
    assert!(pool.is_loop_active("sync"));

    tokio::time::sleep(Duration::from_millis(110)).await;
    let executed = count.load(Ordering::SeqCst);

    // One immediate run plus interval ticks. Five loops would have run ~25x.
    assert!(
        (1..=10).contains(&executed),
        "expected a single loop's cadence, got {executed}"
    );
}

#[tokio::test]
async fn shutdown_removes_key_from_active_tracking() {
    let pool = RoutinePool::new();
    let (tx, rx) = watch::channel(false);

    pool.start_loop(rx, spec("stoppable", Duration::from_millis(10)), || async {
        Ok(())
    });
    assert!(pool.is_loop_active("stoppable"));

    tx.send(true).expect("send shutdown");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!pool.is_loop_active("stoppable"));
    // The breaker snapshot stays inspectable after termination.
    let snap = pool.manager("stoppable").expect("snapshot kept");
    assert!(!snap.loop_active);

    // A fresh start after termination is a first start again.
    let (_tx2, rx2) = watch::channel(false);
    assert!(pool.start_loop(rx2, spec("stoppable", Duration::from_millis(10)), || async {
        Ok(())
    }));
}
