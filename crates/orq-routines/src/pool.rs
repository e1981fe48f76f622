//! Keyed pool of circuit-broken background loops.
//!
//! One pool instance is constructed at startup and injected everywhere a
//! background cycle is registered; tests construct their own isolated pools.
//! Per key the pool holds one [`Breaker`] and at most one loop task. All
//! bookkeeping sits behind a single mutex; the loops themselves are
//! independent tokio tasks.
//!
//! Shutdown is a `watch::Receiver<bool>` flipping to `true`, the sole
//! termination path for a loop. On termination the key leaves active
//! tracking (the breaker snapshot stays inspectable).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::breaker::{Breaker, BreakerState};
use crate::RoutineError;

/// Parameters for one keyed loop. Threshold and reset timeout are fixed by
/// the first start that actually spawns a loop; later idempotent calls for
/// the same key ignore their values.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub key: String,
    pub threshold: u32,
    pub reset_timeout: Duration,
    pub interval: Duration,
}

/// Inspection snapshot of one routine.
#[derive(Debug, Clone)]
pub struct RoutineSnapshot {
    pub key: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub threshold: u32,
    pub in_test: bool,
    pub loop_active: bool,
}

struct Entry {
    breaker: Arc<Mutex<Breaker>>,
    trigger: mpsc::Sender<()>,
    loop_active: bool,
}

#[derive(Clone, Default)]
pub struct RoutinePool {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl RoutinePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a circuit-broken loop for `spec.key`, idempotently.
    ///
    /// Returns `true` when a new loop was spawned, `false` when one is
    /// already active for the key (in which case all of `spec`'s values are
    /// ignored). The operation runs once immediately, then on every interval
    /// tick or force trigger, always wrapped by the breaker.
    pub fn start_loop<F, Fut>(
        &self,
        shutdown: watch::Receiver<bool>,
        spec: LoopSpec,
        operation: F,
    ) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (breaker, trigger_rx) = {
            let mut map = self.inner.lock().expect("routine pool mutex poisoned");
            if let Some(entry) = map.get(&spec.key) {
                if entry.loop_active {
                    return false;
                }
            }

            let breaker = Arc::new(Mutex::new(Breaker::new(spec.threshold, spec.reset_timeout)));
            let (tx, rx) = mpsc::channel::<()>(1);
            map.insert(
                spec.key.clone(),
                Entry {
                    breaker: Arc::clone(&breaker),
                    trigger: tx,
                    loop_active: true,
                },
            );
            (breaker, rx)
        };

        let pool = self.clone();
        let key = spec.key.clone();
        let interval = spec.interval;
        tokio::spawn(async move {
            run_loop(key.clone(), breaker, trigger_rx, shutdown, interval, operation).await;
            pool.deactivate(&key);
        });
        true
    }

    /// Non-blocking force trigger. Returns `false` when no loop is active
    /// for the key or a trigger is already pending on the capacity-1
    /// channel (the extra send is dropped).
    pub fn force_update(&self, key: &str) -> bool {
        let map = self.inner.lock().expect("routine pool mutex poisoned");
        match map.get(key) {
            Some(entry) if entry.loop_active => entry.trigger.try_send(()).is_ok(),
            _ => false,
        }
    }

    pub fn is_loop_active(&self, key: &str) -> bool {
        let map = self.inner.lock().expect("routine pool mutex poisoned");
        map.get(key).map(|e| e.loop_active).unwrap_or(false)
    }

    /// Breaker snapshot for a key, if the key was ever started.
    pub fn manager(&self, key: &str) -> Option<RoutineSnapshot> {
        let map = self.inner.lock().expect("routine pool mutex poisoned");
        map.get(key).map(|e| {
            let b = e.breaker.lock().expect("breaker mutex poisoned");
            RoutineSnapshot {
                key: key.to_string(),
                state: b.state(),
                failure_count: b.failure_count(),
                threshold: b.threshold(),
                in_test: b.in_test(),
                loop_active: e.loop_active,
            }
        })
    }

    /// Snapshots for every known key, sorted by key.
    pub fn snapshot_all(&self) -> Vec<RoutineSnapshot> {
        let keys: Vec<String> = {
            let map = self.inner.lock().expect("routine pool mutex poisoned");
            map.keys().cloned().collect()
        };
        let mut out: Vec<RoutineSnapshot> = keys.iter().filter_map(|k| self.manager(k)).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Manual reset: back to pristine Closed for the key's breaker.
    pub fn reset_routine(&self, key: &str) -> bool {
        let map = self.inner.lock().expect("routine pool mutex poisoned");
        match map.get(key) {
            Some(e) => {
                e.breaker.lock().expect("breaker mutex poisoned").reset();
                true
            }
            None => false,
        }
    }

    fn deactivate(&self, key: &str) {
        let mut map = self.inner.lock().expect("routine pool mutex poisoned");
        if let Some(entry) = map.get_mut(key) {
            entry.loop_active = false;
        }
    }
}

async fn run_loop<F, Fut>(
    key: String,
    breaker: Arc<Mutex<Breaker>>,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
    operation: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if *shutdown.borrow() {
        return;
    }

    // Immediate first execution, then tick/trigger driven.
    let _ = execute(&key, &breaker, &operation).await;

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(key = %key, "routine loop shutting down");
                    return;
                }
            }
            recv = trigger_rx.recv() => {
                match recv {
                    Some(()) => { let _ = execute(&key, &breaker, &operation).await; }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                let _ = execute(&key, &breaker, &operation).await;
            }
        }
    }
}

/// Run the operation once under the breaker. At most one invocation per key
/// can be in flight because only the loop task calls this.
async fn execute<F, Fut>(
    key: &str,
    breaker: &Arc<Mutex<Breaker>>,
    operation: &F,
) -> Result<(), RoutineError>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    {
        let mut b = breaker.lock().expect("breaker mutex poisoned");
        if !b.allow(Instant::now()) {
            debug!(key = %key, "circuit open, skipping execution");
            return Err(RoutineError::CircuitOpen);
        }
    }

    match operation().await {
        Ok(()) => {
            breaker
                .lock()
                .expect("breaker mutex poisoned")
                .record_success();
            Ok(())
        }
        Err(err) => {
            let mut b = breaker.lock().expect("breaker mutex poisoned");
            b.record_failure(Instant::now());
            warn!(key = %key, error = %err, failures = b.failure_count(), "routine execution failed");
            Err(RoutineError::OperationFailed(err))
        }
    }
}
