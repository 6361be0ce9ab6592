//! Blocks shutdown until in-flight background work has finished.
//!
//! Every spawned load takes a [Lease] before its first suspension and holds
//! it until the load has either committed or discarded its work. Shutdown
//! calls [Drainer::drain], which resolves only once every outstanding lease
//! has been released. Loads are never cancelled individually; they observe
//! the per-page destroy sentinel instead.

use parking_lot::Mutex;
use futures::channel::oneshot;
use std::sync::Arc;

/// Counts leases held by in-flight work and wakes a drainer when the count
/// returns to zero.
#[derive(Clone)]
pub struct Drainer {
    state: Arc<Mutex<State>>,
}

struct State {
    outstanding: usize,
    draining: Option<oneshot::Sender<()>>,
}

impl Drainer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                outstanding: 0,
                draining: None,
            })),
        }
    }

    /// Take a lease. The lease must be acquired before the holder's first
    /// suspension and released (dropped) only once the holder will no longer
    /// touch shared state.
    pub fn lease(&self) -> Lease {
        self.state.lock().outstanding += 1;
        Lease {
            state: self.state.clone(),
        }
    }

    /// Number of leases currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Wait until every outstanding lease has been released. Returns
    /// immediately if none are held.
    pub async fn drain(&self) {
        let receiver = {
            let mut state = self.state.lock();
            if state.outstanding == 0 {
                return;
            }
            assert!(state.draining.is_none(), "drain already in progress");
            let (sender, receiver) = oneshot::channel();
            state.draining = Some(sender);
            receiver
        };
        receiver.await.expect("drainer dropped while draining");
    }
}

impl Default for Drainer {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by in-flight work; releasing the last lease wakes the drainer.
pub struct Lease {
    state: Arc<Mutex<State>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            if let Some(sender) = state.draining.take() {
                let _ = sender.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Metrics, Runner, Spawner};
    use std::time::Duration;

    #[test_traced]
    fn test_drain_without_leases() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let drainer = Drainer::new();
            assert_eq!(drainer.outstanding(), 0);
            drainer.drain().await;
        });
    }

    #[test_traced]
    fn test_drain_waits_for_leases() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let drainer = Drainer::new();
            let lease = drainer.lease();
            let second = drainer.lease();
            assert_eq!(drainer.outstanding(), 2);

            // Release the leases at different (virtual) times.
            context.with_label("holder").spawn({
                let context = context.clone();
                move |_| async move {
                    context.sleep(Duration::from_millis(5)).await;
                    drop(lease);
                    context.sleep(Duration::from_millis(5)).await;
                    drop(second);
                }
            });

            drainer.drain().await;
            assert_eq!(drainer.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_leases_after_drain() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let drainer = Drainer::new();
            drop(drainer.lease());
            drainer.drain().await;

            // The drainer is reusable once a drain completes.
            let lease = drainer.lease();
            assert_eq!(drainer.outstanding(), 1);
            drop(lease);
            drainer.drain().await;
        });
    }
}
