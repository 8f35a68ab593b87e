//! In-Flight Deduper
//! Mission: coalesce concurrent identical upstream fetches behind one
//! in-flight future, keyed by `signature_strict`. Best-effort per process —
//! correctness of the overall flow never depends on dedup succeeding, only
//! its cost does.

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

type InflightMap<T> = Arc<Mutex<HashMap<String, Slot<T>>>>;
type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, Arc<anyhow::Error>>>>;

struct Slot<T> {
    future: SharedFetch<T>,
    registered_at: Instant,
}

const STALE_AFTER: Duration = Duration::from_secs(600);

/// Removes its key from the map when dropped. Held as a local inside the
/// boxed factory future, so it is dropped — and the key removed — whether
/// that future runs to completion, panics mid-poll, or is cancelled by
/// every awaiting clone going away before it resolves. This is the
/// finally-equivalent block the dedup contract promises: cleanup does not
/// depend on any particular caller's `run()` call reaching its post-await
/// line.
struct RemoveOnDrop<T: Clone + Send + Sync + 'static> {
    inflight: InflightMap<T>,
    key: String,
}

impl<T: Clone + Send + Sync + 'static> Drop for RemoveOnDrop<T> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
    }
}

/// `signature_strict -> shared future`. First caller registers and drives
/// the factory; concurrent callers with the same key await the same
/// future. The map entry is removed by a `RemoveOnDrop` guard living inside
/// the factory future itself, so removal happens once — on completion,
/// panic, or cancellation of the last clone — regardless of which caller's
/// task observes it.
pub struct InFlightDeduper<T: Clone + Send + Sync + 'static> {
    inflight: InflightMap<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for InFlightDeduper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> InFlightDeduper<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `factory` for `key`, or await an identical in-flight call.
    pub async fn run<F, Fut>(&self, key: &str, factory: F) -> Result<T, Arc<anyhow::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(slot) = inflight.get(key) {
                slot.future.clone()
            } else {
                let key_owned = key.to_string();
                let guard = RemoveOnDrop {
                    inflight: self.inflight.clone(),
                    key: key_owned.clone(),
                };
                let fut: BoxFuture<'static, Result<T, Arc<anyhow::Error>>> = async move {
                    let _guard = guard;
                    factory().await.map_err(Arc::new)
                }
                .boxed();
                let shared = fut.shared();
                inflight.insert(
                    key_owned,
                    Slot {
                        future: shared.clone(),
                        registered_at: Instant::now(),
                    },
                );
                shared
            }
        };

        shared.await
    }

    /// Drop entries whose factory call has been running longer than 10
    /// minutes — a future that never resolves would otherwise wedge its key
    /// forever. Call on a 5-minute interval from the process's background
    /// sweep task.
    pub fn sweep_stale(&self) {
        let now = Instant::now();
        self.inflight
            .lock()
            .retain(|_, slot| now.duration_since(slot.registered_at) < STALE_AFTER);
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn concurrent_calls_share_one_factory_invocation() {
        let deduper: Arc<InFlightDeduper<i32>> = Arc::new(InFlightDeduper::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let deduper = deduper.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                deduper
                    .run("sig-1", move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(StdDuration::from_millis(20)).await;
                            Ok(42)
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(*h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "factory should run exactly once");
    }

    #[tokio::test]
    async fn entry_is_removed_after_completion() {
        let deduper: InFlightDeduper<i32> = InFlightDeduper::new();
        deduper.run("sig-2", || async { Ok(7) }).await.unwrap();
        assert_eq!(deduper.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let deduper: InFlightDeduper<i32> = InFlightDeduper::new();
        let a = deduper.run("a", || async { Ok(1) }).await.unwrap();
        let b = deduper.run("b", || async { Ok(2) }).await.unwrap();
        assert_eq!((*a, *b), (1, 2));
    }
}
