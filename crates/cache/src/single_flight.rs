use dashmap::DashMap;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use std::{future::Future, hash::Hash, sync::Arc};

type SharedFuture<V> = Shared<BoxFuture<'static, V>>;

/// Network-wide deduplication of concurrent identical work.
///
/// The first caller for a key becomes the leader and runs the computation;
/// everyone else arriving before it finishes joins the same future and
/// shares its result. The map only holds short critical sections; the
/// computation itself runs outside the lock. Nothing runs detached: if every
/// waiter is cancelled the computation stops with them.
pub struct SingleFlight<K, V> {
    inflight: Arc<DashMap<K, SharedFuture<V>>>,
}

impl<K: Eq + Hash, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").field("inflight", &self.inflight.len()).finish()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self { inflight: Arc::new(DashMap::new()) }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `make()` under the key, or joins an in-flight run.
    ///
    /// Returns the value and whether this caller joined instead of leading.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (future, guard) = match self.inflight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), None),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let future = make().boxed().shared();
                entry.insert(future.clone());
                // the guard drops the key even when the leader is cancelled,
                // so later arrivals never join a future nobody drives
                let guard = RemoveGuard { inflight: Arc::clone(&self.inflight), key };
                (future, Some(guard))
            }
        };

        let joined = guard.is_none();
        let value = future.await;
        drop(guard);
        (value, joined)
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Returns `true` if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

struct RemoveGuard<K: Eq + Hash, V> {
    inflight: Arc<DashMap<K, SharedFuture<V>>>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for RemoveGuard<K, V> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_run() {
        let flight: Arc<SingleFlight<&'static str, u64>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                flight
                    .run("key", move || async move {
                        runs.fetch_add(1, Ordering::AcqRel);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42u64
                    })
                    .await
            }));
        }

        let mut joined_count = 0;
        for task in tasks {
            let (value, joined) = task.await.unwrap();
            assert_eq!(value, 42);
            if joined {
                joined_count += 1;
            }
        }
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(joined_count, 7);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn sequential_runs_do_not_share() {
        let flight: SingleFlight<&'static str, u64> = SingleFlight::new();
        let (a, joined_a) = flight.run("key", || async { 1 }).await;
        let (b, joined_b) = flight.run("key", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
        assert!(!joined_a);
        assert!(!joined_b);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_leaves_no_stale_entry() {
        let flight: Arc<SingleFlight<&'static str, u64>> = Arc::new(SingleFlight::new());
        let leader = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1u64
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(flight.len(), 1);
        leader.abort();
        let _ = leader.await;
        assert!(flight.is_empty());
    }
}
