// Per-agent FIFO locks
// Two tasks for the same agent never overlap: acquiring the lock for a
// normalized agent key queues behind every earlier waiter. Entries are
// swept once no outstanding holders or waiters remain, so the map's
// lifetime stays bounded by actual use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

fn normalize(agent_id: &str) -> String {
    agent_id.trim().to_ascii_lowercase()
}

#[derive(Default)]
pub struct AgentLockMap {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one agent; the guard releases on drop.
    pub async fn acquire(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let key = normalize(agent_id);
        let entry = {
            let mut map = self.inner.lock().expect("lock map poisoned");
            // Sweep entries nobody holds or waits on.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        entry.lock_owned().await
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.inner.lock().expect("lock map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_agent_never_overlaps() {
        let locks = Arc::new(AgentLockMap::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let running = running.clone();
            let max_running = max_running.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("Claude").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_agents_run_concurrently() {
        let locks = Arc::new(AgentLockMap::new());
        let guard_a = locks.acquire("claude").await;
        // A second agent's lock is immediately available.
        let guard_b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("codex"))
            .await
            .expect("codex lock should not wait on claude");
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn keys_are_normalized() {
        let locks = Arc::new(AgentLockMap::new());
        let guard = locks.acquire("  Claude ").await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire("claude")).await;
        assert!(blocked.is_err(), "differently-spelled key must share the lock");
        drop(guard);
    }

    #[tokio::test]
    async fn idle_entries_are_swept() {
        let locks = AgentLockMap::new();
        {
            let _guard = locks.acquire("claude").await;
        }
        // The next acquire sweeps the stale entry before inserting its own.
        let _guard = locks.acquire("codex").await;
        assert_eq!(locks.live_entries(), 1);
    }
}
