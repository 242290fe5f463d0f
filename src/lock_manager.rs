//! Per-path sync locks (spec §4.7): mutual exclusion between the readers,
//! the routers, the scheduler, and the eviction engine, advisory across the
//! core but authoritative within it.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::model::LockDirection;

/// Locks older than this are considered stale and may be force-released
/// by the background scrubber (spec §4.7).
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

struct Slot {
    direction: LockDirection,
    acquired_at: SystemTime,
}

/// Holding a [`LockGuard`] releases the lock on drop and wakes one waiter.
pub struct LockGuard {
    manager: Arc<LockManager>,
    key: (Uuid, String),
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(self.key.0, &self.key.1);
    }
}

pub struct LockManager {
    slots: DashMap<(Uuid, String), Slot>,
    waiters: DashMap<(Uuid, String), Arc<Notify>>,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(LockManager {
            slots: DashMap::new(),
            waiters: DashMap::new(),
        });
        manager.clone().spawn_scrubber();
        manager
    }

    /// `acquire(path, direction, timeout)`: succeeds immediately if free,
    /// else blocks on a notify until released or the timeout elapses.
    pub async fn acquire(
        self: &Arc<Self>,
        pair: Uuid,
        path: &str,
        direction: LockDirection,
        wait: Duration,
    ) -> Result<LockGuard, ServiceError> {
        let key = (pair, path.to_string());
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.try_insert(&key, direction) {
                return Ok(LockGuard {
                    manager: self.clone(),
                    key,
                });
            }

            let notify = self
                .waiters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ServiceError::WriteTimeout(path.to_string()));
            }
            if timeout(remaining, notify.notified()).await.is_err() {
                return Err(ServiceError::WriteTimeout(path.to_string()));
            }
        }
    }

    /// Non-blocking acquire used by the eviction engine (§4.9: "acquire an
    /// exclusive lock (fail-fast; do not wait)").
    pub fn try_acquire(
        self: &Arc<Self>,
        pair: Uuid,
        path: &str,
        direction: LockDirection,
    ) -> Result<LockGuard, ServiceError> {
        let key = (pair, path.to_string());
        if self.try_insert(&key, direction) {
            Ok(LockGuard {
                manager: self.clone(),
                key,
            })
        } else {
            Err(ServiceError::LockFailure(path.to_string()))
        }
    }

    fn try_insert(&self, key: &(Uuid, String), direction: LockDirection) -> bool {
        match self.slots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Slot {
                    direction,
                    acquired_at: SystemTime::now(),
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(_) => false,
        }
    }

    pub fn direction_of(&self, pair: Uuid, path: &str) -> Option<LockDirection> {
        self.slots.get(&(pair, path.to_string())).map(|s| s.direction)
    }

    fn release(&self, pair: Uuid, path: &str) {
        let key = (pair, path.to_string());
        self.slots.remove(&key);
        if let Some((_, notify)) = self.waiters.remove(&key) {
            notify.notify_one();
        }
    }

    /// Background scrubber: force-releases locks older than
    /// [`STALE_LOCK_AGE`], logging a warning (spec §4.7).
    fn spawn_scrubber(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let stale: Vec<(Uuid, String)> = self
                    .slots
                    .iter()
                    .filter(|r| {
                        r.value()
                            .acquired_at
                            .elapsed()
                            .map(|age| age > STALE_LOCK_AGE)
                            .unwrap_or(false)
                    })
                    .map(|r| r.key().clone())
                    .collect();
                for (pair, path) in stale {
                    warn!(pair = %pair, path = %path, "force-releasing stale sync lock");
                    self.release(pair, &path);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_then_succeeds_on_release() {
        let manager = LockManager::new();
        let pair = Uuid::new_v4();
        let guard = manager
            .acquire(pair, "a.txt", LockDirection::LocalToExternal, Duration::from_secs(1))
            .await
            .unwrap();

        let manager2 = manager.clone();
        let waiter = tokio::spawn(async move {
            manager2
                .acquire(pair, "a.txt", LockDirection::LocalToExternal, Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn acquire_times_out_when_held() {
        let manager = LockManager::new();
        let pair = Uuid::new_v4();
        let _guard = manager
            .acquire(pair, "a.txt", LockDirection::LocalToExternal, Duration::from_secs(5))
            .await
            .unwrap();

        let result = manager
            .acquire(pair, "a.txt", LockDirection::LocalToExternal, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ServiceError::WriteTimeout(_))));
    }

    #[test]
    fn try_acquire_fails_fast_when_held() {
        let manager = LockManager::new();
        let pair = Uuid::new_v4();
        let _guard = manager
            .try_acquire(pair, "a.txt", LockDirection::LocalToExternal)
            .unwrap();
        assert!(manager
            .try_acquire(pair, "a.txt", LockDirection::LocalToExternal)
            .is_err());
    }
}
