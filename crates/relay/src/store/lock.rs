// Leased mutual exclusion over the key-value store.
//
// A holder writes a random token under the lock key with a short lease
// and releases it with compare-and-delete, so a late release can never
// drop a lock that has since been re-acquired by someone else. The lease
// expiry, not the release, is what recovers from a crashed holder.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::KeyValueStore;
use crate::error::StreamError;

pub const DEFAULT_LEASE: Duration = Duration::from_secs(2);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Proof of holding a lease, required to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    key: String,
    token: String,
}

#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn KeyValueStore>,
    lease: Duration,
    timeout: Duration,
    poll_interval: Duration,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_timing(store, DEFAULT_LEASE, DEFAULT_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_timing(
        store: Arc<dyn KeyValueStore>,
        lease: Duration,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self { store, lease, timeout, poll_interval }
    }

    /// Single test-and-set attempt.
    pub async fn try_acquire(&self, key: &str) -> anyhow::Result<Option<LeaseToken>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_nx(key, &token, self.lease).await? {
            return Ok(Some(LeaseToken { key: key.to_owned(), token }));
        }
        Ok(None)
    }

    /// Polls until the lease is granted or the timeout elapses.
    ///
    /// Timing out is reported as [`StreamError::Busy`].
    pub async fn acquire(&self, key: &str) -> Result<LeaseToken, StreamError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(token) = self.try_acquire(key).await? {
                return Ok(token);
            }
            if Instant::now() + self.poll_interval > deadline {
                debug!(lock_key = key, "lease lock wait timed out");
                return Err(StreamError::Busy);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Returns whether the lease was still held by `token` when released.
    pub async fn release(&self, token: LeaseToken) -> anyhow::Result<bool> {
        let released = self.store.compare_and_delete(&token.key, &token.token).await?;
        if !released {
            warn!(lock_key = %token.key, "lease expired before release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::LeaseLock;
    use crate::{
        error::StreamError,
        store::{KeyValueStore, MemoryKeyValueStore},
    };

    fn lock() -> (Arc<MemoryKeyValueStore>, LeaseLock) {
        let store = Arc::new(MemoryKeyValueStore::new());
        (Arc::clone(&store), LeaseLock::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn second_holder_is_denied_until_release() {
        let (_, lock) = lock();
        let first = lock.try_acquire("pool:lock").await.expect("store").expect("granted");
        assert!(lock.try_acquire("pool:lock").await.expect("store").is_none());

        assert!(lock.release(first).await.expect("release"));
        assert!(lock.try_acquire("pool:lock").await.expect("store").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_as_busy() {
        let (store, lock) = lock();
        store.set_nx("pool:lock", "someone-else", Duration::from_secs(60)).await.expect("seed");

        let started = tokio::time::Instant::now();
        let result = lock.acquire("pool:lock").await;

        assert!(matches!(result, Err(StreamError::Busy)));
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_the_deadlock_breaker() {
        let (_, lock) = lock();
        let stale = lock.try_acquire("pool:lock").await.expect("store").expect("granted");

        let fresh = lock.acquire("pool:lock").await.expect("lease should expire within timeout");

        assert!(!lock.release(stale).await.expect("release"));
        assert!(lock.release(fresh).await.expect("release"));
    }
}
