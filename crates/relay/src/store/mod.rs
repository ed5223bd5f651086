// Key-value session store.
//
// Every piece of shared session and pool state lives behind
// `KeyValueStore`. The operations mirror the small subset of Redis
// commands the relay relies on, so a networked backend can implement the
// trait one command per method.

pub mod lock;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use lock::{LeaseLock, LeaseToken};
pub use memory::MemoryKeyValueStore;

/// Expiry applied by a plain `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Ttl(Duration),
    /// Keep whatever expiry the key already has (none for a new key).
    KeepTtl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// Remaining lifetime of a key that will expire, if any is left.
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Self::Expires(remaining) if !remaining.is_zero() => Some(remaining),
            _ => None,
        }
    }
}

/// Outcome of an increment that must stay below a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedIncr {
    Incremented(i64),
    /// The counter already holds `limit` or more; it was left untouched.
    AtLimit(i64),
    Missing,
}

/// One command of a pipelined batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchCommand {
    Set { key: String, value: String, expiry: Expiry },
    SetIfAbsent { key: String, value: String, ttl: Duration },
    Del { key: String },
}

impl BatchCommand {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::SetIfAbsent { key, .. } | Self::Del { key } => key,
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> anyhow::Result<()>;

    /// Overwrites an existing key, keeping its expiry. Absent keys stay
    /// absent. Returns whether the key existed.
    async fn replace(&self, key: &str, value: &str) -> anyhow::Result<bool>;

    /// Sets `key` only when it is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Deletes every listed key, returning how many existed.
    async fn del(&self, keys: &[String]) -> anyhow::Result<u64>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    async fn ttl(&self, key: &str) -> anyhow::Result<KeyTtl>;

    /// Deletes `key` only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool>;

    /// Increments an existing integer counter unless it already reached `limit`.
    /// The key's expiry is preserved.
    async fn incr_below(&self, key: &str, limit: i64) -> anyhow::Result<BoundedIncr>;

    /// Decrements an existing counter without letting it go below zero.
    ///
    /// A missing key is left missing and reported as `None`. A value that is
    /// not a positive integer is reset to zero.
    async fn decr_clamped(&self, key: &str) -> anyhow::Result<Option<i64>>;

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<bool>;

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<bool>;

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;

    /// Runs a batch in one round trip. Each entry reports whether its
    /// command took effect (`del` of an absent key reports `false`).
    async fn exec(&self, batch: Vec<BatchCommand>) -> anyhow::Result<Vec<bool>>;

    /// Drops every key.
    async fn flush(&self) -> anyhow::Result<()>;
}
