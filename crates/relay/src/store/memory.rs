use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{BatchCommand, BoundedIncr, Expiry, KeyTtl, KeyValueStore};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn text(value: &str, expires_at: Option<Instant>) -> Self {
        Self { value: Value::Text(value.to_owned()), expires_at }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn text(&mut self, key: &str, now: Instant) -> anyhow::Result<Option<&mut Entry>> {
        match self.live(key, now) {
            Some(entry) if matches!(entry.value, Value::Set(_)) => {
                bail!("key `{key}` holds a set, not a string")
            }
            other => Ok(other),
        }
    }

    fn set(&mut self, key: &str, value: &str, expiry: Expiry, now: Instant) {
        let expires_at = match expiry {
            Expiry::Ttl(ttl) => Some(now + ttl),
            Expiry::KeepTtl => self.live(key, now).and_then(|entry| entry.expires_at),
        };
        self.entries.insert(key.to_owned(), Entry::text(value, expires_at));
    }

    fn set_nx(&mut self, key: &str, value: &str, ttl: Duration, now: Instant) -> bool {
        if self.live(key, now).is_some() {
            return false;
        }
        self.entries.insert(key.to_owned(), Entry::text(value, Some(now + ttl)));
        true
    }

    fn del(&mut self, key: &str, now: Instant) -> bool {
        self.live(key, now).is_some() && self.entries.remove(key).is_some()
    }

    fn members(&mut self, key: &str, now: Instant) -> anyhow::Result<Option<&mut BTreeSet<String>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Set(members), .. }) => Ok(Some(members)),
            Some(_) => bail!("key `{key}` holds a string, not a set"),
        }
    }
}

/// In-process key-value store with Redis-like expiry semantics.
///
/// Expiry is measured on the tokio clock, so tests running with a paused
/// runtime can advance time past TTLs deterministically.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut keyspace = self.keyspace.lock().await;
        Ok(keyspace.text(key, Instant::now())?.map(|entry| match &entry.value {
            Value::Text(value) => value.clone(),
            Value::Set(_) => String::new(),
        }))
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> anyhow::Result<()> {
        self.keyspace.lock().await.set(key, value, expiry, Instant::now());
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str) -> anyhow::Result<bool> {
        let mut keyspace = self.keyspace.lock().await;
        let Some(entry) = keyspace.text(key, Instant::now())? else {
            return Ok(false);
        };
        entry.value = Value::Text(value.to_owned());
        Ok(true)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        Ok(self.keyspace.lock().await.set_nx(key, value, ttl, Instant::now()))
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock().await;
        Ok(keys.iter().filter(|key| keyspace.del(key, now)).count() as u64)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.keyspace.lock().await.live(key, Instant::now()).is_some())
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<KeyTtl> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock().await;
        Ok(match keyspace.live(key, now) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry { expires_at: Some(at), .. }) => KeyTtl::Expires(at.duration_since(now)),
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock().await;
        let matches = matches!(
            keyspace.text(key, now)?,
            Some(Entry { value: Value::Text(current), .. }) if current.as_str() == expected
        );
        if matches {
            keyspace.entries.remove(key);
        }
        Ok(matches)
    }

    async fn incr_below(&self, key: &str, limit: i64) -> anyhow::Result<BoundedIncr> {
        let mut keyspace = self.keyspace.lock().await;
        let Some(entry) = keyspace.text(key, Instant::now())? else {
            return Ok(BoundedIncr::Missing);
        };
        let Value::Text(raw) = &mut entry.value else {
            return Ok(BoundedIncr::Missing);
        };
        let Ok(current) = raw.trim().parse::<i64>() else {
            bail!("counter `{key}` is not an integer: {raw:?}");
        };
        if current >= limit {
            return Ok(BoundedIncr::AtLimit(current));
        }

        let next = current.max(0) + 1;
        *raw = next.to_string();
        Ok(BoundedIncr::Incremented(next))
    }

    async fn decr_clamped(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let mut keyspace = self.keyspace.lock().await;
        let Some(entry) = keyspace.text(key, Instant::now())? else {
            return Ok(None);
        };
        let Value::Text(raw) = &mut entry.value else {
            return Ok(None);
        };
        let next = match raw.trim().parse::<i64>() {
            Ok(current) if current > 0 => current - 1,
            _ => 0,
        };
        *raw = next.to_string();
        Ok(Some(next))
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock().await;
        if let Some(members) = keyspace.members(key, now)? {
            return Ok(members.insert(member.to_owned()));
        }
        keyspace.entries.insert(
            key.to_owned(),
            Entry { value: Value::Set(BTreeSet::from([member.to_owned()])), expires_at: None },
        );
        Ok(true)
    }

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock().await;
        let Some(members) = keyspace.members(key, now)? else {
            return Ok(false);
        };
        let removed = members.remove(member);
        if members.is_empty() {
            keyspace.entries.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .members(key, Instant::now())?
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn exec(&self, batch: Vec<BatchCommand>) -> anyhow::Result<Vec<bool>> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock().await;
        Ok(batch
            .into_iter()
            .map(|command| match command {
                BatchCommand::Set { key, value, expiry } => {
                    keyspace.set(&key, &value, expiry, now);
                    true
                }
                BatchCommand::SetIfAbsent { key, value, ttl } => {
                    keyspace.set_nx(&key, &value, ttl, now)
                }
                BatchCommand::Del { key } => keyspace.del(&key, now),
            })
            .collect())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.keyspace.lock().await.entries.clear();
        Ok(())
    }
}
