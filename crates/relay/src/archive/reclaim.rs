// Ending sessions and reclaiming their partitions.
//
// Both paths delete the session's keys and free the partition under the
// pool lease, before any archival I/O happens. Archival runs in the
// background: a lost archive is logged, a stranded partition would block
// every future ride.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use trackcast_common::{
    keyspace::{backup_key, booking_key, connection_counter_key, driver_key, live_location_key},
    records::{BackupRecord, BookingRecord, StoredRecord},
};

use super::ArchiveStore;
use crate::{
    allocator::{PartitionAllocator, PoolLease},
    error::StreamError,
    queue::PartitionLog,
    store::KeyValueStore,
};

/// A finished session's archive window, `[start_offset, end_offset)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveWindow {
    pub booking_id: String,
    pub partition: u32,
    pub start_offset: i64,
    pub end_offset: i64,
}

#[derive(Debug)]
pub struct EndedSession {
    pub booking_id: String,
    pub partition: u32,
    /// Background archival; resolves once the archive is written or skipped.
    pub archival: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReapOutcome {
    /// Viewer counter still present; the session is presumed alive.
    Alive,
    /// Freed with nothing to archive.
    Freed,
    /// Freed; the window still has to be archived.
    Stale(ArchiveWindow),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub alive: usize,
    pub freed: usize,
    pub archived: usize,
    pub failed: usize,
}

/// One stale-reap pass over the pool. Partitions are checked and freed
/// before the pass is returned; each archive is written by its own task so
/// a failure on one never blocks the others.
pub struct ReapPass {
    pub partitions: usize,
    swept: ReapReport,
    archivals: JoinSet<(u32, anyhow::Result<usize>)>,
}

impl ReapPass {
    pub async fn wait(mut self) -> ReapReport {
        let mut report = self.swept;
        while let Some(joined) = self.archivals.join_next().await {
            match joined {
                Ok((_, Ok(_))) => report.archived += 1,
                Ok((partition, Err(error))) => {
                    error!(partition, error = ?error, "stale archival failed");
                    report.failed += 1;
                }
                Err(join_error) => {
                    error!(?join_error, "stale archival task panicked");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "stale reap pass finished");
        report
    }
}

/// Bookings currently holding a partition. `inactive` ones lost their
/// viewer counter and are waiting for the next reap pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingIndex {
    pub active: Vec<String>,
    pub inactive: Vec<String>,
}

#[derive(Clone)]
pub struct Reclaimer {
    store: Arc<dyn KeyValueStore>,
    log: Arc<dyn PartitionLog>,
    allocator: PartitionAllocator,
    archive: ArchiveStore,
}

impl Reclaimer {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        log: Arc<dyn PartitionLog>,
        allocator: PartitionAllocator,
        archive: ArchiveStore,
    ) -> Self {
        Self { store, log, allocator, archive }
    }

    /// Ends an active booking: clears its keys, frees its partition, and
    /// archives its messages in the background.
    pub async fn end(&self, booking_id: &str) -> Result<EndedSession, StreamError> {
        let lease = self.allocator.lock().await?;
        let closed = self.close_booking(&lease, booking_id).await;
        self.allocator.unlock(lease).await;
        let window = closed?;

        let partition = window.partition;
        let this = self.clone();
        let archival = tokio::spawn(async move {
            if let Err(error) = this.archive_window(&window).await {
                error!(booking_id = %window.booking_id, error = ?error, "archival failed");
            }
        });

        Ok(EndedSession { booking_id: booking_id.to_owned(), partition, archival })
    }

    async fn close_booking(
        &self,
        lease: &PoolLease,
        booking_id: &str,
    ) -> Result<ArchiveWindow, StreamError> {
        let raw = self
            .store
            .get(&booking_key(booking_id))
            .await?
            .ok_or_else(|| StreamError::NotFound(format!("booking {booking_id} is not active")))?;
        let record = BookingRecord::decode(&raw)
            .with_context(|| format!("booking record for `{booking_id}` is malformed"))?;

        let mut keys = partition_keys(record.partition);
        keys.push(booking_key(booking_id));
        keys.push(driver_key(record.driver_id));
        self.store.del(&keys).await?;

        let end_offset = self.log.high_watermark(record.partition).await?;
        self.free(lease, record.partition).await;
        info!(booking_id, partition = record.partition, driver_id = record.driver_id, "booking ended");

        Ok(ArchiveWindow {
            booking_id: booking_id.to_owned(),
            partition: record.partition,
            start_offset: record.start_offset,
            end_offset,
        })
    }

    /// Checks every occupied partition under the pool lease, frees the stale
    /// ones, and starts their archival.
    pub async fn stale_reap(&self) -> Result<ReapPass, StreamError> {
        let lease = self.allocator.lock().await?;
        let swept = self.sweep(&lease).await;
        self.allocator.unlock(lease).await;
        let outcomes = swept?;

        let mut report = ReapReport::default();
        let mut archivals = JoinSet::new();
        for (partition, outcome) in &outcomes {
            let partition = *partition;
            match outcome {
                Ok(ReapOutcome::Alive) => report.alive += 1,
                Ok(ReapOutcome::Freed) => report.freed += 1,
                Ok(ReapOutcome::Stale(window)) => {
                    let this = self.clone();
                    let window = window.clone();
                    archivals.spawn(async move {
                        let archived = this.archive_window(&window).await;
                        if let Ok(messages) = &archived {
                            info!(booking_id = %window.booking_id, partition, messages, "stale session reaped");
                        }
                        (partition, archived)
                    });
                }
                Err(error) => {
                    error!(partition, error = ?error, "stale reap failed");
                    report.failed += 1;
                }
            }
        }

        Ok(ReapPass { partitions: outcomes.len(), swept: report, archivals })
    }

    async fn sweep(
        &self,
        lease: &PoolLease,
    ) -> anyhow::Result<Vec<(u32, anyhow::Result<ReapOutcome>)>> {
        let partitions = self.allocator.occupied().await?;
        let mut outcomes = Vec::with_capacity(partitions.len());
        for partition in partitions {
            outcomes.push((partition, self.reap_partition(lease, partition).await));
        }
        Ok(outcomes)
    }

    async fn reap_partition(
        &self,
        lease: &PoolLease,
        partition: u32,
    ) -> anyhow::Result<ReapOutcome> {
        if self.store.exists(&connection_counter_key(partition)).await? {
            return Ok(ReapOutcome::Alive);
        }

        let backup = match self.store.get(&backup_key(partition)).await? {
            None => {
                self.store.del(&partition_keys(partition)).await?;
                self.free(lease, partition).await;
                warn!(partition, "stale partition had no backup record, freed without archive");
                return Ok(ReapOutcome::Freed);
            }
            Some(raw) => BackupRecord::decode(&raw),
        };

        let backup = match backup {
            Ok(backup) => backup,
            Err(error) => {
                self.store.del(&partition_keys(partition)).await?;
                self.free(lease, partition).await;
                warn!(partition, error = ?error, "stale partition had a malformed backup record");
                return Ok(ReapOutcome::Freed);
            }
        };

        let mut keys = partition_keys(partition);
        // The booking and driver records normally expired with the counter.
        if let Some(record) = self.bound_booking(&backup.booking_id, partition).await? {
            keys.push(booking_key(&backup.booking_id));
            keys.push(driver_key(record.driver_id));
        }
        self.store.del(&keys).await?;

        let end_offset = self.log.high_watermark(partition).await?;
        self.free(lease, partition).await;

        Ok(ReapOutcome::Stale(ArchiveWindow {
            booking_id: backup.booking_id,
            partition,
            start_offset: backup.start_offset,
            end_offset,
        }))
    }

    /// Lists bookings by whether their partition still has a viewer counter.
    /// Partitions without a readable backup record are left to the reaper.
    pub async fn bookings(&self) -> anyhow::Result<BookingIndex> {
        let mut index = BookingIndex::default();
        for partition in self.allocator.occupied().await? {
            let backup = match self.store.get(&backup_key(partition)).await? {
                Some(raw) => BackupRecord::decode(&raw),
                None => {
                    warn!(partition, "occupied partition has no backup record");
                    continue;
                }
            };
            let Ok(backup) = backup else {
                warn!(partition, "occupied partition has a malformed backup record");
                continue;
            };

            if self.store.exists(&connection_counter_key(partition)).await? {
                index.active.push(backup.booking_id);
            } else {
                index.inactive.push(backup.booking_id);
            }
        }
        Ok(index)
    }

    async fn bound_booking(
        &self,
        booking_id: &str,
        partition: u32,
    ) -> anyhow::Result<Option<BookingRecord>> {
        let Some(raw) = self.store.get(&booking_key(booking_id)).await? else {
            return Ok(None);
        };
        Ok(BookingRecord::decode(&raw).ok().filter(|record| record.partition == partition))
    }

    /// Copies the window's messages to cold storage. Returns how many were
    /// written; an empty window writes nothing.
    pub async fn archive_window(&self, window: &ArchiveWindow) -> anyhow::Result<usize> {
        if window.end_offset <= window.start_offset {
            info!(booking_id = %window.booking_id, "no messages to archive");
            return Ok(0);
        }

        let records = self
            .log
            .read_range(window.partition, window.start_offset, window.end_offset)
            .await?;
        self.archive.put(&window.booking_id, &records).await?;
        info!(
            booking_id = %window.booking_id,
            partition = window.partition,
            start_offset = window.start_offset,
            end_offset = window.end_offset,
            messages = records.len(),
            "booking archived"
        );
        Ok(records.len())
    }

    /// Drops every session key, including the pool.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.store.flush().await?;
        warn!("all session state cleared");
        Ok(())
    }

    async fn free(&self, lease: &PoolLease, partition: u32) {
        if let Err(error) = self.allocator.free(lease, partition).await {
            error!(partition, error = ?error, "failed to free partition");
        }
    }
}

fn partition_keys(partition: u32) -> Vec<String> {
    vec![backup_key(partition), live_location_key(partition), connection_counter_key(partition)]
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;
    use trackcast_common::keyspace::{backup_key, connection_counter_key, driver_key};

    use super::{ArchiveWindow, BookingIndex, ReapReport, Reclaimer};
    use crate::{
        allocator::PartitionAllocator,
        archive::ArchiveStore,
        auth::booking_token::BookingTokenService,
        error::StreamError,
        queue::{MemoryPartitionLog, PartitionLog},
        session::{
            tests::{harness, pickup, Harness, TEST_SECRET, TOKEN_TTL},
            SessionManager,
        },
        store::{
            BatchCommand, BoundedIncr, Expiry, KeyTtl, KeyValueStore, LeaseLock,
            MemoryKeyValueStore,
        },
    };

    /// Memory store whose next batch parks until `resume` is notified.
    #[derive(Default)]
    struct ParkedBatches {
        inner: MemoryKeyValueStore,
        armed: AtomicBool,
        parked: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl KeyValueStore for ParkedBatches {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, expiry: Expiry) -> anyhow::Result<()> {
            self.inner.set(key, value, expiry).await
        }
        async fn replace(&self, key: &str, value: &str) -> anyhow::Result<bool> {
            self.inner.replace(key, value).await
        }
        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn del(&self, keys: &[String]) -> anyhow::Result<u64> {
            self.inner.del(keys).await
        }
        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.exists(key).await
        }
        async fn ttl(&self, key: &str) -> anyhow::Result<KeyTtl> {
            self.inner.ttl(key).await
        }
        async fn compare_and_delete(&self, key: &str, expected: &str) -> anyhow::Result<bool> {
            self.inner.compare_and_delete(key, expected).await
        }
        async fn incr_below(&self, key: &str, limit: i64) -> anyhow::Result<BoundedIncr> {
            self.inner.incr_below(key, limit).await
        }
        async fn decr_clamped(&self, key: &str) -> anyhow::Result<Option<i64>> {
            self.inner.decr_clamped(key).await
        }
        async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<bool> {
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> anyhow::Result<bool> {
            self.inner.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>> {
            self.inner.smembers(key).await
        }
        async fn exec(&self, batch: Vec<BatchCommand>) -> anyhow::Result<Vec<bool>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.resume.notified().await;
            }
            self.inner.exec(batch).await
        }
        async fn flush(&self) -> anyhow::Result<()> {
            self.inner.flush().await
        }
    }

    fn reclaimer(h: &Harness) -> (Reclaimer, ArchiveStore) {
        let archive = ArchiveStore::in_memory();
        let reclaimer =
            Reclaimer::new(h.store.clone(), h.log.clone(), h.allocator.clone(), archive.clone());
        (reclaimer, archive)
    }

    #[tokio::test]
    async fn end_archives_exactly_the_session_messages() {
        let h = harness(1);
        let (reclaimer, archive) = reclaimer(&h);
        h.log.produce(0, "3", r#"{"ride":"previous"}"#.into()).await.expect("produce");

        h.sessions.create(7, "B1", pickup()).await.expect("create");
        for lat in [1.0, 2.0, 3.0] {
            h.log.produce(0, "7", json!({ "lat": lat }).to_string()).await.expect("produce");
        }

        let ended = reclaimer.end("B1").await.expect("end");
        assert_eq!(ended.partition, 0);
        ended.archival.await.expect("archival task");

        let payloads = archive.get("B1").await.expect("get").expect("archive");
        assert_eq!(payloads, vec![json!({"lat": 1.0}), json!({"lat": 2.0}), json!({"lat": 3.0})]);
        assert!(h.allocator.occupied().await.expect("occupied").is_empty());
        assert!(h.sessions.booking("B1").await.expect("get").is_none());
        assert!(!h.store.exists(&driver_key(7)).await.expect("exists"));
        assert!(!h.store.exists(&backup_key(0)).await.expect("exists"));
    }

    #[tokio::test]
    async fn end_without_messages_writes_no_archive() {
        let h = harness(1);
        let (reclaimer, archive) = reclaimer(&h);
        h.sessions.create(7, "B1", pickup()).await.expect("create");

        reclaimer.end("B1").await.expect("end").archival.await.expect("archival task");

        assert!(archive.get("B1").await.expect("get").is_none());
        assert!(h.allocator.occupied().await.expect("occupied").is_empty());
    }

    #[tokio::test]
    async fn ending_an_unknown_booking_is_not_found() {
        let h = harness(1);
        let (reclaimer, _) = reclaimer(&h);
        assert!(matches!(reclaimer.end("nope").await, Err(StreamError::NotFound(_))));
    }

    #[tokio::test]
    async fn partition_is_reusable_after_end() {
        let h = harness(1);
        let (reclaimer, _) = reclaimer(&h);
        h.sessions.create(7, "B1", pickup()).await.expect("create");
        reclaimer.end("B1").await.expect("end");

        let next = h.sessions.create(9, "B2", pickup()).await.expect("create after end");
        assert_eq!(next.session.partition, 0);
    }

    #[tokio::test]
    async fn stale_reap_archives_when_backup_survives() {
        let h = harness(2);
        let (reclaimer, archive) = reclaimer(&h);
        h.sessions.create(7, "B1", pickup()).await.expect("create");
        h.sessions.create(9, "B2", pickup()).await.expect("create");
        h.log.produce(0, "7", json!({"lat": 5.0}).to_string()).await.expect("produce");

        // B1's producer crashed and its counter expired; B2 is still watched.
        h.store.del(&[connection_counter_key(0)]).await.expect("del");

        let pass = reclaimer.stale_reap().await.expect("reap");
        assert_eq!(pass.partitions, 2);
        let report = pass.wait().await;

        assert_eq!(report, ReapReport { alive: 1, freed: 0, archived: 1, failed: 0 });
        assert_eq!(
            archive.get("B1").await.expect("get").expect("archive"),
            vec![json!({"lat": 5.0})]
        );
        assert_eq!(h.allocator.occupied().await.expect("occupied"), vec![1]);
        assert!(h.sessions.booking("B1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn stale_reap_frees_without_archive_when_backup_is_gone() {
        let h = harness(1);
        let (reclaimer, archive) = reclaimer(&h);
        h.sessions.create(7, "B1", pickup()).await.expect("create");
        h.log.produce(0, "7", "{}".into()).await.expect("produce");
        h.store.del(&[connection_counter_key(0), backup_key(0)]).await.expect("del");

        let report = reclaimer.stale_reap().await.expect("reap").wait().await;

        assert_eq!(report, ReapReport { alive: 0, freed: 1, archived: 0, failed: 0 });
        assert!(archive.get("B1").await.expect("get").is_none());
        assert!(h.allocator.occupied().await.expect("occupied").is_empty());
    }

    #[tokio::test]
    async fn empty_window_is_skipped() {
        let h = harness(1);
        let (reclaimer, archive) = reclaimer(&h);
        let window = ArchiveWindow {
            booking_id: "B1".to_string(),
            partition: 0,
            start_offset: 4,
            end_offset: 4,
        };

        assert_eq!(reclaimer.archive_window(&window).await.expect("archive"), 0);
        assert!(archive.get("B1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn reset_clears_pool_and_sessions() {
        let h = harness(1);
        let (reclaimer, _) = reclaimer(&h);
        h.sessions.create(7, "B1", pickup()).await.expect("create");
        h.store.set("unrelated", "1", Expiry::Ttl(TOKEN_TTL)).await.expect("set");

        reclaimer.reset().await.expect("reset");

        assert!(h.allocator.occupied().await.expect("occupied").is_empty());
        assert!(h.sessions.booking("B1").await.expect("get").is_none());
        assert!(!h.store.exists("unrelated").await.expect("exists"));
    }

    #[tokio::test]
    async fn reap_waits_for_a_create_still_writing_its_session() {
        let store = Arc::new(ParkedBatches::default());
        store.armed.store(true, Ordering::SeqCst);
        let log = Arc::new(MemoryPartitionLog::new(1));
        let allocator = PartitionAllocator::new(
            store.clone(),
            LeaseLock::new(store.clone()),
            "partition_manager",
            1,
        );
        let tokens = Arc::new(BookingTokenService::new(TEST_SECRET).expect("token service"));
        let sessions =
            SessionManager::new(store.clone(), log.clone(), allocator.clone(), tokens, TOKEN_TTL);
        let reclaimer =
            Reclaimer::new(store.clone(), log.clone(), allocator.clone(), ArchiveStore::in_memory());

        let creating = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.create(7, "B1", pickup()).await })
        };
        store.parked.notified().await;

        let reaping = tokio::spawn(async move {
            reclaimer.stale_reap().await.expect("reap").wait().await
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!reaping.is_finished(), "reap must wait for the create's pool lease");

        store.resume.notify_one();
        let grant = creating.await.expect("create task").expect("create");
        assert_eq!(grant.session.partition, 0);

        let report = reaping.await.expect("reap task");
        assert_eq!(report, ReapReport { alive: 1, ..ReapReport::default() });
        assert_eq!(allocator.occupied().await.expect("occupied"), vec![0]);

        let next = sessions.create(9, "B2", pickup()).await;
        assert!(matches!(next, Err(StreamError::Busy)));
    }

    #[tokio::test]
    async fn booking_index_splits_watched_and_stale_rides() {
        let h = harness(3);
        let (reclaimer, _) = reclaimer(&h);
        h.sessions.create(7, "B1", pickup()).await.expect("create");
        h.sessions.create(9, "B2", pickup()).await.expect("create");
        h.sessions.create(11, "B3", pickup()).await.expect("create");
        h.store.del(&[connection_counter_key(1)]).await.expect("del");
        h.store.del(&[connection_counter_key(2), backup_key(2)]).await.expect("del");

        let index = reclaimer.bookings().await.expect("index");

        assert_eq!(
            index,
            BookingIndex { active: vec!["B1".to_string()], inactive: vec!["B2".to_string()] }
        );
        assert_eq!(h.allocator.occupied().await.expect("occupied"), vec![0, 1, 2]);
    }
}
