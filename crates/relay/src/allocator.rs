// Partition pool allocator.
//
// The pool key holds the set of partitions currently assigned to a
// booking. Membership only changes while the pool's lease lock is held, so
// two concurrent creates can never claim the same partition and a reap
// pass never frees a partition whose session is still being written.

use std::{collections::BTreeSet, sync::Arc};

use anyhow::anyhow;
use tracing::{info, warn};
use trackcast_common::keyspace::{parse_pool_member, pool_lock_key, pool_member};

use crate::{
    error::StreamError,
    store::{KeyValueStore, LeaseLock, LeaseToken},
};

/// Held pool lease. Claiming and freeing through a `PoolLease` lets a caller
/// keep the pool locked across several steps.
#[derive(Debug)]
pub struct PoolLease(LeaseToken);

#[derive(Clone)]
pub struct PartitionAllocator {
    store: Arc<dyn KeyValueStore>,
    lock: LeaseLock,
    pool_key: String,
    total_partitions: u32,
}

impl PartitionAllocator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        lock: LeaseLock,
        pool_key: impl Into<String>,
        total_partitions: u32,
    ) -> Self {
        Self { store, lock, pool_key: pool_key.into(), total_partitions }
    }

    /// Takes the pool lease. Timing out is [`StreamError::Busy`].
    pub async fn lock(&self) -> Result<PoolLease, StreamError> {
        Ok(PoolLease(self.lock.acquire(&pool_lock_key(&self.pool_key)).await?))
    }

    pub async fn unlock(&self, lease: PoolLease) {
        if let Err(error) = self.lock.release(lease.0).await {
            warn!(pool_key = %self.pool_key, error = ?error, "failed to release pool lock");
        }
    }

    /// Reserves the lowest free partition.
    pub async fn claim(&self, _lease: &PoolLease) -> Result<u32, StreamError> {
        let partition = self.claim_lowest_free().await?;
        info!(partition, "partition acquired");
        Ok(partition)
    }

    /// Returns `partition` to the pool. Freeing a free partition is a no-op.
    pub async fn free(&self, _lease: &PoolLease, partition: u32) -> anyhow::Result<()> {
        if self.store.srem(&self.pool_key, &pool_member(partition)).await? {
            info!(partition, "partition released");
        }
        Ok(())
    }

    async fn claim_lowest_free(&self) -> Result<u32, StreamError> {
        let members = self.store.smembers(&self.pool_key).await?;

        let mut occupied = BTreeSet::new();
        let mut malformed = Vec::new();
        for member in members {
            match parse_pool_member(&member) {
                Some(partition) => {
                    occupied.insert(partition);
                }
                None => malformed.push(member),
            }
        }

        if !malformed.is_empty() {
            for member in &malformed {
                self.store.srem(&self.pool_key, member).await?;
            }
            warn!(pool_key = %self.pool_key, ?malformed, "removed malformed pool members");
            return Err(StreamError::Internal(anyhow!(
                "pool `{}` contained {} malformed members",
                self.pool_key,
                malformed.len()
            )));
        }

        let Some(partition) = (0..self.total_partitions).find(|p| !occupied.contains(p)) else {
            return Err(StreamError::Busy);
        };

        self.store.sadd(&self.pool_key, &pool_member(partition)).await?;
        Ok(partition)
    }

    /// Partitions currently assigned, skipping members that do not parse.
    pub async fn occupied(&self) -> anyhow::Result<Vec<u32>> {
        let members = self.store.smembers(&self.pool_key).await?;
        let mut partitions: Vec<u32> =
            members.iter().filter_map(|member| parse_pool_member(member)).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}
