use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trackcast_common::{
    keyspace::{driver_key, live_location_key},
    location::LocationUpdate,
};

use crate::{
    auth::booking_token::{current_unix_timestamp, BookingSession},
    error::StreamError,
    queue::PartitionLog,
    store::KeyValueStore,
};

/// Updates seen for the ride currently publishing to a partition.
#[derive(Debug, Default)]
struct Cadence {
    booking_id: String,
    updates: u64,
}

#[derive(Debug)]
pub struct IngestReceipt {
    pub offset: i64,
    /// Set when this update also refreshes the live-location cache.
    pub cache_refresh: Option<JoinHandle<()>>,
}

/// Producer side of a ride: validates updates, appends them to the
/// session's partition, and keeps the live cache roughly current.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn KeyValueStore>,
    log: Arc<dyn PartitionLog>,
    cache_write_interval: u64,
    cadence: Arc<Vec<Mutex<Cadence>>>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        log: Arc<dyn PartitionLog>,
        cache_write_interval: u64,
    ) -> Self {
        let cadence = (0..log.partition_count()).map(|_| Mutex::default()).collect();
        Self {
            store,
            log,
            cache_write_interval: cache_write_interval.max(1),
            cadence: Arc::new(cadence),
        }
    }

    pub async fn ingest(
        &self,
        session: &BookingSession,
        update: LocationUpdate,
    ) -> Result<IngestReceipt, StreamError> {
        let blob = update
            .into_blob(current_unix_timestamp()?)
            .map_err(|error| StreamError::BadRequest(error.to_string()))?;
        let payload = serde_json::to_string(&blob).context("failed to encode location update")?;

        let offset = self
            .log
            .produce(session.partition, &driver_key(session.driver_id), payload.clone())
            .await?;
        debug!(booking_id = %session.booking_id, partition = session.partition, offset, "location ingested");

        let cache_refresh = self.is_cache_turn(session).then(|| {
            let store = Arc::clone(&self.store);
            let key = live_location_key(session.partition);
            tokio::spawn(async move {
                match store.replace(&key, &payload).await {
                    Ok(true) => {}
                    Ok(false) => debug!(key, "live cache expired, skipping refresh"),
                    Err(error) => warn!(key, error = ?error, "failed to refresh live cache"),
                }
            })
        });

        Ok(IngestReceipt { offset, cache_refresh })
    }

    fn is_cache_turn(&self, session: &BookingSession) -> bool {
        let Some(slot) = self.cadence.get(session.partition as usize) else {
            return false;
        };
        let Ok(mut cadence) = slot.lock() else {
            warn!(partition = session.partition, "cache cadence lock poisoned");
            return false;
        };

        // A new ride on the partition starts its own count.
        if cadence.booking_id != session.booking_id {
            *cadence = Cadence { booking_id: session.booking_id.clone(), updates: 0 };
        }
        cadence.updates += 1;
        cadence.updates % self.cache_write_interval == 0
    }
}
