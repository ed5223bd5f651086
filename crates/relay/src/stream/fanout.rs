use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};
use trackcast_common::{
    keyspace::{connection_counter_key, live_location_key},
    records::BookingRecord,
};

use crate::{
    error::StreamError,
    queue::{PartitionLog, PartitionReader},
    session::SessionManager,
    store::{BoundedIncr, KeyValueStore},
};

const VIEWER_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub max_connections: i64,
    pub read_deadline: Duration,
    /// Interval of the rebinding check (and of WS pings).
    pub heartbeat_interval: Duration,
    pub session_cap: Duration,
}

/// One attached viewer. Payloads arrive on `receiver` until the ride ends,
/// the session cap elapses, or the receiver is dropped.
#[derive(Debug)]
pub struct ViewerFeed {
    pub booking_id: String,
    pub partition: u32,
    pub receiver: mpsc::Receiver<String>,
}

/// Viewer side of a ride.
#[derive(Clone)]
pub struct ViewerHub {
    store: Arc<dyn KeyValueStore>,
    log: Arc<dyn PartitionLog>,
    sessions: SessionManager,
    settings: FanoutSettings,
}

impl ViewerHub {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        log: Arc<dyn PartitionLog>,
        sessions: SessionManager,
        settings: FanoutSettings,
    ) -> Self {
        Self { store, log, sessions, settings }
    }

    pub fn settings(&self) -> &FanoutSettings {
        &self.settings
    }

    /// Admits a viewer for `booking_id` and starts its feed.
    ///
    /// A full partition is rejected without touching the counter.
    pub async fn attach(&self, booking_id: &str) -> Result<ViewerFeed, StreamError> {
        let record = self
            .sessions
            .booking(booking_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(format!("booking {booking_id} is not active")))?;
        let partition = record.partition;
        let counter = connection_counter_key(partition);

        match self.store.incr_below(&counter, self.settings.max_connections).await? {
            BoundedIncr::Incremented(connections) => {
                info!(booking_id, partition, connections, "viewer attached");
            }
            BoundedIncr::AtLimit(connections) => {
                warn!(booking_id, partition, connections, "viewer limit reached");
                return Err(StreamError::ViewerLimitReached { partition, connections });
            }
            BoundedIncr::Missing => {
                return Err(StreamError::NotFound(format!("booking {booking_id} is not active")));
            }
        }

        let reader = match self.log.subscribe_tail(partition).await {
            Ok(reader) => reader,
            Err(error) => {
                self.detach(booking_id, &record).await;
                return Err(StreamError::Internal(error));
            }
        };

        let (sender, receiver) = mpsc::channel(VIEWER_BUFFER);
        let hub = self.clone();
        let owned_booking_id = booking_id.to_owned();
        tokio::spawn(async move {
            hub.run_feed(&owned_booking_id, &record, reader, sender).await;
            hub.detach(&owned_booking_id, &record).await;
        });

        Ok(ViewerFeed { booking_id: booking_id.to_owned(), partition, receiver })
    }

    async fn run_feed(
        &self,
        booking_id: &str,
        binding: &BookingRecord,
        mut reader: Box<dyn PartitionReader>,
        sender: mpsc::Sender<String>,
    ) {
        let partition = binding.partition;
        let session_cap = tokio::time::sleep(self.settings.session_cap);
        tokio::pin!(session_cap);
        let mut rebinding_check = tokio::time::interval(self.settings.heartbeat_interval);
        rebinding_check.reset();

        let mut last_location = self.cached_location(partition).await;

        loop {
            tokio::select! {
                _ = &mut session_cap => {
                    debug!(booking_id, partition, "viewer session cap reached");
                    break;
                }
                _ = sender.closed() => break,
                _ = rebinding_check.tick() => {
                    if !self.still_bound(booking_id, binding).await {
                        info!(booking_id, partition, "booking no longer owns partition, closing viewer");
                        break;
                    }
                }
                read = timeout(self.settings.read_deadline, reader.next()) => {
                    let payload = match read {
                        Ok(Ok(record)) if record.payload.is_empty() => continue,
                        Ok(Ok(record)) => {
                            last_location = Some(record.payload.clone());
                            record.payload
                        }
                        Ok(Err(error)) => {
                            warn!(booking_id, partition, error = ?error, "failed to read partition");
                            continue;
                        }
                        Err(_) => {
                            if last_location.is_none() {
                                last_location = self.cached_location(partition).await;
                            }
                            let Some(location) = last_location.clone() else {
                                continue;
                            };
                            location
                        }
                    };

                    if sender.send(payload).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn cached_location(&self, partition: u32) -> Option<String> {
        match self.store.get(&live_location_key(partition)).await {
            Ok(location) => location,
            Err(error) => {
                warn!(partition, error = ?error, "failed to read live cache");
                None
            }
        }
    }

    /// Whether `booking_id` is still the ride the viewer attached to. A new
    /// ride on the same partition writes a fresh booking record.
    async fn still_bound(&self, booking_id: &str, binding: &BookingRecord) -> bool {
        match self.sessions.booking(booking_id).await {
            Ok(Some(record)) => record == *binding,
            Ok(None) => false,
            // A store hiccup is not proof the ride ended.
            Err(error) => {
                warn!(booking_id, error = ?error, "rebinding check failed");
                true
            }
        }
    }

    async fn detach(&self, booking_id: &str, binding: &BookingRecord) {
        let partition = binding.partition;
        // The counter belongs to whichever ride holds the partition now.
        if !self.still_bound(booking_id, binding).await {
            debug!(booking_id, partition, "viewer detached from an ended session");
            return;
        }
        match self.store.decr_clamped(&connection_counter_key(partition)).await {
            Ok(Some(connections)) => debug!(partition, connections, "viewer detached"),
            Ok(None) => debug!(partition, "viewer counter already gone"),
            Err(error) => warn!(partition, error = ?error, "failed to release viewer slot"),
        }
    }
}
