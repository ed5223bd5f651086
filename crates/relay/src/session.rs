// Booking session lifecycle.
//
// A session is the set of keys written together at creation: the booking
// record, the driver record, the partition's live-location seed, viewer
// counter, and backup record. The signed booking token only names the
// session; the driver record decides whether that token is still current.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::{info, warn};
use trackcast_common::{
    keyspace::{
        backup_key, booking_key, connection_counter_key, driver_key, live_location_key,
        BACKUP_TTL_EXTENSION,
    },
    location::{Coordinate, LocationBlob},
    records::{BackupRecord, BookingRecord, DriverRecord, StoredRecord},
};
use uuid::Uuid;

use crate::{
    allocator::{PartitionAllocator, PoolLease},
    auth::booking_token::{
        current_unix_timestamp, BookingClaims, BookingSession, BookingTokenService, IssuedToken,
    },
    error::StreamError,
    queue::PartitionLog,
    store::{BatchCommand, Expiry, KeyValueStore},
};

/// A freshly minted or renewed booking token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session: BookingSession,
    pub token: IssuedToken,
    /// Seconds until the token and its session records expire.
    pub expires_in: i64,
    pub renewed: bool,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    log: Arc<dyn PartitionLog>,
    allocator: PartitionAllocator,
    tokens: Arc<BookingTokenService>,
    token_ttl: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        log: Arc<dyn PartitionLog>,
        allocator: PartitionAllocator,
        tokens: Arc<BookingTokenService>,
        token_ttl: Duration,
    ) -> Self {
        Self { store, log, allocator, tokens, token_ttl }
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub async fn booking(&self, booking_id: &str) -> anyhow::Result<Option<BookingRecord>> {
        self.store
            .get(&booking_key(booking_id))
            .await?
            .map(|raw| BookingRecord::decode(&raw))
            .transpose()
            .with_context(|| format!("booking record for `{booking_id}` is malformed"))
    }

    pub async fn driver_record(&self, driver_id: i64) -> anyhow::Result<Option<DriverRecord>> {
        self.store
            .get(&driver_key(driver_id))
            .await?
            .map(|raw| DriverRecord::decode(&raw))
            .transpose()
            .with_context(|| format!("driver record for `{driver_id}` is malformed"))
    }

    /// Starts a session for `booking_id`, or renews it when the same driver
    /// already holds it.
    ///
    /// `pickup` seeds the live-location cache so viewers have a position to
    /// show before the first update arrives.
    pub async fn create(
        &self,
        driver_id: i64,
        booking_id: &str,
        pickup: Coordinate,
    ) -> Result<SessionGrant, StreamError> {
        if booking_id.trim().is_empty() {
            return Err(StreamError::BadRequest("booking_id is required".to_string()));
        }

        if let Some(existing) = self.booking(booking_id).await? {
            if existing.driver_id != driver_id {
                return Err(StreamError::Conflict(format!(
                    "booking {booking_id} is active under another driver"
                )));
            }
            return self.renew(driver_id, booking_id).await;
        }

        let lease = self.allocator.lock().await?;
        let created = self.claim_and_write(&lease, driver_id, booking_id, pickup).await;
        self.allocator.unlock(lease).await;

        let grant = created?;
        info!(
            booking_id,
            driver_id,
            partition = grant.session.partition,
            session_id = %grant.session.session_id,
            "booking session created"
        );
        Ok(grant)
    }

    /// Claims a partition and writes the session under one pool lease, so a
    /// reap pass never sees the partition claimed but its keys missing.
    async fn claim_and_write(
        &self,
        lease: &PoolLease,
        driver_id: i64,
        booking_id: &str,
        pickup: Coordinate,
    ) -> Result<SessionGrant, StreamError> {
        let partition = self.allocator.claim(lease).await?;
        let written = self.write_session(driver_id, booking_id, partition, pickup).await;
        if written.is_err() {
            if let Err(error) = self.allocator.free(lease, partition).await {
                warn!(partition, error = ?error, "failed to release partition after create failure");
            }
        }
        written
    }

    async fn write_session(
        &self,
        driver_id: i64,
        booking_id: &str,
        partition: u32,
        pickup: Coordinate,
    ) -> Result<SessionGrant, StreamError> {
        let start_offset = self.log.high_watermark(partition).await?;
        let now = current_unix_timestamp()?;
        let session = BookingSession {
            session_id: Uuid::new_v4().to_string(),
            driver_id,
            booking_id: booking_id.to_owned(),
            partition,
        };
        let lifetime_secs = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let token = self.tokens.issue_at(&session, now, lifetime_secs)?;

        let seed = serde_json::to_string(&LocationBlob::seed(pickup, now))
            .context("failed to encode live location seed")?;
        let ttl = self.token_ttl;
        let batch = vec![
            BatchCommand::SetIfAbsent {
                key: driver_key(driver_id),
                value: DriverRecord {
                    session_id: session.session_id.clone(),
                    booking_id: booking_id.to_owned(),
                    partition,
                }
                .encode(),
                ttl,
            },
            BatchCommand::SetIfAbsent {
                key: booking_key(booking_id),
                value: BookingRecord { partition, start_offset, driver_id }.encode(),
                ttl,
            },
            BatchCommand::SetIfAbsent { key: live_location_key(partition), value: seed, ttl },
            BatchCommand::SetIfAbsent {
                key: connection_counter_key(partition),
                value: "0".to_string(),
                ttl,
            },
            BatchCommand::SetIfAbsent {
                key: backup_key(partition),
                value: BackupRecord { booking_id: booking_id.to_owned(), start_offset }.encode(),
                ttl: ttl + BACKUP_TTL_EXTENSION,
            },
        ];
        let keys: Vec<String> = batch.iter().map(|command| command.key().to_owned()).collect();

        let written = self.store.exec(batch).await?;
        if written.iter().all(|applied| *applied) {
            let expires_in = token.expires_in(now);
            return Ok(SessionGrant { session, token, expires_in, renewed: false });
        }

        let (applied, rejected): (Vec<_>, Vec<_>) =
            keys.into_iter().zip(written).partition(|(_, applied)| *applied);
        let applied: Vec<String> = applied.into_iter().map(|(key, _)| key).collect();
        let rejected: Vec<String> = rejected.into_iter().map(|(key, _)| key).collect();
        if let Err(error) = self.store.del(&applied).await {
            warn!(booking_id, ?applied, error = ?error, "failed to roll back partial session");
        }

        Err(StreamError::Conflict(format!(
            "session state for booking {booking_id} already exists: {}",
            rejected.join(", ")
        )))
    }

    /// Re-mints the token of a live session without extending its lifetime.
    pub async fn renew(&self, driver_id: i64, booking_id: &str) -> Result<SessionGrant, StreamError> {
        let record = self
            .booking(booking_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(format!("booking {booking_id} is not active")))?;
        if record.driver_id != driver_id {
            return Err(StreamError::Unauthorized(format!(
                "booking {booking_id} does not belong to driver {driver_id}"
            )));
        }

        let remaining = self
            .store
            .ttl(&booking_key(booking_id))
            .await?
            .remaining()
            .filter(|remaining| remaining.as_secs() > 0)
            .ok_or_else(|| StreamError::Unauthorized("session has expired".to_string()))?;
        let lifetime_secs = i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX);

        let session = BookingSession {
            session_id: Uuid::new_v4().to_string(),
            driver_id,
            booking_id: booking_id.to_owned(),
            partition: record.partition,
        };
        let now = current_unix_timestamp()?;
        let token = self.tokens.issue_at(&session, now, lifetime_secs)?;
        let driver_record = DriverRecord {
            session_id: session.session_id.clone(),
            booking_id: booking_id.to_owned(),
            partition: record.partition,
        };
        self.store
            .set(&driver_key(driver_id), &driver_record.encode(), Expiry::Ttl(remaining))
            .await?;

        info!(booking_id, driver_id, remaining_secs = lifetime_secs, "booking session renewed");
        let expires_in = token.expires_in(now);
        Ok(SessionGrant { session, token, expires_in, renewed: true })
    }

    /// Verifies a booking token. With `check_remote`, the token must also be
    /// the driver's current session, so overwriting or deleting the driver
    /// record revokes it.
    pub async fn validate(
        &self,
        token: &str,
        check_remote: bool,
    ) -> Result<BookingClaims, StreamError> {
        let claims = self.tokens.validate(token).map_err(|error| {
            StreamError::Unauthorized(format!("invalid booking token: {error:#}"))
        })?;

        if check_remote && !self.is_current(&claims).await? {
            return Err(StreamError::Unauthorized("booking session is no longer active".into()));
        }

        Ok(claims)
    }

    /// Whether `claims` still name the driver's current session.
    pub async fn is_current(&self, claims: &BookingClaims) -> anyhow::Result<bool> {
        let current = self.driver_record(claims.driver_id).await?;
        Ok(current.is_some_and(|record| {
            record.session_id == claims.sub && record.booking_id == claims.booking_id
        }))
    }

    pub fn get(&self, claims: &BookingClaims) -> BookingSession {
        BookingSession::from(claims)
    }
}
