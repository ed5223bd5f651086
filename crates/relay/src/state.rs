// Shared application state.
//
// Wires the storage seams into the session, streaming, and reclaim
// components once at startup. Every handler receives a clone.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    allocator::PartitionAllocator,
    archive::{ArchiveStore, Reclaimer},
    auth::{
        booking_token::BookingTokenService, identity::IdentityTokenService,
        middleware::BookingTokenGate,
    },
    config::RelayConfig,
    db::pool::{check_pool_health, create_pg_pool, PoolConfig},
    directory::BookingDirectory,
    queue::{MemoryPartitionLog, PartitionLog},
    session::SessionManager,
    store::{KeyValueStore, LeaseLock, MemoryKeyValueStore},
    stream::{FanoutSettings, IngestPipeline, ViewerHub},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub log: Arc<dyn PartitionLog>,
    pub allocator: PartitionAllocator,
    pub sessions: SessionManager,
    pub ingest: IngestPipeline,
    pub viewers: ViewerHub,
    pub reclaimer: Reclaimer,
    pub directory: BookingDirectory,
    pub archive: ArchiveStore,
    pub identities: Arc<IdentityTokenService>,
}

impl AppState {
    /// Builds the state for a running server: Postgres directory when a
    /// database URL is configured, GCS or local archives when configured.
    pub async fn from_config(config: RelayConfig) -> anyhow::Result<Self> {
        if config.uses_dev_secrets() {
            warn!("using development token secrets; set TRACKCAST_*_TOKEN_SECRET in production");
        }

        let directory = match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, PoolConfig::default())
                    .await
                    .context("failed to initialize booking directory pool")?;
                check_pool_health(&pool).await.context("booking directory health check failed")?;
                info!("using PostgreSQL booking directory");
                BookingDirectory::Postgres(pool)
            }
            None => {
                warn!("no database configured, using in-memory booking directory");
                BookingDirectory::memory()
            }
        };

        let archive = match (&config.archive_gcs_bucket, &config.archive_dir) {
            (Some(bucket), _) => ArchiveStore::gcs(bucket)?,
            (None, Some(dir)) => ArchiveStore::local(dir)?,
            (None, None) => {
                warn!("no archive backend configured, archives are kept in memory");
                ArchiveStore::in_memory()
            }
        };

        Self::assemble(config, directory, archive)
    }

    /// Fully in-memory state for development and tests.
    pub fn in_memory(config: RelayConfig) -> anyhow::Result<Self> {
        Self::assemble(config, BookingDirectory::memory(), ArchiveStore::in_memory())
    }

    fn assemble(
        config: RelayConfig,
        directory: BookingDirectory,
        archive: ArchiveStore,
    ) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let log: Arc<dyn PartitionLog> = Arc::new(MemoryPartitionLog::new(config.total_partitions));

        let tokens = Arc::new(
            BookingTokenService::new(&config.booking_token_secret)
                .context("invalid booking token secret")?,
        );
        let identities = Arc::new(
            IdentityTokenService::new(&config.identity_token_secret)
                .context("invalid identity token secret")?,
        );

        let lock = LeaseLock::with_timing(
            Arc::clone(&store),
            config.lock_lease,
            config.lock_timeout,
            config.lock_poll_interval,
        );
        let allocator = PartitionAllocator::new(
            Arc::clone(&store),
            lock,
            &config.pool_key,
            config.total_partitions,
        );
        let sessions = SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&log),
            allocator.clone(),
            tokens,
            config.booking_token_ttl,
        );
        let ingest =
            IngestPipeline::new(Arc::clone(&store), Arc::clone(&log), config.cache_write_interval);
        let viewers = ViewerHub::new(
            Arc::clone(&store),
            Arc::clone(&log),
            sessions.clone(),
            FanoutSettings {
                max_connections: config.max_connections,
                read_deadline: config.read_deadline,
                heartbeat_interval: config.heartbeat_interval,
                session_cap: config.view_session_cap,
            },
        );
        let reclaimer = Reclaimer::new(
            Arc::clone(&store),
            Arc::clone(&log),
            allocator.clone(),
            archive.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            log,
            allocator,
            sessions,
            ingest,
            viewers,
            reclaimer,
            directory,
            archive,
            identities,
        })
    }

    /// Booking-token gate for routes that only need a valid signature, or
    /// the configured revocation check on ingest.
    pub fn ingest_gate(&self) -> BookingTokenGate {
        BookingTokenGate {
            sessions: self.sessions.clone(),
            check_remote: self.config.remote_check_on_ingest,
        }
    }

    /// Booking-token gate that also requires the driver's current session.
    pub fn current_session_gate(&self) -> BookingTokenGate {
        BookingTokenGate { sessions: self.sessions.clone(), check_remote: true }
    }
}
