// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every tunable of the partition pool, session lifecycle,
// and viewer streams is read here and injected into the components.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use trackcast_common::keyspace::DEFAULT_POOL_KEY;

const DEV_BOOKING_TOKEN_SECRET: &str = "trackcast_local_development_booking_secret_32_chars";
const DEV_IDENTITY_TOKEN_SECRET: &str = "trackcast_local_development_identity_secret_32_chars";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `trackcast_relay=debug`).
    pub log_filter: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
    /// HS256 secret for booking tokens.
    pub booking_token_secret: String,
    /// HS256 secret for driver/admin identity tokens.
    pub identity_token_secret: String,
    pub booking_token_ttl: Duration,
    pub total_partitions: u32,
    /// Viewers allowed per partition.
    pub max_connections: i64,
    /// The live cache is written on every Nth ingested update.
    pub cache_write_interval: u64,
    pub heartbeat_interval: Duration,
    /// How long a viewer waits on the log before replaying the last location.
    pub read_deadline: Duration,
    /// Upper bound on one viewer stream.
    pub view_session_cap: Duration,
    pub lock_lease: Duration,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub pool_key: String,
    /// Require ingest tokens to be the driver's current session.
    pub remote_check_on_ingest: bool,
    /// PostgreSQL booking directory; the in-memory directory is used when unset.
    pub database_url: Option<String>,
    pub archive_dir: Option<PathBuf>,
    pub archive_gcs_bucket: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TRACKCAST_HOST` | `0.0.0.0` |
    /// | `TRACKCAST_PORT` | `8080` |
    /// | `TRACKCAST_LOG_FILTER` | `info` |
    /// | `TRACKCAST_LOG_JSON` | `false` |
    /// | `TRACKCAST_BOOKING_TOKEN_SECRET` | dev-only placeholder |
    /// | `TRACKCAST_IDENTITY_TOKEN_SECRET` | dev-only placeholder |
    /// | `TRACKCAST_BOOKING_TOKEN_TTL_SECS` | `14400` |
    /// | `TRACKCAST_TOTAL_PARTITIONS` | `10` |
    /// | `TRACKCAST_MAX_CONNECTIONS` | `10` |
    /// | `TRACKCAST_CACHE_WRITE_INTERVAL` | `5` |
    /// | `TRACKCAST_HEARTBEAT_INTERVAL_MS` | `5000` |
    /// | `TRACKCAST_READ_DEADLINE_MS` | `2000` |
    /// | `TRACKCAST_VIEW_SESSION_CAP_SECS` | `3600` |
    /// | `TRACKCAST_LOCK_LEASE_MS` | `2000` |
    /// | `TRACKCAST_LOCK_TIMEOUT_MS` | `3000` |
    /// | `TRACKCAST_LOCK_POLL_MS` | `100` |
    /// | `TRACKCAST_POOL_KEY` | `partition_manager` |
    /// | `TRACKCAST_REMOTE_CHECK_ON_INGEST` | `true` |
    /// | `TRACKCAST_DATABASE_URL` | *(none)* |
    /// | `TRACKCAST_ARCHIVE_DIR` | *(none)* |
    /// | `TRACKCAST_ARCHIVE_GCS_BUCKET` | *(none)* |
    /// | `TRACKCAST_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let number = |key: &str, default: u64| -> u64 {
            env(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let flag = |key: &str, default: bool| -> bool {
            match env(key).ok().map(|v| v.trim().to_ascii_lowercase()) {
                Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
                Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
                _ => default,
            }
        };
        let optional = |key: &str| env(key).ok().filter(|v| !v.trim().is_empty());

        let host = env("TRACKCAST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("TRACKCAST_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let total_partitions =
            u32::try_from(number("TRACKCAST_TOTAL_PARTITIONS", 10)).unwrap_or(u32::MAX).max(1);
        let max_connections =
            i64::try_from(number("TRACKCAST_MAX_CONNECTIONS", 10)).unwrap_or(i64::MAX).max(1);

        Self {
            listen_addr,
            log_filter: env("TRACKCAST_LOG_FILTER").unwrap_or_else(|_| "info".into()),
            log_json: flag("TRACKCAST_LOG_JSON", false),
            booking_token_secret: env("TRACKCAST_BOOKING_TOKEN_SECRET")
                .unwrap_or_else(|_| DEV_BOOKING_TOKEN_SECRET.into()),
            identity_token_secret: env("TRACKCAST_IDENTITY_TOKEN_SECRET")
                .unwrap_or_else(|_| DEV_IDENTITY_TOKEN_SECRET.into()),
            booking_token_ttl: Duration::from_secs(
                number("TRACKCAST_BOOKING_TOKEN_TTL_SECS", 4 * 60 * 60).max(1),
            ),
            total_partitions,
            max_connections,
            cache_write_interval: number("TRACKCAST_CACHE_WRITE_INTERVAL", 5).max(1),
            heartbeat_interval: Duration::from_millis(
                number("TRACKCAST_HEARTBEAT_INTERVAL_MS", 5_000).max(1),
            ),
            read_deadline: Duration::from_millis(number("TRACKCAST_READ_DEADLINE_MS", 2_000).max(1)),
            view_session_cap: Duration::from_secs(
                number("TRACKCAST_VIEW_SESSION_CAP_SECS", 60 * 60).max(1),
            ),
            lock_lease: Duration::from_millis(number("TRACKCAST_LOCK_LEASE_MS", 2_000).max(1)),
            lock_timeout: Duration::from_millis(number("TRACKCAST_LOCK_TIMEOUT_MS", 3_000).max(1)),
            lock_poll_interval: Duration::from_millis(number("TRACKCAST_LOCK_POLL_MS", 100).max(1)),
            pool_key: optional("TRACKCAST_POOL_KEY").unwrap_or_else(|| DEFAULT_POOL_KEY.into()),
            remote_check_on_ingest: flag("TRACKCAST_REMOTE_CHECK_ON_INGEST", true),
            database_url: optional("TRACKCAST_DATABASE_URL"),
            archive_dir: optional("TRACKCAST_ARCHIVE_DIR").map(PathBuf::from),
            archive_gcs_bucket: optional("TRACKCAST_ARCHIVE_GCS_BUCKET"),
            cors_origins: optional("TRACKCAST_CORS_ORIGINS"),
        }
    }

    /// Returns true when either token secret is a development placeholder.
    pub fn uses_dev_secrets(&self) -> bool {
        self.booking_token_secret == DEV_BOOKING_TOKEN_SECRET
            || self.identity_token_secret == DEV_IDENTITY_TOKEN_SECRET
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}
