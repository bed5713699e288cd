//! Server configuration.
//!
//! Environment variables are the sole config source.  Every knob has a
//! default except `DATABASE_URL`; invalid numeric values abort startup
//! rather than falling back silently.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("PING_PERIOD_MS ({ping_ms}ms) must be shorter than PONG_WAIT_MS ({pong_ms}ms)")]
    PingPeriod { ping_ms: u64, pong_ms: u64 },
}

/// Process-wide configuration, assembled once in `main` and shared through
/// `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Server key accepted as the username of `Basic` credentials on the
    /// authenticate endpoints.
    pub server_key: String,
    /// Opaque key compared verbatim against the `http_key` query parameter
    /// on the RPC endpoint.
    pub http_key: String,
    /// HMAC-SHA256 signing key for session tokens.
    pub token_signing_key: String,
    /// Session token lifetime in seconds.
    pub token_expiry_secs: i64,
    /// Capacity of each session's bounded outgoing queue.
    pub session_queue_size: usize,
    /// Interval between server pings on an idle connection.
    pub ping_period: Duration,
    /// Read deadline; a connection with no inbound frames for this long is
    /// considered dead.
    pub pong_wait: Duration,
    /// Deadline for a single wire write.
    pub write_wait: Duration,
    /// Number of inbound messages that elapse before the ping timer is
    /// pushed back (liveness piggybacks on genuine traffic).
    pub ping_backoff_threshold: u32,
    /// Leaderboard ids excluded from rank caching.  The single entry `*`
    /// disables caching entirely.
    pub rank_cache_blacklist: HashSet<String>,
    pub rank_warmup_workers: usize,
    pub rank_warmup_page_size: i64,
}

fn parsed<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let ping_ms: u64 = parsed("PING_PERIOD_MS", 15_000)?;
        let pong_ms: u64 = parsed("PONG_WAIT_MS", 25_000)?;
        if ping_ms >= pong_ms {
            return Err(ConfigError::PingPeriod { ping_ms, pong_ms });
        }

        let blacklist = env::var("RANK_CACHE_BLACKLIST").unwrap_or_default();
        let rank_cache_blacklist: HashSet<String> = blacklist
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:7350".to_owned()),
            database_url,
            server_key: env::var("SERVER_KEY").unwrap_or_else(|_| "defaultkey".to_owned()),
            http_key: env::var("HTTP_KEY").unwrap_or_else(|_| "defaulthttpkey".to_owned()),
            token_signing_key: env::var("TOKEN_SIGNING_KEY")
                .unwrap_or_else(|_| "defaultencryptionkey".to_owned()),
            token_expiry_secs: parsed("TOKEN_EXPIRY_SECS", 3600)?,
            session_queue_size: parsed("SESSION_QUEUE_SIZE", 16)?,
            ping_period: Duration::from_millis(ping_ms),
            pong_wait: Duration::from_millis(pong_ms),
            write_wait: Duration::from_millis(parsed("WRITE_WAIT_MS", 10_000)?),
            ping_backoff_threshold: parsed("PING_BACKOFF_THRESHOLD", 20)?,
            rank_cache_blacklist,
            rank_warmup_workers: parsed("RANK_WARMUP_WORKERS", 4)?,
            rank_warmup_page_size: parsed("RANK_WARMUP_PAGE_SIZE", 10_000)?,
        })
    }

    /// Whether rank caching is switched off globally.
    pub fn rank_cache_disabled(&self) -> bool {
        self.rank_cache_blacklist.contains("*")
    }
}
