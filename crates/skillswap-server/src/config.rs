//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use skillswap_shared::constants;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./skillswap.db`
    pub database_path: PathBuf,

    /// Directory holding uploaded resource files.
    /// Env: `CONTENT_DIR`
    /// Default: `./p2p_resources`
    pub content_dir: PathBuf,

    /// Default piece size for uploads that do not pick one.
    /// Env: `PIECE_SIZE`
    pub piece_size: usize,

    /// Env: `MAX_UPLOAD_SIZE`
    pub max_upload_size: usize,

    /// Outbound frames buffered per session before it is evicted.
    /// Env: `SESSION_QUEUE_CAPACITY`
    pub session_queue_capacity: usize,

    /// Announces older than this are left out of active swarm stats.
    /// Env: `SWARM_STALE_SECS`
    pub swarm_stale_after: Duration,

    /// Env: `PING_INTERVAL_SECS`
    pub ping_interval: Duration,

    /// Env: `READ_TIMEOUT_SECS`
    pub read_timeout: Duration,

    /// Largest inbound WebSocket message accepted.
    /// Env: `MAX_FRAME_SIZE`
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], constants::DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./skillswap.db"),
            content_dir: PathBuf::from("./p2p_resources"),
            piece_size: constants::DEFAULT_PIECE_SIZE,
            max_upload_size: constants::MAX_UPLOAD_SIZE,
            session_queue_capacity: constants::SESSION_QUEUE_CAPACITY,
            swarm_stale_after: Duration::from_secs(constants::SWARM_STALE_SECS),
            ping_interval: Duration::from_secs(constants::PING_INTERVAL_SECS),
            read_timeout: Duration::from_secs(constants::READ_TIMEOUT_SECS),
            max_frame_size: constants::MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Invalid values log
    /// a warning and keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("CONTENT_DIR") {
            config.content_dir = PathBuf::from(path);
        }

        parse_into(&lookup, "PIECE_SIZE", &mut config.piece_size);
        if config.piece_size == 0 {
            tracing::warn!("PIECE_SIZE must be positive, using default");
            config.piece_size = constants::DEFAULT_PIECE_SIZE;
        }

        parse_into(&lookup, "MAX_UPLOAD_SIZE", &mut config.max_upload_size);

        parse_into(
            &lookup,
            "SESSION_QUEUE_CAPACITY",
            &mut config.session_queue_capacity,
        );
        if config.session_queue_capacity == 0 {
            tracing::warn!("SESSION_QUEUE_CAPACITY must be positive, using default");
            config.session_queue_capacity = constants::SESSION_QUEUE_CAPACITY;
        }

        parse_secs_into(&lookup, "SWARM_STALE_SECS", &mut config.swarm_stale_after);
        parse_secs_into(&lookup, "PING_INTERVAL_SECS", &mut config.ping_interval);
        parse_secs_into(&lookup, "READ_TIMEOUT_SECS", &mut config.read_timeout);

        parse_into(&lookup, "MAX_FRAME_SIZE", &mut config.max_frame_size);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };

    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
        }
    }
}

fn parse_secs_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    if secs == 0 {
        tracing::warn!(key, "Duration must be positive, using default");
        return;
    }
    *slot = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.piece_size, 1024 * 1024);
        assert_eq!(config.ping_interval, Duration::from_secs(54));
        assert_eq!(config.content_dir, PathBuf::from("./p2p_resources"));
    }

    #[test]
    fn test_overrides_applied() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("PIECE_SIZE", "4096"),
            ("SWARM_STALE_SECS", "60"),
            ("CONTENT_DIR", "/tmp/pieces"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.piece_size, 4096);
        assert_eq!(config.swarm_stale_after, Duration::from_secs(60));
        assert_eq!(config.content_dir, PathBuf::from("/tmp/pieces"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("PIECE_SIZE", "0"),
            ("READ_TIMEOUT_SECS", "soon"),
            ("SESSION_QUEUE_CAPACITY", "-3"),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.piece_size, defaults.piece_size);
        assert_eq!(config.read_timeout, defaults.read_timeout);
        assert_eq!(config.session_queue_capacity, defaults.session_queue_capacity);
    }
}
