/// Application name
pub const APP_NAME: &str = "SkillSwap";

/// Default piece size for uploaded resources (1 MiB)
pub const DEFAULT_PIECE_SIZE: usize = 1024 * 1024;

/// Maximum upload size in bytes (500 MiB)
pub const MAX_UPLOAD_SIZE: usize = 500 * 1024 * 1024;

/// Maximum inbound WebSocket frame size (512 KiB)
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Outbound queue capacity per session
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Registry control loop command queue capacity
pub const REGISTRY_COMMAND_CAPACITY: usize = 1024;

/// Keepalive ping interval in seconds
pub const PING_INTERVAL_SECS: u64 = 54;

/// Read deadline in seconds, refreshed by any inbound traffic
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Write deadline for a single outbound frame in seconds
pub const WRITE_TIMEOUT_SECS: u64 = 10;

/// Peers that have not announced within this window are left out of
/// "active" swarm statistics (1 hour)
pub const SWARM_STALE_SECS: u64 = 3600;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
