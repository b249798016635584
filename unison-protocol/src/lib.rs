pub mod message;
pub mod time;
pub mod types;

/// Wire protocol version carried in `hello`.
pub const PROTO_VERSION: u32 = 1;

/// Receivers treat a `host_state` older than this as stale.
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 1200;
