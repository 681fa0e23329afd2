pub const DEFAULT_PORT: u16 = 8080;

pub const SEND_RETRIES: u32 = 3;
pub const SEND_TIMEOUT_MS: u64 = 10_000;
pub const RETRY_DELAY_MS: u64 = 1_000;

pub const RECONNECT_MIN_INTERVAL_MS: u64 = 2_000;
pub const RECONNECT_TIMEOUT_MS: u64 = 5_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const SNAPSHOT_TIMEOUT_MS: u64 = 10_000;

/// Number of authority event ids remembered for inbound de-duplication.
pub const DEDUPE_WINDOW: usize = 256;
/// Acknowledgements cached per player so retried requests are not re-applied.
pub const REPLY_CACHE_PER_PLAYER: usize = 64;

pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
pub const MAX_DISPLAY_NAME_CHARS: usize = 24;
