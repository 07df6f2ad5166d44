// Fundamental configuration constants
pub const APP_ID: &str = "rusty-comet";
pub const DEFAULT_TCP_BIND: &str = "0.0.0.0:3101";
pub const DEFAULT_WS_BIND: &str = "0.0.0.0:3102";
pub const DEFAULT_RPC_BIND: &str = "0.0.0.0:3109";
pub const WS_PATH: &str = "sub";

// Registry sharding
pub const DEFAULT_BUCKET_COUNT: usize = 32;

// Per-connection limits
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_MAX_BODY_SIZE: usize = 4096;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 8;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 240;

// Slow-consumer policy: more than THRESHOLD displaced frames within WINDOW evicts the channel
pub const DEFAULT_OVERFLOW_THRESHOLD: u32 = 64;
pub const DEFAULT_OVERFLOW_WINDOW_SECS: u64 = 10;

// Lifecycle
pub const DEFAULT_DRAIN_GRACE_SECS: u64 = 5;
pub const DEFAULT_IDLE_SWEEP_SECS: u64 = 30;
pub const DRAIN_POLL_INTERVAL_MS: u64 = 25;

// Discovery
pub const DEFAULT_DISCOVERY_REFRESH_SECS: u64 = 10;
pub const DISCOVERY_RETRY_SECS: u64 = 1;
pub const DEFAULT_WEIGHT: i64 = 10;
