/// Default base URL of the HTTP authentication service
pub const DEFAULT_API_URL: &str = "http://localhost:8002/api/v1";

/// Default chat socket endpoint
pub const DEFAULT_WS_URL: &str = "ws://localhost:8002/api/v1/ws";

/// Default capacity of the outbound writer queue (frames)
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Default bound on a single connect attempt (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default number of reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before the first reconnect attempt (milliseconds)
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Default ceiling on the reconnect delay (milliseconds)
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Default upper bound of random jitter added to each delay (milliseconds)
pub const DEFAULT_RECONNECT_JITTER_MS: u64 = 250;
