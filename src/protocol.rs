//! Shared constants for the rstream framed transport and both engines.

/// Default TCP port (listen on the server, connect on the client).
pub const DEFAULT_PORT: u16 = 4096;

/// One filesystem block: the unit of file reads on the server side.
pub const FS_BLOCK: usize = 8 * 1024;

/// One network block: socket read/write granularity.
pub const NETWORK_BLOCK: usize = 64 * 1024;

/// Per-session read and write buffer capacity.
pub const SESSION_BUFFER: usize = 4 * 1024 * 1024;

/// Headroom a subscriber's write buffer must have beyond the block itself
/// (frame header plus slack).
pub const FRAME_SLACK: usize = 256;

/// Maximum stat() calls processed per engine tick.
pub const STAT_BATCH: usize = 50;

/// Engine tick interval in milliseconds.
pub const TICK_MS: u64 = 100;

/// Fixed client reconnect delay in seconds.
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// Maximum outstanding STREAM requests across all sources (client side).
pub const MAX_CONCURRENT_DOWNLOADS: usize = 1;

/// A source whose read buffer has less than this much room is skipped
/// when scheduling new requests.
pub const READ_HEADROOM: usize = 10 * NETWORK_BLOCK;

/// Hard bound on a frame header. Headers are nominally under 256 bytes;
/// a stream with no `}` terminator inside this window is unrecoverable.
pub const MAX_HEADER: usize = 4096;

/// Append-poll backoff bounds for idle watched files. The delay doubles
/// while polls come back empty and resets as soon as bytes are produced.
pub const SCAN_BACKOFF_MIN_MS: u64 = 100;
pub const SCAN_BACKOFF_MAX_MS: u64 = 1000;
