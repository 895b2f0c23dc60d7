//! Engine-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable. Most of them are
//! defaults that `config.rs` lets an operator override.

/// Push-wait timeout in seconds before the session re-issues IDLE.
/// Servers without IDLE sleep this long between NOOP keep-alives.
pub const IDLE_TIMEOUT_SECS: u64 = 60;

/// Interval in milliseconds between inbound/outbound action drain passes.
pub const DRAIN_INTERVAL_MS: u64 = 1000;

/// Interval in seconds between mailbox refresh passes.
pub const REFRESH_INTERVAL_SECS: u64 = 120;

/// Interval in seconds between liveness checks. An account with no
/// observed activity over a full interval is retired.
pub const LIVENESS_INTERVAL_SECS: u64 = 900;

/// Seconds a mailbox is skipped after an authentication failure.
pub const AUTH_ERROR_BACKOFF_SECS: u64 = 3600;

/// Maximum number of external commands popped per drain pass.
pub const COMMAND_BATCH_SIZE: usize = 100;

/// Batch size for UID sets in flag/move commands.
/// Prevents IMAP command line length limits (~8KB).
pub const UID_BATCH_SIZE: usize = 500;

/// Connection pool size for the SQLite store.
pub const STORE_POOL_SIZE: u32 = 16;

/// Seconds a stopping Folder Session gets to log out before it is aborted.
pub const SESSION_SHUTDOWN_GRACE_SECS: u64 = 5;
