//! System-wide timing windows and default values.

/// An agent is online while its last heartbeat is at most this old.
pub const ONLINE_WINDOW_SECS: i64 = 30;

/// Agent-side heartbeat cadence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Janitor sweep cadence for deadline-expired running tasks.
pub const JANITOR_PERIOD_SECS: u64 = 2;

/// Message written into results the janitor synthesizes for agents that
/// never reported back.
pub const SYNTHETIC_FAILURE_MESSAGE: &str = "firewall suspected; no data";

/// Result POST timeout on the agent side.
pub const RESULT_POST_TIMEOUT_SECS: u64 = 10;

/// Heartbeat POST timeout on the agent side.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 5;

/// Stage-log POST timeout; logs are fire-and-forget.
pub const LOG_POST_TIMEOUT_SECS: u64 = 3;

/// HTTP server drain deadline on shutdown.
pub const SHUTDOWN_DRAIN_SECS: u64 = 10;

/// Event hub subscriber channel capacity. One in-flight event per
/// subscriber; a full channel disconnects the observer.
pub const EVENT_BUFFER_SIZE: usize = 1;

/// Expected-count floor applied when the registry reports zero active agents.
pub const DEFAULT_AGENTS_FLOOR: usize = 3;

/// Default task time-to-live before the janitor closes it.
pub const DEFAULT_TASK_TTL_SECS: u64 = 90;

/// Suffix length of a token exposed in admin views.
pub const TOKEN_TAIL_LEN: usize = 4;
