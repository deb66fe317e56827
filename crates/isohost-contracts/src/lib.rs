//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for the schema strings, file names,
//! command-line flags and environment variables shared by the supervisor library and the
//! bootstrap executable. Both sides must agree on every value here.

pub const BOOTSTRAP_CONFIG_SCHEMA_VERSION: &str = "isohost.bootstrap.config@0.1.0";
pub const HOST_RECORD_SCHEMA_VERSION: &str = "isohost.host.record@0.1.0";

pub const BOOTSTRAP_BIN_NAME: &str = "isohost-bootstrap";
pub const BOOTSTRAP_CONFIG_SUFFIX: &str = ".config.json";
pub const CHANNEL_SOCKET_FILE: &str = "channel.sock";
pub const HOST_RECORD_FILE: &str = "host.json";
pub const SHADOW_DIR_NAME: &str = "shadow";

pub const CHANNEL_NAME_PREFIX: &str = "isohost";
pub const CHANNEL_NAME_MAX_LEN: usize = 64;

/// Long flag carrying the channel binding name: `--ipc=<name>`.
pub const IPC_FLAG: &str = "ipc";

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub const ENV_BOOTSTRAP_BIN: &str = "ISOHOST_BOOTSTRAP_BIN";
pub const ENV_ARTIFACT_DIR: &str = "ISOHOST_ARTIFACT_DIR";
pub const ENV_STARTUP_TIMEOUT_MS: &str = "ISOHOST_STARTUP_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "ISOHOST_POLL_INTERVAL_MS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "ISOHOST_HEARTBEAT_INTERVAL_MS";
pub const ENV_WATCHDOG_TIMEOUT_MS: &str = "ISOHOST_WATCHDOG_TIMEOUT_MS";
pub const ENV_JOIN_BEFORE_ABORT_MS: &str = "ISOHOST_JOIN_BEFORE_ABORT_MS";
pub const ENV_JOIN_AFTER_ABORT_MS: &str = "ISOHOST_JOIN_AFTER_ABORT_MS";

pub const EXIT_OK: u8 = 0;
pub const EXIT_STARTUP_FAILED: u8 = 2;
pub const EXIT_WATCHDOG_EXPIRED: u8 = 3;
pub const EXIT_OWNER_LOST: u8 = 4;
