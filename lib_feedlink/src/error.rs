//! # Error Taxonomy
//!
//! Every failure the feed session can produce, grouped by who is expected to
//! act on it:
//!
//! - **`ConnectError`**: a single connect attempt (or a whole connect sequence)
//!   failed. Transient variants are retried inside the supervisor and never
//!   reach the application; `AttemptsExhausted` escalates.
//! - **`PolicyError`**: a preferred-host policy or reconnect setting that cannot
//!   be applied. The previously active policy stays in force.
//! - **`SessionError`**: what the application sees from the `Session` API.
//! - **`CodecError`** / **`ConfigError`**: encode/decode and policy-document
//!   problems.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::watchlist::ItemHandle;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] io::Error),

    #[error("Connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy tunnel failed: {0}")]
    Proxy(String),

    #[error("Reconnect attempts exhausted after {attempts} consecutive failures")]
    AttemptsExhausted { attempts: u32 },

    #[error("No connection candidates available")]
    NoCandidates,

    #[error("Connect sequence cancelled")]
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Preferred channel name '{name}' is not in ChannelSet [{available}]")]
    UnknownChannel { name: String, available: String },

    #[error("Preferred WSB channel name '{name}' is not in WarmStandbyChannelSet [{available}]")]
    UnknownWarmStandbyGroup { name: String, available: String },

    #[error("Invalid detection time schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Preferred host is enabled but no connection candidates are configured")]
    NoCandidates,

    #[error("Invalid reconnect options: {0}")]
    InvalidReconnect(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Item already open with an equivalent request key on handle {existing}")]
    DuplicateKey { existing: ItemHandle },

    #[error("Handle {0} is in use by a different item")]
    StreamAlreadyInUse(ItemHandle),

    #[error("Unknown item handle {0}")]
    UnknownHandle(ItemHandle),

    #[error("Policy rejected: {0}")]
    PolicyInvalid(#[from] PolicyError),

    #[error("Connection attempts exhausted: {0}")]
    AttemptsExhausted(String),

    #[error("Session is closed")]
    SessionClosed,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error occurred: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid preferred host options: {0}")]
    Policy(#[from] PolicyError),
}
