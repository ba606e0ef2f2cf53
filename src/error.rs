//! # Error Types
//!
//! Error handling for the interception layer.
//!
//! The layer adds very few failure modes of its own. Pipeline mutation errors
//! are whatever the wrapped pipeline raises, listener errors travel unchanged to
//! the transport's per-connection error boundary, and cancelling a message is
//! never an error.
//!
//! ## Error Categories
//! - **Pipeline Errors**: duplicate or missing stage names
//! - **Executor Errors**: submissions to an event loop that has shut down
//! - **Dispatch Errors**: listener failures and strict monitor violations
//! - **Configuration Errors**: unreadable or invalid configuration
//!
//! ## Example Usage
//! ```rust
//! use channel_intercept::error::{InterceptError, Result};
//! use tracing::error;
//!
//! fn lookup(names: &[String], wanted: &str) -> Result<usize> {
//!     names
//!         .iter()
//!         .position(|n| n == wanted)
//!         .ok_or_else(|| InterceptError::StageNotFound(wanted.to_string()))
//! }
//!
//! if let Err(e) = lookup(&[], "decoder") {
//!     error!(error = %e, "Stage lookup failed");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Event loop errors
    pub const ERR_EVENT_LOOP_SHUTDOWN: &str = "Event loop has been shut down";
    pub const ERR_EVENT_LOOP_START: &str = "Failed to start event loop thread";

    /// Channel errors
    pub const ERR_CHANNEL_CLOSED: &str = "Channel closed";

    /// Hook errors
    pub const ERR_HOOK_CLOSED: &str = "Connection hook has been closed";

    /// Configuration errors
    pub const ERR_CONFIG_OPEN: &str = "Failed to open config file";
    pub const ERR_CONFIG_PARSE: &str = "Failed to parse TOML";
}

/// InterceptError is the primary error type for all interception operations
#[derive(Error, Debug)]
pub enum InterceptError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("{}", constants::ERR_EVENT_LOOP_SHUTDOWN)]
    EventLoopShutdown,

    #[error("{}", constants::ERR_CHANNEL_CLOSED)]
    ChannelClosed,

    #[error("{}", constants::ERR_HOOK_CLOSED)]
    HookClosed,

    #[error("Index {index} out of bounds for hook of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("MONITOR listener cancelled a {0} message")]
    MonitorCancelled(&'static str),

    #[error("Listener error: {0}")]
    Listener(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using InterceptError
pub type Result<T> = std::result::Result<T, InterceptError>;
