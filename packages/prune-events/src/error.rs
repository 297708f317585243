//! Error types for prune-events.
//!
//! Dispatch failures never escape a flush: they are converted into
//! [`PruneError`] values and handed to the coalescer's error hook (or logged).
//! Configuration and runtime setup errors are returned to the caller.

use thiserror::Error;

use crate::source::SourceId;

/// Result type alias for fallible prune-events operations.
pub type PruneResult<T> = Result<T, PruneError>;

/// Errors surfaced by the coalescing engine.
#[derive(Debug, Error)]
pub enum PruneError {
    /// An event handler panicked while a channel was being flushed.
    #[error("event handler for `{event_type}` on source {source_id} panicked: {message}")]
    HandlerPanicked {
        /// Identity of the source the channel is bound to.
        source_id: SourceId,
        /// Event type of the channel.
        event_type: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A data handler panicked while deriving data from a raw event.
    #[error("data handler for `{event_type}` on source {source_id} panicked: {message}")]
    DataHandlerPanicked {
        /// Identity of the source the channel is bound to.
        source_id: SourceId,
        /// Event type of the channel.
        event_type: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A frame ticker was started outside of a tokio runtime.
    #[error("no tokio runtime is available to drive the frame ticker")]
    RuntimeUnavailable,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PruneError {
    /// Returns `true` if this error describes an isolated handler failure.
    #[must_use]
    pub const fn is_handler_failure(&self) -> bool {
        matches!(self, Self::HandlerPanicked { .. } | Self::DataHandlerPanicked { .. })
    }
}

/// Errors that can occur when loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration contains invalid JSON.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The refresh rate is not a finite, positive number of hertz.
    #[error("Invalid refresh rate: {0} Hz (expected a finite value greater than zero)")]
    InvalidRefreshRate(f64),
}

/// Renders a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
