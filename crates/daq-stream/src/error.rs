//! Error types for streaming sessions.
//!
//! [`StreamError`] separates failures by what the caller can do about them:
//! fix the request (`Validation`, `Rejected`, `InvalidState`), wait for a
//! consumer (`Overflow`), retry (`Timeout`), or re-open the device
//! (`Transport`). Driver errors are classified through
//! [`StreamError::from_driver`].

use std::fmt;
use std::time::Duration;

use daq_core::{DeviceHandle, DriverError};
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for streaming operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Where an error happened: operation, device handle, and channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Operation that failed
    pub operation: &'static str,
    /// Device handle involved
    pub handle: Option<DeviceHandle>,
    /// Channel involved
    pub channel: Option<String>,
}

impl ErrorContext {
    /// Context for `operation`.
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    /// Attach a device handle.
    pub fn handle(mut self, handle: DeviceHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Attach a channel name.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in {}", self.operation)?;
        if let Some(handle) = self.handle {
            write!(f, " on {}", handle)?;
        }
        if let Some(channel) = &self.channel {
            write!(f, " for channel {}", channel)?;
        }
        Ok(())
    }
}

/// Errors that can occur while configuring, running, or reading a stream.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Bad parameters caught before any hardware call
    #[error("Invalid request {context}: {message}")]
    Validation {
        /// Where it failed
        context: ErrorContext,
        /// What was wrong
        message: String,
    },

    /// Device not found, busy, unsupported, or disconnected
    #[error("Transport failure {context}: {source}")]
    Transport {
        /// Where it failed
        context: ErrorContext,
        /// Driver error
        #[source]
        source: DriverError,
    },

    /// A read did not complete in time
    #[error("Timed out {context}: {message}")]
    Timeout {
        /// Where it failed
        context: ErrorContext,
        /// Driver message
        message: String,
    },

    /// No consumer advanced within the lossless push timeout
    #[error("Buffer overflow {context}: no consumer advanced within {timeout:?}")]
    Overflow {
        /// Where it failed
        context: ErrorContext,
        /// How long the push waited
        timeout: Duration,
    },

    /// The device refused a well-formed request
    #[error("Device rejected request {context}: {source}")]
    Rejected {
        /// Where it failed
        context: ErrorContext,
        /// Driver error
        #[source]
        source: DriverError,
    },

    /// Operation not legal in the current session state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation attempted
        operation: &'static str,
        /// State at the time
        state: SessionState,
    },

    /// Settings could not be loaded or failed validation
    #[error("Settings error: {message}")]
    Settings {
        /// What was wrong
        message: String,
    },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl StreamError {
    /// Build a `Validation` error.
    pub fn validation(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::Validation {
            context,
            message: message.into(),
        }
    }

    /// Classify a driver error by its kind.
    pub fn from_driver(source: DriverError, context: ErrorContext) -> Self {
        if source.kind.is_transient() {
            Self::Timeout {
                context,
                message: source.to_string(),
            }
        } else if source.kind.is_rejection() {
            Self::Rejected { context, source }
        } else {
            Self::Transport { context, source }
        }
    }

    /// Transient and safe to retry on the same stream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The device link is unusable; the session must fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// The device is owned by another session.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Transport { source, .. } if source.kind == daq_core::DriverErrorKind::Busy
        )
    }
}

impl From<DriverError> for StreamError {
    fn from(err: DriverError) -> Self {
        StreamError::from_driver(err, ErrorContext::new("driver call"))
    }
}

impl From<figment::Error> for StreamError {
    fn from(err: figment::Error) -> Self {
        StreamError::Settings {
            message: err.to_string(),
        }
    }
}
