//! Error types reported by vendor driver backends.
//!
//! Every call across the [`VendorDriver`](crate::driver::VendorDriver) boundary
//! returns a [`DriverError`] tagged with a [`DriverErrorKind`]. The kind is what
//! the streaming layer uses to decide between retrying, reporting, and faulting;
//! the message is carried through unchanged for diagnostics.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Failure categories a vendor driver can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// No device matched the requested model/connection/identifier.
    NotFound,
    /// The device is claimed by another process or session.
    Busy,
    /// The model or connection type is not supported by this driver.
    Unsupported,
    /// A channel name is not known to the device.
    InvalidChannel,
    /// A voltage range is not accepted for a channel.
    InvalidRange,
    /// The device refused an otherwise well-formed request.
    DeviceRejected,
    /// A stream is already running on this handle.
    AlreadyStreaming,
    /// A single read did not complete within its timeout.
    Timeout,
    /// The device went away mid-operation.
    Disconnected,
}

impl DriverErrorKind {
    /// Transient failures that may succeed when retried on the same stream.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Failures of the link to the device itself.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Busy | Self::Unsupported | Self::Disconnected
        )
    }

    /// The device understood the request but refused it.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            Self::InvalidChannel | Self::InvalidRange | Self::DeviceRejected | Self::AlreadyStreaming
        )
    }
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::NotFound => "not_found",
            DriverErrorKind::Busy => "busy",
            DriverErrorKind::Unsupported => "unsupported",
            DriverErrorKind::InvalidChannel => "invalid_channel",
            DriverErrorKind::InvalidRange => "invalid_range",
            DriverErrorKind::DeviceRejected => "device_rejected",
            DriverErrorKind::AlreadyStreaming => "already_streaming",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Disconnected => "disconnected",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by a [`VendorDriver`](crate::driver::VendorDriver) call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver}' {kind} error: {message}")]
pub struct DriverError {
    /// Name of the backend that produced the error.
    pub driver: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Backend-specific detail.
    pub message: String,
}

impl DriverError {
    /// Create an error raised by `driver`.
    pub fn new(
        driver: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Result alias for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::new("sim", DriverErrorKind::InvalidChannel, "AIN99 is not declared");
        let text = err.to_string();
        assert!(text.contains("sim"));
        assert!(text.contains("invalid_channel"));
        assert!(text.contains("AIN99"));
    }

    #[test]
    fn test_kind_classification() {
        assert!(DriverErrorKind::Timeout.is_transient());
        assert!(!DriverErrorKind::Timeout.is_transport());

        assert!(DriverErrorKind::Disconnected.is_transport());
        assert!(DriverErrorKind::NotFound.is_transport());
        assert!(!DriverErrorKind::Disconnected.is_rejection());

        assert!(DriverErrorKind::InvalidRange.is_rejection());
        assert!(DriverErrorKind::AlreadyStreaming.is_rejection());
        assert!(!DriverErrorKind::DeviceRejected.is_transient());
    }
}
