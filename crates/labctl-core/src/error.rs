//! Error types shared by the transport, the property tables and every driver.
//!
//! `LabError` separates failures that end a session from everything else:
//!
//! - **Session-fatal**: `NotAccessible`, `Open` and `NotRecognized` are raised
//!   while a driver is being constructed. A driver that fails with one of these
//!   has already released its port.
//! - **Device loss**: `Disconnected` and `Io` surface when the character device
//!   disappears under an open port. There is no retry logic at any layer.
//! - **Caller mistakes**: `UnknownProperty`, `ReadOnlyProperty`, `InvalidValue`
//!   and `UnknownDriver` come from the property tables and the registry.
//!
//! Protocol faults reported by an instrument (error codes, `ERR:` lines,
//! unknown-command markers, read timeouts) are *not* represented here. Drivers
//! log them with `tracing::warn!` and return a sentinel instead, so one bad
//! command never tears down an interactive session.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Primary error type for labctl.
#[derive(Error, Debug)]
pub enum LabError {
    /// The path is missing, is not a character-special file, or cannot be
    /// opened for both reading and writing by this user.
    #[error("Device '{0}' is not an accessible character device")]
    NotAccessible(String),

    /// The device node exists but opening it failed, or the resulting handle
    /// is not an interactive terminal open for read and write.
    #[error("Failed to open device '{path}': {message}")]
    Open {
        /// Device path
        path: String,
        /// Platform error message
        message: String,
    },

    /// The identification handshake did not match the expected instrument.
    #[error("Device '{path}' not recognized as {expected} (reply: {reply:?})")]
    NotRecognized {
        /// Device path
        path: String,
        /// Instrument family that was expected
        expected: String,
        /// Raw reply to the identification command
        reply: String,
    },

    /// The terminal-configuration utility could not report line settings.
    #[error("Line settings query failed for '{path}': {message}")]
    Query {
        /// Device path
        path: String,
        /// Utility stderr or spawn failure
        message: String,
    },

    /// The stream reached end-of-file while a reply was expected.
    #[error("Serial device '{0}' disconnected")]
    Disconnected(String),

    /// No accessor with this name exists for the driver.
    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    /// The accessor has no setter.
    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),

    /// A value could not be converted to the accessor's kind.
    #[error("Invalid value for property '{name}': {message}")]
    InvalidValue {
        /// Property name
        name: String,
        /// What was wrong with the value
        message: String,
    },

    /// No driver factory is registered under this name.
    #[error("Unknown driver '{0}'")]
    UnknownDriver(String),

    /// Semantic configuration errors (bad level, duplicate id, ...).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// True for errors that mean the port is no longer usable.
    pub fn is_device_loss(&self) -> bool {
        matches!(self, LabError::Disconnected(_) | LabError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::NotRecognized {
            path: "/dev/ttyUSB0".into(),
            expected: "stage controller".into(),
            reply: "X".into(),
        };
        assert_eq!(
            err.to_string(),
            "Device '/dev/ttyUSB0' not recognized as stage controller (reply: \"X\")"
        );
    }

    #[test]
    fn test_device_loss_classification() {
        assert!(LabError::Disconnected("/dev/ttyS0".into()).is_device_loss());
        assert!(LabError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .is_device_loss());
        assert!(!LabError::UnknownProperty("speed".into()).is_device_loss());
    }
}
