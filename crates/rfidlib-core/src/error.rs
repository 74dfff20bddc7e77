//! Error types for rfidlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Every variant belongs to exactly one
//! [`ErrorKind`], the closed taxonomy the session layer uses to decide
//! whether an error is logged, recovered, retried, or escalated.

use std::fmt;

/// Non-fatal conditions reported by the reader while it keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Advisory {
    /// The module is at or beyond its operating temperature limit.
    HighTemperature,
    /// The antenna is reflecting too much power back into the module.
    HighReturnLoss,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::HighTemperature => write!(f, "high temperature"),
            Advisory::HighReturnLoss => write!(f, "high return loss"),
        }
    }
}

/// Errors produced while building a read plan from user selections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No antenna was selected.
    #[error("no antenna selected")]
    NoAntennaSelected,

    /// No protocol was selected.
    #[error("no protocol selected")]
    NoProtocolSelected,

    /// A numeric field was neither decimal nor `0x`-prefixed hexadecimal.
    #[error("invalid numeric format for {field}: {value:?}")]
    InvalidNumericFormat {
        /// Which input field was rejected.
        field: &'static str,
        /// The text that failed to parse.
        value: String,
    },

    /// Filter data contained characters that are not hex digits.
    #[error("invalid hex data for {field}: {value:?}")]
    InvalidHexData {
        /// Which input field was rejected.
        field: &'static str,
        /// The text that failed to parse.
        value: String,
    },

    /// Antenna port 0 is not a valid port number.
    #[error("invalid antenna port: {0}")]
    InvalidAntenna(u8),
}

/// The closed classification of every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unreachable device, access denied, or invalid address.
    Connection,
    /// Unsupported parameter for the model or invalid user input.
    Configuration,
    /// No tag responded; log and keep reading.
    TransientRead,
    /// The link to the reader dropped; supervised reconnection applies.
    ConnectionLost,
    /// The reader stopped answering; fatal to the current session.
    Timeout,
    /// Over-temperature or return-loss warning; non-fatal.
    Advisory,
    /// Firmware flash failure.
    Firmware,
    /// Anything else; surfaced, never retried automatically.
    Fatal,
}

/// The error type for all rfidlib operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The reader URI could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Nothing answered at the endpoint (no such port, host unreachable).
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    /// The port or host exists but refused access.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The reader answered with something the driver could not make sense of.
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// The connected model rejected a parameter.
    ///
    /// `reverted_to` holds the last-known-good value that was restored, if
    /// the controller had one.
    #[error("unsupported configuration for {param}: {reason}{}", reverted_suffix(.reverted_to))]
    UnsupportedConfiguration {
        /// Parameter path that was rejected.
        param: String,
        /// Human-readable reason.
        reason: String,
        /// Value restored after the rejection.
        reverted_to: Option<String>,
    },

    /// User input for a read plan was rejected.
    #[error("invalid read plan: {0}")]
    Validation(#[from] ValidationError),

    /// A parameter value outside its legal range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No tag answered during an inventory round.
    #[error("no tag response")]
    NoTagResponse,

    /// The connection to the reader was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// Timed out waiting for the reader.
    #[error("timeout waiting for reader")]
    Timeout,

    /// A non-fatal warning raised by the reader.
    #[error("reader advisory: {advisory}: {message}")]
    Advisory {
        /// Which condition was raised.
        advisory: Advisory,
        /// Message reported by the driver.
        message: String,
    },

    /// The reader refused the firmware image.
    #[error("invalid firmware image: {0}")]
    InvalidFirmwareImage(String),

    /// Flashing failed part way through.
    #[error("firmware flash failed: {0}")]
    FirmwareFlash(String),

    /// No reader is connected.
    #[error("not connected")]
    NotConnected,

    /// The operation conflicts with the session's current state.
    #[error("reader busy: {0}")]
    Busy(String),

    /// An unclassified reader failure.
    #[error("reader fault: {0}")]
    Fault(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn reverted_suffix(reverted_to: &Option<String>) -> String {
    match reverted_to {
        Some(value) => format!(" (reverted to {value})"),
        None => String::new(),
    }
}

impl Error {
    /// Classify this error into the session-level taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidEndpoint(_) | Error::DeviceUnreachable(_) | Error::AccessDenied(_) => {
                ErrorKind::Connection
            }
            Error::UnsupportedConfiguration { .. }
            | Error::Validation(_)
            | Error::InvalidParameter(_) => ErrorKind::Configuration,
            Error::NoTagResponse => ErrorKind::TransientRead,
            Error::ConnectionLost => ErrorKind::ConnectionLost,
            Error::Timeout => ErrorKind::Timeout,
            Error::Advisory { .. } => ErrorKind::Advisory,
            Error::InvalidFirmwareImage(_) | Error::FirmwareFlash(_) => ErrorKind::Firmware,
            Error::ProtocolFault(_)
            | Error::NotConnected
            | Error::Busy(_)
            | Error::Fault(_)
            | Error::Io(_) => ErrorKind::Fatal,
        }
    }

    /// Build an [`Error::UnsupportedConfiguration`] with no reverted value.
    pub fn unsupported(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsupportedConfiguration {
            param: param.into(),
            reason: reason.into(),
            reverted_to: None,
        }
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_display_includes_reverted_value() {
        let e = Error::UnsupportedConfiguration {
            param: "/reader/gen2/tari".into(),
            reason: "Tari is fixed on this model".into(),
            reverted_to: Some("TARI_25US".into()),
        };
        assert_eq!(
            e.to_string(),
            "unsupported configuration for /reader/gen2/tari: Tari is fixed on this model (reverted to TARI_25US)"
        );
    }

    #[test]
    fn unsupported_display_without_revert() {
        let e = Error::unsupported("/reader/gen2/BLF", "not supported");
        assert_eq!(
            e.to_string(),
            "unsupported configuration for /reader/gen2/BLF: not supported"
        );
    }

    #[test]
    fn validation_converts_and_displays() {
        let e: Error = ValidationError::NoAntennaSelected.into();
        assert_eq!(e.to_string(), "invalid read plan: no antenna selected");
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn kinds_cover_taxonomy() {
        assert_eq!(Error::DeviceUnreachable("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(Error::AccessDenied("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(Error::InvalidEndpoint("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(Error::NoTagResponse.kind(), ErrorKind::TransientRead);
        assert_eq!(Error::ConnectionLost.kind(), ErrorKind::ConnectionLost);
        assert_eq!(Error::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            Error::Advisory {
                advisory: Advisory::HighReturnLoss,
                message: "reflected".into()
            }
            .kind(),
            ErrorKind::Advisory
        );
        assert_eq!(Error::FirmwareFlash("x".into()).kind(), ErrorKind::Firmware);
        assert_eq!(Error::Fault("x".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
