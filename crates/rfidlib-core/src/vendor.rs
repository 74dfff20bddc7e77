//! Classification of free-text driver messages.
//!
//! Vendor drivers report many failures only as message strings. Adapters
//! run those strings through [`classify_vendor_message`] once, at the
//! driver boundary, so the rest of the library works with typed errors.
//! Several phrasings of the same condition (the various "port does not
//! exist" messages in particular) collapse into one error.

use crate::error::{Advisory, Error};

/// Substring patterns, checked in order against the lowercased message.
const PATTERNS: &[(&str, Class)] = &[
    ("temperature", Class::Advisory(Advisory::HighTemperature)),
    ("return loss", Class::Advisory(Advisory::HighReturnLoss)),
    ("invalid firmware", Class::InvalidImage),
    ("firmware image", Class::InvalidImage),
    ("access to the port", Class::AccessDenied),
    ("access denied", Class::AccessDenied),
    ("permission denied", Class::AccessDenied),
    ("no tags found", Class::Transient),
    ("no tag response", Class::Transient),
    ("no response from tag", Class::Transient),
    ("timed out", Class::Timeout),
    ("timeout", Class::Timeout),
    ("connection lost", Class::ConnectionLost),
    ("connection reset", Class::ConnectionLost),
    ("does not exist", Class::ConnectionLost),
    ("doesn't exist", Class::ConnectionLost),
    ("port is closed", Class::ConnectionLost),
    ("port not open", Class::ConnectionLost),
    ("device not found", Class::ConnectionLost),
    ("no such device", Class::ConnectionLost),
    ("device disconnected", Class::ConnectionLost),
];

#[derive(Debug, Clone, Copy)]
enum Class {
    Advisory(Advisory),
    InvalidImage,
    AccessDenied,
    Transient,
    Timeout,
    ConnectionLost,
}

/// Map a driver message onto the typed error it describes.
///
/// Anything unrecognized becomes [`Error::Fault`], which the session treats
/// as fatal.
pub fn classify_vendor_message(message: &str) -> Error {
    let lower = message.to_lowercase();
    let class = PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, class)| *class);

    match class {
        Some(Class::Advisory(advisory)) => Error::Advisory {
            advisory,
            message: message.to_string(),
        },
        Some(Class::InvalidImage) => Error::InvalidFirmwareImage(message.to_string()),
        Some(Class::AccessDenied) => Error::AccessDenied(message.to_string()),
        Some(Class::Transient) => Error::NoTagResponse,
        Some(Class::Timeout) => Error::Timeout,
        Some(Class::ConnectionLost) => Error::ConnectionLost,
        None => Error::Fault(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn kind(msg: &str) -> ErrorKind {
        classify_vendor_message(msg).kind()
    }

    #[test]
    fn port_missing_variants_collapse() {
        for msg in [
            "The port 'COM3' does not exist.",
            "Serial port does not exist",
            "Port doesn't exist",
            "The port is closed.",
            "Device not found",
            "No such device (os error 19)",
        ] {
            assert_eq!(kind(msg), ErrorKind::ConnectionLost, "{msg}");
        }
    }

    #[test]
    fn transient_and_timeout() {
        assert_eq!(kind("No tags found"), ErrorKind::TransientRead);
        assert_eq!(kind("Timeout"), ErrorKind::Timeout);
        assert_eq!(kind("Operation timed out after 1000ms"), ErrorKind::Timeout);
    }

    #[test]
    fn advisories_keep_message() {
        match classify_vendor_message("Reader temperature too high") {
            Error::Advisory { advisory, message } => {
                assert_eq!(advisory, Advisory::HighTemperature);
                assert_eq!(message, "Reader temperature too high");
            }
            other => panic!("expected advisory, got {other:?}"),
        }
        assert_eq!(kind("High Return Loss on antenna 1"), ErrorKind::Advisory);
    }

    #[test]
    fn access_denied_is_connection_error() {
        let e = classify_vendor_message("Access to the port 'COM4' is denied.");
        assert!(matches!(e, Error::AccessDenied(_)));
        assert_eq!(e.kind(), ErrorKind::Connection);
    }

    #[test]
    fn firmware_image() {
        assert_eq!(kind("Invalid firmware image"), ErrorKind::Firmware);
    }

    #[test]
    fn unknown_is_fatal_fault() {
        let e = classify_vendor_message("CRC mismatch in response");
        assert!(matches!(e, Error::Fault(ref m) if m == "CRC mismatch in response"));
        assert_eq!(e.kind(), ErrorKind::Fatal);
    }
}
