//! Driver and session event types.
//!
//! [`DriverEvent`]s flow from a streaming driver into the session over a
//! bounded [`tokio::sync::mpsc`] channel, so tag order is FIFO as produced.
//! [`SessionEvent`]s flow out of the session over a
//! [`tokio::sync::broadcast`] channel to any number of UI or CLI
//! subscribers.

use crate::error::{Advisory, Error};
use crate::types::TagObservation;

/// An event produced by a driver during a continuous read.
#[derive(Debug)]
pub enum DriverEvent {
    /// A tag was observed.
    TagRead(TagObservation),
    /// The driver hit an error while reading.
    ReadError(Error),
}

/// A notification from a session.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events under heavy load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected to the reader.
    Connected {
        /// Model string the reader reported.
        model: String,
    },

    /// The reader handle was released.
    Disconnected,

    /// A continuous read started.
    ReadStarted,

    /// A continuous read stopped.
    ReadStopped,

    /// A reconnection attempt is starting after the link dropped.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },

    /// The link was re-established and the last configuration reapplied.
    Reconnected,

    /// Reconnection gave up; the session is torn down.
    ReconnectFailed {
        /// How many attempts were made.
        attempts: u32,
    },

    /// A non-fatal reader warning.
    Advisory {
        advisory: Advisory,
        message: String,
    },

    /// A read error the session could not recover from on its own.
    ReadError {
        /// Human-readable description.
        message: String,
    },

    /// The reader rejected a parameter and the previous value was restored.
    ConfigurationReverted {
        /// Parameter path that was rejected.
        param: String,
        /// Value that is in effect again.
        value: String,
    },

    /// Firmware flash progress.
    FirmwareProgress {
        /// 0 to 100.
        percent: u8,
    },
}
