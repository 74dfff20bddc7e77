//! The driver seam between the session layer and a physical reader.
//!
//! A [`ReaderDriver`] is the narrow contract the session needs from whatever
//! speaks the wire protocol (serial, RQL, LLRP): connect, a hierarchical
//! parameter store, a timed single-shot read, and a streaming read that
//! pushes [`DriverEvent`]s into a channel. Framing and RF details live
//! entirely behind it.
//!
//! Drivers are created by a [`ReaderConnector`], which lets the session
//! destroy a handle and open a fresh one (reconnection, firmware update)
//! without knowing the concrete driver type. Tests plug in
//! `MockConnector` from the `rfidlib-test-harness` crate.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::events::DriverEvent;
use crate::params::ParamValue;
use crate::types::TagObservation;

/// An open handle to one reader.
///
/// Methods take `&mut self`: a handle is owned by exactly one session, which
/// serializes access to it.
#[async_trait]
pub trait ReaderDriver: Send + Sync {
    /// Establish the link and bring the reader to an idle state.
    async fn connect(&mut self) -> Result<()>;

    /// Release the link. Must be safe to call on an already closed handle.
    async fn disconnect(&mut self) -> Result<()>;

    /// Read a parameter.
    async fn param_get(&mut self, path: &str) -> Result<ParamValue>;

    /// Write a parameter. The reader may reject values its model does not
    /// support with [`Error::UnsupportedConfiguration`](crate::Error::UnsupportedConfiguration).
    async fn param_set(&mut self, path: &str, value: ParamValue) -> Result<()>;

    /// Run one inventory pass of length `timeout` and return what was seen.
    async fn read(&mut self, timeout: Duration) -> Result<Vec<TagObservation>>;

    /// Start streaming reads. Tag and error events go to `events` until
    /// [`stop_reading`](ReaderDriver::stop_reading) returns.
    async fn start_reading(&mut self, events: mpsc::Sender<DriverEvent>) -> Result<()>;

    /// Stop streaming. No event is sent after this returns.
    async fn stop_reading(&mut self) -> Result<()>;

    /// Write a firmware image. The handle is unusable until reopened.
    async fn flash_firmware(&mut self, image: &[u8]) -> Result<()>;
}

/// Opens driver handles for an endpoint.
#[async_trait]
pub trait ReaderConnector: Send + Sync {
    /// Create an unconnected driver for `endpoint`.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn ReaderDriver>>;
}

/// Receives every tag observation a session produces.
///
/// Sinks are called from the session's read task and must not block; the
/// aggregator and the stream relay are both sinks.
pub trait TagSink: Send + Sync {
    fn accept(&self, observation: &TagObservation);
}
