//! SessionBuilder -- fluent builder for [`SessionController`].
//!
//! Separates configuration from construction so that callers can set
//! timeouts, channel sizes, and the reconnection bound before any reader is
//! opened.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rfidlib_session::SessionBuilder;
//!
//! # async fn example(connector: Arc<dyn rfidlib_core::ReaderConnector>) -> rfidlib_core::Result<()> {
//! let session = SessionBuilder::new(connector)
//!     .connect_timeout(Duration::from_secs(3))
//!     .transport_timeout(Duration::from_millis(2000))
//!     .build()?;
//! session.connect("tmr:///dev/ttyUSB0").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use rfidlib_core::error::{Error, Result};
use rfidlib_core::reader::ReaderConnector;
use rfidlib_core::types::Region;

use crate::controller::{SessionConfig, SessionController};
use crate::supervisor::DEFAULT_MAX_RETRIES;

/// Capacity of the session event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the driver-to-pump event channel.
pub const DRIVER_CHANNEL_CAPACITY: usize = 1024;

/// Fluent builder for [`SessionController`].
pub struct SessionBuilder {
    connector: Arc<dyn ReaderConnector>,
    connect_timeout: Duration,
    transport_timeout: Duration,
    read_overhead: Duration,
    event_capacity: usize,
    driver_channel_capacity: usize,
    max_reconnect_attempts: u32,
    unique_by_data: bool,
    default_region: Option<Region>,
}

impl SessionBuilder {
    /// Create a builder that opens readers through `connector`.
    pub fn new(connector: Arc<dyn ReaderConnector>) -> Self {
        SessionBuilder {
            connector,
            connect_timeout: Duration::from_secs(5),
            transport_timeout: Duration::from_millis(1000),
            read_overhead: Duration::from_millis(500),
            event_capacity: EVENT_CHANNEL_CAPACITY,
            driver_channel_capacity: DRIVER_CHANNEL_CAPACITY,
            max_reconnect_attempts: DEFAULT_MAX_RETRIES,
            unique_by_data: false,
            default_region: None,
        }
    }

    /// How long `connect` waits for the reader to answer (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Transport timeout written to the reader on connect (default: 1000ms).
    pub fn transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    /// Slack added to a single-shot read's timeout before it is treated as
    /// a hung reader (default: 500ms).
    pub fn read_overhead(mut self, overhead: Duration) -> Self {
        self.read_overhead = overhead;
        self
    }

    /// Capacity of the session event channel (default: 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Capacity of the driver event channel (default: 1024).
    pub fn driver_channel_capacity(mut self, capacity: usize) -> Self {
        self.driver_channel_capacity = capacity;
        self
    }

    /// Consecutive reconnection attempts before giving up (default: 5).
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Aggregate by EPC plus embedded data rather than EPC alone.
    pub fn unique_by_data(mut self, enabled: bool) -> Self {
        self.unique_by_data = enabled;
        self
    }

    /// Region applied when the reader reports none.
    pub fn default_region(mut self, region: Region) -> Self {
        self.default_region = Some(region);
        self
    }

    /// Build the controller. No reader is opened until `connect`.
    pub fn build(self) -> Result<SessionController> {
        if self.event_capacity == 0 || self.driver_channel_capacity == 0 {
            return Err(Error::InvalidParameter(
                "channel capacities must be greater than zero".into(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(Error::InvalidParameter(
                "max_reconnect_attempts must be at least 1".into(),
            ));
        }

        let config = SessionConfig {
            connect_timeout: self.connect_timeout,
            transport_timeout: self.transport_timeout,
            read_overhead: self.read_overhead,
            driver_channel_capacity: self.driver_channel_capacity,
            max_reconnect_attempts: self.max_reconnect_attempts,
            default_region: self.default_region,
        };
        Ok(SessionController::new(
            self.connector,
            config,
            self.event_capacity,
            self.unique_by_data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ConnectionState;
    use rfidlib_test_harness::MockConnector;

    fn connector() -> Arc<dyn ReaderConnector> {
        Arc::new(MockConnector::new("M6e"))
    }

    #[tokio::test]
    async fn builder_defaults() {
        let session = SessionBuilder::new(connector()).build().unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.retry_state().max_retries, 5);
        assert!(!session.aggregator().unique_by_data());
    }

    #[tokio::test]
    async fn builder_custom_settings() {
        let session = SessionBuilder::new(connector())
            .max_reconnect_attempts(3)
            .unique_by_data(true)
            .build()
            .unwrap();
        assert_eq!(session.retry_state().max_retries, 3);
        assert!(session.aggregator().unique_by_data());
    }

    #[tokio::test]
    async fn builder_rejects_zero_attempts() {
        let result = SessionBuilder::new(connector())
            .max_reconnect_attempts(0)
            .build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_rejects_zero_capacity() {
        let result = SessionBuilder::new(connector()).event_capacity(0).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn custom_transport_timeout_is_written() {
        let mock = MockConnector::new("M6e");
        let session = SessionBuilder::new(Arc::new(mock.clone()))
            .transport_timeout(Duration::from_millis(2500))
            .build()
            .unwrap();
        session.connect("tmr:///dev/ttyUSB0").await.unwrap();
        assert_eq!(
            mock.param(rfidlib_core::paths::TRANSPORT_TIMEOUT),
            Some(rfidlib_core::ParamValue::Int(2500))
        );
    }
}
