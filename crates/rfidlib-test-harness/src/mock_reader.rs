//! Scripted mock reader for deterministic session tests.
//!
//! A [`MockConnector`] hands out [`MockReader`] handles that all share one
//! scripted state, the way every handle a real connector opens talks to the
//! same physical device. Tests script the device (parameters, connect
//! failures, single-shot read outcomes, firmware behaviour) through the
//! connector, then drive a continuous read by pushing events into whatever
//! stream the session most recently started.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rfidlib_core::ReaderConnector;
//! use rfidlib_test_harness::{Fault, MockConnector};
//!
//! let mock = MockConnector::new("M6e");
//! mock.fail_connects(2, Fault::Unreachable);
//! let connector: Arc<dyn ReaderConnector> = Arc::new(mock.clone());
//! assert_eq!(mock.connect_calls(), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rfidlib_core::endpoint::Endpoint;
use rfidlib_core::error::{Advisory, Error, Result};
use rfidlib_core::events::DriverEvent;
use rfidlib_core::params::{ParamValue, paths};
use rfidlib_core::reader::{ReaderConnector, ReaderDriver};
use rfidlib_core::types::TagObservation;

/// A failure the mock can be told to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    AccessDenied,
    Unreachable,
    ConnectionLost,
    Timeout,
    NoTagResponse,
    Advisory(Advisory),
    InvalidImage,
    Flash,
    Other(String),
}

impl Fault {
    /// The error a driver would return for this fault.
    pub fn to_error(&self) -> Error {
        match self {
            Fault::AccessDenied => Error::AccessDenied("mock port is in use".into()),
            Fault::Unreachable => Error::DeviceUnreachable("mock reader not found".into()),
            Fault::ConnectionLost => Error::ConnectionLost,
            Fault::Timeout => Error::Timeout,
            Fault::NoTagResponse => Error::NoTagResponse,
            Fault::Advisory(advisory) => Error::Advisory {
                advisory: *advisory,
                message: format!("mock {advisory}"),
            },
            Fault::InvalidImage => Error::InvalidFirmwareImage("mock image rejected".into()),
            Fault::Flash => Error::FirmwareFlash("mock flash aborted".into()),
            Fault::Other(message) => Error::Fault(message.clone()),
        }
    }
}

/// What the next single-shot read does.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    Tags(Vec<TagObservation>),
    Fail(Fault),
    /// Never return.
    Hang,
}

/// A value the device refuses for a parameter.
#[derive(Debug, Clone)]
struct Rejection {
    path: String,
    value: ParamValue,
    reason: String,
}

#[derive(Debug)]
struct MockState {
    params: HashMap<String, ParamValue>,
    writes: Vec<(String, ParamValue)>,
    rejections: Vec<Rejection>,
    connect_failures: VecDeque<Fault>,
    fail_all_connects: Option<Fault>,
    reads: VecDeque<ReadOutcome>,
    stream: Option<mpsc::Sender<DriverEvent>>,
    flash_fault: Option<Fault>,
    flash_delay: Duration,
    flashed: Vec<Vec<u8>>,
    open_calls: usize,
    connect_calls: usize,
    disconnect_calls: usize,
    start_calls: usize,
    stop_calls: usize,
}

impl MockState {
    fn new(model: &str) -> Self {
        let mut params = HashMap::new();
        params.insert(paths::MODEL.to_string(), ParamValue::from(model));
        params.insert(paths::SOFTWARE_VERSION.to_string(), ParamValue::from("1.9.2"));
        params.insert(paths::REGION.to_string(), ParamValue::from("NA"));
        params.insert(
            paths::CONNECTED_PORTS.to_string(),
            ParamValue::Ports(vec![1, 2]),
        );
        MockState {
            params,
            writes: Vec::new(),
            rejections: Vec::new(),
            connect_failures: VecDeque::new(),
            fail_all_connects: None,
            reads: VecDeque::new(),
            stream: None,
            flash_fault: None,
            flash_delay: Duration::ZERO,
            flashed: Vec::new(),
            open_calls: 0,
            connect_calls: 0,
            disconnect_calls: 0,
            start_calls: 0,
            stop_calls: 0,
        }
    }
}

/// Connector handing out [`MockReader`]s that share one scripted device.
///
/// Clones share state, so a test keeps one clone for scripting and
/// assertions and gives another to the session.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// A mock device reporting `model`, in region NA, with antennas on
    /// ports 1 and 2.
    pub fn new(model: &str) -> Self {
        MockConnector {
            state: Arc::new(Mutex::new(MockState::new(model))),
        }
    }

    // -- scripting --------------------------------------------------------

    /// Set a parameter as if the device held it.
    pub fn set_param(&self, path: &str, value: ParamValue) {
        self.state.lock().params.insert(path.to_string(), value);
    }

    pub fn clear_param(&self, path: &str) {
        self.state.lock().params.remove(path);
    }

    /// Refuse writes of `value` to `path` with `reason`.
    pub fn reject_value(&self, path: &str, value: ParamValue, reason: &str) {
        self.state.lock().rejections.push(Rejection {
            path: path.to_string(),
            value,
            reason: reason.to_string(),
        });
    }

    /// Fail the next `count` connects with `fault`.
    pub fn fail_connects(&self, count: usize, fault: Fault) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.connect_failures.push_back(fault.clone());
        }
    }

    /// Fail every connect from now on.
    pub fn fail_all_connects(&self, fault: Fault) {
        self.state.lock().fail_all_connects = Some(fault);
    }

    /// Queue the outcome of a single-shot read. Unscripted reads see no tags.
    pub fn push_read(&self, outcome: ReadOutcome) {
        self.state.lock().reads.push_back(outcome);
    }

    /// Fail every firmware flash with `fault`.
    pub fn fail_flash(&self, fault: Fault) {
        self.state.lock().flash_fault = Some(fault);
    }

    /// How long a flash takes.
    pub fn flash_delay(&self, delay: Duration) {
        self.state.lock().flash_delay = delay;
    }

    // -- streaming --------------------------------------------------------

    /// Push a tag into the running stream. False if no stream is running.
    pub fn emit_tag(&self, observation: TagObservation) -> bool {
        self.emit(DriverEvent::TagRead(observation))
    }

    /// Push an error into the running stream. False if no stream is running.
    pub fn emit_error(&self, fault: Fault) -> bool {
        self.emit(DriverEvent::ReadError(fault.to_error()))
    }

    /// Close the running stream without reporting an error, the way a
    /// driver whose link silently died does. False if no stream is running.
    pub fn end_stream(&self) -> bool {
        self.state.lock().stream.take().is_some()
    }

    fn emit(&self, event: DriverEvent) -> bool {
        let stream = self.state.lock().stream.clone();
        match stream {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    // -- inspection -------------------------------------------------------

    pub fn param(&self, path: &str) -> Option<ParamValue> {
        self.state.lock().params.get(path).cloned()
    }

    /// Every accepted parameter write, in order.
    pub fn param_writes(&self) -> Vec<(String, ParamValue)> {
        self.state.lock().writes.clone()
    }

    /// Images that flashed successfully.
    pub fn flashed_images(&self) -> Vec<Vec<u8>> {
        self.state.lock().flashed.clone()
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }
}

#[async_trait]
impl ReaderConnector for MockConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn ReaderDriver>> {
        self.state.lock().open_calls += 1;
        tracing::trace!(endpoint = %endpoint, "mock reader opened");
        Ok(Box::new(MockReader {
            state: self.state.clone(),
            connected: false,
        }))
    }
}

/// One handle to the mock device.
#[derive(Debug)]
pub struct MockReader {
    state: Arc<Mutex<MockState>>,
    connected: bool,
}

impl MockReader {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl ReaderDriver for MockReader {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if let Some(fault) = state.connect_failures.pop_front() {
            return Err(fault.to_error());
        }
        if let Some(fault) = &state.fail_all_connects {
            return Err(fault.to_error());
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().disconnect_calls += 1;
        self.connected = false;
        Ok(())
    }

    async fn param_get(&mut self, path: &str) -> Result<ParamValue> {
        self.ensure_connected()?;
        self.state
            .lock()
            .params
            .get(path)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter(format!("no such parameter: {path}")))
    }

    async fn param_set(&mut self, path: &str, value: ParamValue) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if let Some(rejection) = state
            .rejections
            .iter()
            .find(|r| r.path == path && r.value == value)
        {
            return Err(Error::unsupported(path, rejection.reason.clone()));
        }
        state.writes.push((path.to_string(), value.clone()));
        state.params.insert(path.to_string(), value);
        Ok(())
    }

    async fn read(&mut self, _timeout: Duration) -> Result<Vec<TagObservation>> {
        self.ensure_connected()?;
        let outcome = self.state.lock().reads.pop_front();
        match outcome {
            None => Ok(Vec::new()),
            Some(ReadOutcome::Tags(tags)) => Ok(tags),
            Some(ReadOutcome::Fail(fault)) => Err(fault.to_error()),
            Some(ReadOutcome::Hang) => std::future::pending().await,
        }
    }

    async fn start_reading(&mut self, events: mpsc::Sender<DriverEvent>) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        state.start_calls += 1;
        state.stream = Some(events);
        Ok(())
    }

    async fn stop_reading(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.stop_calls += 1;
        state.stream = None;
        Ok(())
    }

    async fn flash_firmware(&mut self, image: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let delay = self.state.lock().flash_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(fault) = &state.flash_fault {
            return Err(fault.to_error());
        }
        state.flashed.push(image.to_vec());
        self.connected = false;
        Ok(())
    }
}
