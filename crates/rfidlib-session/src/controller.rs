//! SessionController -- connection lifecycle and read control for one reader.
//!
//! The controller is a cheap [`Clone`] handle; every clone drives the same
//! session. All device access is serialized through one async mutex, so a
//! configuration change can never interleave with an in-flight plan push or
//! single-shot read.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected(Idle) <-> Connected(Reading)
//!       ^                              |                    |
//!       +------------------------------+--------------------+
//! ```
//!
//! # Continuous reads
//!
//! Starting a continuous read hands the driver the sending half of a bounded
//! [`DriverEvent`] channel and spawns a pump task that feeds every tag to the
//! registered [`TagSink`]s (the aggregator first) and forwards every error to
//! the [`ReconnectionSupervisor`](crate::supervisor). Stopping tells the
//! driver to stop, then cancels the pump and waits for it, so no observation
//! reaches a sink after `stop_continuous` returns.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rfidlib_core::endpoint::Endpoint;
use rfidlib_core::error::{Advisory, Error, ErrorKind, Result};
use rfidlib_core::events::{DriverEvent, SessionEvent};
use rfidlib_core::gen2::TuningSettings;
use rfidlib_core::models::{self, ReaderModel};
use rfidlib_core::params::{ParamValue, paths};
use rfidlib_core::plan::ReadPlan;
use rfidlib_core::reader::{ReaderConnector, ReaderDriver, TagSink};
use rfidlib_core::types::{ReaderInfo, Region, TagObservation};

use crate::aggregator::TagAggregator;
use crate::builder::SessionBuilder;
use crate::supervisor::{
    AdvisoryFilter, RetryState, SupervisedError, SupervisorHandle, spawn_supervisor,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What a connected session is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    Reading,
}

/// Connection state, published through [`SessionController::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected(ReadState),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Point-in-time view of the connected reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSession {
    pub endpoint: Endpoint,
    pub model: ReaderModel,
    pub info: ReaderInfo,
    pub state: ConnectionState,
    /// Last plan the reader accepted.
    pub read_plan: Option<ReadPlan>,
    /// Last tuning the reader accepted.
    pub tuning: TuningSettings,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Values fixed at build time.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub connect_timeout: Duration,
    pub transport_timeout: Duration,
    pub read_overhead: Duration,
    pub driver_channel_capacity: usize,
    pub max_reconnect_attempts: u32,
    pub default_region: Option<Region>,
}

/// An open, identified reader.
struct Link {
    driver: Box<dyn ReaderDriver>,
    model: ReaderModel,
    info: ReaderInfo,
}

/// The pump task of a running continuous read.
struct ReadPump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SessionInner {
    link: Option<Link>,
    /// Kept while the link is down between reconnection attempts.
    endpoint: Option<Endpoint>,
    pump: Option<ReadPump>,
    supervisor: Option<SupervisorHandle>,
    plan: Option<ReadPlan>,
    tuning: TuningSettings,
    /// The user asked for a continuous read; reconnection resumes it.
    continuous: bool,
    /// Bumped whenever a read starts or is torn down.
    generation: u64,
    /// A firmware update owns the device.
    flashing: bool,
}

type SinkList = Arc<RwLock<Vec<Arc<dyn TagSink>>>>;

pub(crate) struct Shared {
    connector: Arc<dyn ReaderConnector>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<SessionEvent>,
    aggregator: Arc<TagAggregator>,
    sinks: SinkList,
    retry: parking_lot::Mutex<RetryState>,
    advisories: parking_lot::Mutex<AdvisoryFilter>,
}

// ---------------------------------------------------------------------------
// SessionController
// ---------------------------------------------------------------------------

/// Handle to one reader session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Start configuring a controller that opens readers through `connector`.
    pub fn builder(connector: Arc<dyn ReaderConnector>) -> SessionBuilder {
        SessionBuilder::new(connector)
    }

    pub(crate) fn new(
        connector: Arc<dyn ReaderConnector>,
        config: SessionConfig,
        event_capacity: usize,
        unique_by_data: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(event_capacity);
        let aggregator = Arc::new(TagAggregator::new(unique_by_data));
        let sinks: Vec<Arc<dyn TagSink>> = vec![aggregator.clone()];
        let retry = RetryState::new(config.max_reconnect_attempts);

        SessionController {
            shared: Arc::new(Shared {
                connector,
                config,
                inner: Mutex::new(SessionInner::default()),
                state_tx,
                event_tx,
                aggregator,
                sinks: Arc::new(RwLock::new(sinks)),
                retry: parking_lot::Mutex::new(retry),
                advisories: parking_lot::Mutex::new(AdvisoryFilter::default()),
            }),
        }
    }

    pub(crate) fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| SessionController { shared })
    }

    // -- observation ------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that sees every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// The aggregator every observation is fed into.
    pub fn aggregator(&self) -> Arc<TagAggregator> {
        self.shared.aggregator.clone()
    }

    /// Feed observations to `sink` as well, after the aggregator.
    pub fn add_sink(&self, sink: Arc<dyn TagSink>) {
        self.shared.sinks.write().push(sink);
    }

    pub fn retry_state(&self) -> RetryState {
        *self.shared.retry.lock()
    }

    /// Stop surfacing `advisory` ("don't show again").
    pub fn suppress_advisory(&self, advisory: Advisory) {
        self.shared.advisories.lock().suppress(advisory);
    }

    pub fn allow_advisory(&self, advisory: Advisory) {
        self.shared.advisories.lock().allow(advisory);
    }

    pub fn is_advisory_suppressed(&self, advisory: Advisory) -> bool {
        self.shared.advisories.lock().is_suppressed(advisory)
    }

    /// Snapshot of the connected session, `None` when disconnected.
    pub async fn session(&self) -> Option<ReaderSession> {
        let inner = self.shared.inner.lock().await;
        let link = inner.link.as_ref()?;
        Some(ReaderSession {
            endpoint: inner.endpoint.clone()?,
            model: link.model.clone(),
            info: link.info.clone(),
            state: self.state(),
            read_plan: inner.plan.clone(),
            tuning: inner.tuning.clone(),
            consecutive_failures: self.shared.retry.lock().consecutive_failures,
        })
    }

    /// Endpoint of the current session, kept across a dropped link.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.shared.inner.lock().await.endpoint.clone()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state_tx.send_replace(state);
    }

    // -- connection -------------------------------------------------------

    /// Open the reader at `uri`, identify it, and set the transport timeout.
    ///
    /// Fails with [`Error::Busy`] if a reader is already connected or a
    /// firmware update is running.
    pub async fn connect(&self, uri: &str) -> Result<ReaderSession> {
        let endpoint = Endpoint::parse(uri)?;
        let mut guard = self.shared.inner.lock().await;
        ensure_not_flashing(&guard)?;
        self.connect_locked(&mut guard, endpoint).await
    }

    async fn connect_locked(
        &self,
        inner: &mut SessionInner,
        endpoint: Endpoint,
    ) -> Result<ReaderSession> {
        if inner.link.is_some() {
            return Err(Error::Busy("a reader is already connected".into()));
        }

        self.set_state(ConnectionState::Connecting);
        debug!(endpoint = %endpoint, "connecting to reader");

        let link = match self.establish(&endpoint).await {
            Ok(link) => link,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "connect failed");
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        info!(
            endpoint = %endpoint,
            model = %link.info.model,
            region = %link.info.region,
            "reader connected"
        );

        let session = ReaderSession {
            endpoint: endpoint.clone(),
            model: link.model.clone(),
            info: link.info.clone(),
            state: ConnectionState::Connected(ReadState::Idle),
            read_plan: None,
            tuning: TuningSettings::default(),
            consecutive_failures: 0,
        };

        self.emit(SessionEvent::Connected {
            model: link.info.model.clone(),
        });
        inner.link = Some(link);
        inner.endpoint = Some(endpoint);
        inner.plan = None;
        inner.tuning = TuningSettings::default();
        self.set_state(ConnectionState::Connected(ReadState::Idle));
        Ok(session)
    }

    /// Release the reader. Safe to call any number of times.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        self.release(&mut guard).await;
        Ok(())
    }

    /// Open a driver and connect it within the connect timeout. A handle
    /// that fails to connect is disconnected before the error is returned.
    async fn open_driver(&self, endpoint: &Endpoint) -> Result<Box<dyn ReaderDriver>> {
        let timeout = self.shared.config.connect_timeout;
        let mut driver = self.shared.connector.open(endpoint).await?;

        match tokio::time::timeout(timeout, driver.connect()).await {
            Ok(Ok(())) => Ok(driver),
            Ok(Err(e)) => {
                let _ = driver.disconnect().await;
                Err(e)
            }
            Err(_) => {
                let _ = driver.disconnect().await;
                Err(Error::DeviceUnreachable(format!(
                    "{endpoint}: no answer within {timeout:?}"
                )))
            }
        }
    }

    /// Open a driver and identify the reader behind it.
    async fn establish(&self, endpoint: &Endpoint) -> Result<Link> {
        let mut driver = self.open_driver(endpoint).await?;

        match self.identify(driver.as_mut()).await {
            Ok((model, info)) => Ok(Link {
                driver,
                model,
                info,
            }),
            Err(e) => {
                let _ = driver.disconnect().await;
                Err(e)
            }
        }
    }

    /// Read model, region, firmware version and ports; apply the
    /// session-wide parameters.
    async fn identify(&self, driver: &mut dyn ReaderDriver) -> Result<(ReaderModel, ReaderInfo)> {
        let config = &self.shared.config;

        let model_name = text_param(driver, paths::MODEL).await?;
        let model = ReaderModel::lookup(&model_name).unwrap_or_else(|| {
            warn!(model = %model_name, "unknown reader model, assuming generic capabilities");
            models::generic()
        });

        let software_version = match text_param(driver, paths::SOFTWARE_VERSION).await {
            Ok(version) => version,
            Err(e) => {
                debug!(error = %e, "reader did not report a software version");
                String::new()
            }
        };

        let reported = text_param(driver, paths::REGION).await?;
        let mut region = reported
            .parse::<Region>()
            .map_err(|e| Error::ProtocolFault(e.to_string()))?;
        if region == Region::Unspecified {
            if let Some(default) = config.default_region {
                info!(region = %default, "reader has no region, applying default");
                driver
                    .param_set(paths::REGION, ParamValue::from(default.to_string()))
                    .await?;
                region = default;
            }
        }

        let connected_ports = match driver.param_get(paths::CONNECTED_PORTS).await? {
            ParamValue::Ports(ports) => ports,
            other => {
                return Err(Error::ProtocolFault(format!(
                    "{} returned {other}, expected a port list",
                    paths::CONNECTED_PORTS
                )));
            }
        };

        let timeout_ms = i64::try_from(config.transport_timeout.as_millis()).unwrap_or(i64::MAX);
        driver
            .param_set(paths::TRANSPORT_TIMEOUT, ParamValue::Int(timeout_ms))
            .await?;

        let unique_by_data = self.shared.aggregator.unique_by_data();
        if let Err(e) = driver
            .param_set(paths::UNIQUE_BY_DATA, ParamValue::Bool(unique_by_data))
            .await
        {
            warn!(error = %e, "reader rejected unique-by-data setting");
        }

        Ok((
            model,
            ReaderInfo {
                model: model_name,
                software_version,
                region,
                connected_ports,
            },
        ))
    }

    /// Tear down and forget the session.
    async fn release(&self, inner: &mut SessionInner) {
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.stop();
        }
        inner.continuous = false;
        if let Err(e) = halt_pump(inner).await {
            debug!(error = %e, "stop_reading failed during disconnect");
        }

        let had_session = inner.link.is_some() || inner.endpoint.is_some();
        if let Some(mut link) = inner.link.take() {
            if let Err(e) = link.driver.disconnect().await {
                debug!(error = %e, "driver disconnect failed");
            }
        }
        inner.endpoint = None;
        inner.plan = None;
        inner.tuning = TuningSettings::default();
        inner.generation += 1;

        self.shared.aggregator.pause_clock();
        self.shared.retry.lock().reset();
        self.set_state(ConnectionState::Disconnected);

        if had_session {
            info!("reader disconnected");
            self.emit(SessionEvent::Disconnected);
        }
    }

    // -- firmware hooks ---------------------------------------------------

    /// Tear the session down and reserve the device for a firmware update.
    /// Until [`finish_flash`](Self::finish_flash) every device operation
    /// fails with [`Error::Busy`]. Returns the endpoint to flash.
    pub(crate) async fn begin_flash(&self) -> Result<Endpoint> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        ensure_not_flashing(inner)?;
        let endpoint = inner.endpoint.clone().ok_or(Error::NotConnected)?;
        self.release(inner).await;
        inner.flashing = true;
        Ok(endpoint)
    }

    /// Open an exclusive driver for flashing, within the connect timeout.
    pub(crate) async fn open_flash_handle(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn ReaderDriver>> {
        self.open_driver(endpoint).await
    }

    /// Release the firmware reservation and reconnect to `endpoint` in one
    /// step, so no other caller can slip in between.
    pub(crate) async fn finish_flash(&self, endpoint: &Endpoint) -> Result<ReaderSession> {
        let mut guard = self.shared.inner.lock().await;
        guard.flashing = false;
        self.connect_locked(&mut guard, endpoint.clone()).await
    }

    // -- configuration ----------------------------------------------------

    /// Push `plan` and `tuning` to the reader.
    ///
    /// Both are checked against the model's capabilities first. If the
    /// reader itself rejects a parameter, the last configuration it accepted
    /// is pushed back and the error names the value now in effect.
    pub async fn apply_read_plan(&self, plan: &ReadPlan, tuning: &TuningSettings) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        ensure_not_flashing(inner)?;

        if inner.pump.is_some() {
            return Err(Error::Busy(
                "cannot change the read plan while a continuous read is running".into(),
            ));
        }
        let link = inner.link.as_mut().ok_or(Error::NotConnected)?;

        plan.check_capabilities(&link.model.capabilities)?;
        tuning.validate(&link.model.capabilities)?;

        match push_configuration(link.driver.as_mut(), plan, tuning).await {
            Ok(()) => {
                debug!(plan = %plan, tuning = %tuning, "read plan applied");
                inner.plan = Some(plan.clone());
                inner.tuning = tuning.clone();
                Ok(())
            }
            Err(Error::UnsupportedConfiguration { param, reason, .. }) => {
                let Some(good_plan) = inner.plan.clone() else {
                    warn!(param = %param, reason = %reason, "reader rejected parameter");
                    return Err(Error::UnsupportedConfiguration {
                        param,
                        reason,
                        reverted_to: None,
                    });
                };
                let good_tuning = inner.tuning.clone();
                if let Err(e) =
                    push_configuration(link.driver.as_mut(), &good_plan, &good_tuning).await
                {
                    warn!(error = %e, "restoring last accepted configuration failed");
                }
                let value = reverted_value(&param, &good_plan, &good_tuning);
                warn!(param = %param, reason = %reason, reverted_to = %value, "reader rejected parameter, reverted");
                self.emit(SessionEvent::ConfigurationReverted {
                    param: param.clone(),
                    value: value.clone(),
                });
                Err(Error::UnsupportedConfiguration {
                    param,
                    reason,
                    reverted_to: Some(value),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Change the aggregation key. Clears the aggregate when the setting
    /// changes and tells the reader when one is connected and idle.
    pub async fn set_unique_by_data(&self, enabled: bool) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        ensure_not_flashing(inner)?;
        if inner.pump.is_some() {
            return Err(Error::Busy(
                "cannot change unique-by-data while a continuous read is running".into(),
            ));
        }
        self.shared.aggregator.set_unique_by_data(enabled);
        if let Some(link) = inner.link.as_mut() {
            link.driver
                .param_set(paths::UNIQUE_BY_DATA, ParamValue::Bool(enabled))
                .await?;
        }
        Ok(())
    }

    /// Switch the reader to `region`. Nothing is written when the reader is
    /// already operating there.
    pub async fn set_region(&self, region: Region) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        ensure_not_flashing(inner)?;
        if inner.pump.is_some() {
            return Err(Error::Busy(
                "cannot change the region while a continuous read is running".into(),
            ));
        }
        let link = inner.link.as_mut().ok_or(Error::NotConnected)?;
        if link.info.region == region {
            return Ok(());
        }
        link.driver
            .param_set(paths::REGION, ParamValue::from(region.to_string()))
            .await?;
        info!(from = %link.info.region, to = %region, "reader region changed");
        link.info.region = region;
        Ok(())
    }

    // -- reading ----------------------------------------------------------

    /// Run one inventory pass of length `timeout`.
    ///
    /// Waits at most `timeout` plus the configured command overhead. A pass
    /// in which no tag answered returns an empty batch. A reader that stops
    /// answering ends the session.
    pub async fn read_once(&self, timeout: Duration) -> Result<Vec<TagObservation>> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        ensure_not_flashing(inner)?;

        if inner.pump.is_some() {
            return Err(Error::Busy("a continuous read is running".into()));
        }
        let link = inner.link.as_mut().ok_or(Error::NotConnected)?;

        self.set_state(ConnectionState::Connected(ReadState::Reading));
        self.shared.aggregator.resume_clock();

        let bound = timeout + self.shared.config.read_overhead;
        let result = match tokio::time::timeout(bound, link.driver.read(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };
        self.shared.aggregator.pause_clock();

        match result {
            Ok(tags) => {
                debug!(count = tags.len(), "single-shot read complete");
                let sinks = self.shared.sinks.read();
                for tag in &tags {
                    for sink in sinks.iter() {
                        sink.accept(tag);
                    }
                }
                drop(sinks);
                self.set_state(ConnectionState::Connected(ReadState::Idle));
                Ok(tags)
            }
            Err(e) => match e.kind() {
                ErrorKind::TransientRead => {
                    debug!(error = %e, "no tags answered");
                    self.set_state(ConnectionState::Connected(ReadState::Idle));
                    Ok(Vec::new())
                }
                ErrorKind::Timeout | ErrorKind::ConnectionLost => {
                    warn!(error = %e, "single-shot read lost the reader, disconnecting");
                    self.release(inner).await;
                    Err(e)
                }
                _ => {
                    self.set_state(ConnectionState::Connected(ReadState::Idle));
                    Err(e)
                }
            },
        }
    }

    /// Start a continuous read. No effect if one is already running.
    pub async fn start_continuous(&self) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        ensure_not_flashing(inner)?;

        if inner.link.is_none() {
            return Err(Error::NotConnected);
        }
        if inner.pump.is_some() {
            debug!("continuous read already running");
            return Ok(());
        }

        *self.shared.retry.lock() = RetryState::new(self.shared.config.max_reconnect_attempts);
        if inner.supervisor.is_none() {
            inner.supervisor = Some(spawn_supervisor(Arc::downgrade(&self.shared)));
        }

        if let Err(e) = self.spawn_pump(inner).await {
            if let Some(supervisor) = inner.supervisor.take() {
                supervisor.stop();
            }
            return Err(e);
        }

        inner.continuous = true;
        self.shared.aggregator.resume_clock();
        self.set_state(ConnectionState::Connected(ReadState::Reading));
        info!("continuous read started");
        self.emit(SessionEvent::ReadStarted);
        Ok(())
    }

    /// Stop the continuous read. No effect if none is running.
    ///
    /// When this returns the driver has stopped and the pump has exited:
    /// no further observation reaches any sink.
    pub async fn stop_continuous(&self) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;

        inner.continuous = false;
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.stop();
        }
        self.shared.retry.lock().reset();

        if inner.pump.is_none() {
            return Ok(());
        }

        if let Err(e) = halt_pump(inner).await {
            warn!(error = %e, "driver did not stop cleanly");
        }
        self.shared.aggregator.pause_clock();
        if inner.link.is_some() {
            self.set_state(ConnectionState::Connected(ReadState::Idle));
        }
        info!("continuous read stopped");
        self.emit(SessionEvent::ReadStopped);
        Ok(())
    }

    async fn spawn_pump(&self, inner: &mut SessionInner) -> Result<()> {
        let link = inner.link.as_mut().ok_or(Error::NotConnected)?;
        let (tx, rx) = mpsc::channel(self.shared.config.driver_channel_capacity);
        link.driver.start_reading(tx).await?;

        inner.generation += 1;
        let cancel = CancellationToken::new();
        let errors = inner.supervisor.as_ref().map(|s| s.errors.clone());
        let task = tokio::spawn(pump_loop(
            rx,
            self.shared.sinks.clone(),
            errors,
            inner.generation,
            cancel.clone(),
        ));
        inner.pump = Some(ReadPump { cancel, task });
        Ok(())
    }

    // -- supervisor hooks -------------------------------------------------

    /// Whether errors from `generation` still belong to the running read.
    pub(crate) async fn is_current(&self, generation: u64) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.pump.is_some() && inner.generation == generation
    }

    pub(crate) fn record_failure(&self) -> (u32, u32) {
        let mut retry = self.shared.retry.lock();
        let attempt = retry.record_failure();
        (attempt, retry.max_retries)
    }

    pub(crate) fn reset_retry(&self) {
        self.shared.retry.lock().reset();
    }

    /// Drop the current link, open a fresh one to the same endpoint,
    /// reapply the last accepted configuration, and resume a continuous
    /// read if one was requested.
    pub(crate) async fn reconnect(&self) -> Result<()> {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;

        let endpoint = inner.endpoint.clone().ok_or(Error::NotConnected)?;
        let _ = halt_pump(inner).await;
        if let Some(mut link) = inner.link.take() {
            let _ = link.driver.disconnect().await;
        }
        inner.generation += 1;
        self.set_state(ConnectionState::Connecting);

        let mut link = match self.establish(&endpoint).await {
            Ok(link) => link,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Some(plan) = inner.plan.clone() {
            if let Err(e) = push_configuration(link.driver.as_mut(), &plan, &inner.tuning).await {
                let _ = link.driver.disconnect().await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }
        inner.link = Some(link);

        if inner.continuous {
            if let Err(e) = self.spawn_pump(inner).await {
                if let Some(mut link) = inner.link.take() {
                    let _ = link.driver.disconnect().await;
                }
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
            self.shared.aggregator.resume_clock();
            self.set_state(ConnectionState::Connected(ReadState::Reading));
        } else {
            self.set_state(ConnectionState::Connected(ReadState::Idle));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_not_flashing(inner: &SessionInner) -> Result<()> {
    if inner.flashing {
        Err(Error::Busy("a firmware update is in progress".into()))
    } else {
        Ok(())
    }
}

async fn text_param(driver: &mut dyn ReaderDriver, path: &str) -> Result<String> {
    match driver.param_get(path).await? {
        ParamValue::Text(text) => Ok(text),
        other => Err(Error::ProtocolFault(format!(
            "{path} returned {other}, expected text"
        ))),
    }
}

/// Write the plan, then every tuning parameter, in order.
async fn push_configuration(
    driver: &mut dyn ReaderDriver,
    plan: &ReadPlan,
    tuning: &TuningSettings,
) -> Result<()> {
    driver
        .param_set(paths::READ_PLAN, ParamValue::Plan(plan.clone()))
        .await?;
    for (path, value) in tuning.to_params() {
        driver.param_set(path, value).await?;
    }
    Ok(())
}

/// The value `param` has after reverting to `plan` and `tuning`.
fn reverted_value(param: &str, plan: &ReadPlan, tuning: &TuningSettings) -> String {
    if param == paths::READ_PLAN {
        return plan.to_string();
    }
    tuning
        .to_params()
        .into_iter()
        .find(|(path, _)| *path == param)
        .map(|(_, value)| value.to_string())
        .unwrap_or_else(|| "reader default".to_string())
}

/// Stop the driver's stream and wait for the pump to drain and exit.
async fn halt_pump(inner: &mut SessionInner) -> Result<()> {
    let Some(pump) = inner.pump.take() else {
        return Ok(());
    };
    inner.generation += 1;

    let stopped = match inner.link.as_mut() {
        Some(link) => link.driver.stop_reading().await,
        None => Ok(()),
    };
    pump.cancel.cancel();
    let _ = pump.task.await;
    stopped
}

/// Deliver driver events until cancelled or the driver drops its sender.
async fn pump_loop(
    mut rx: mpsc::Receiver<DriverEvent>,
    sinks: SinkList,
    errors: Option<mpsc::UnboundedSender<SupervisedError>>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // The driver has stopped; hand over what it queued before.
                while let Ok(event) = rx.try_recv() {
                    dispatch(event, &sinks, errors.as_ref(), generation);
                }
                debug!(generation, "read pump stopped");
                break;
            }

            event = rx.recv() => match event {
                Some(event) => dispatch(event, &sinks, errors.as_ref(), generation),
                None => {
                    // A driver that stops streaming on its own has lost the
                    // reader, even if it never said so.
                    if !cancel.is_cancelled() {
                        if let Some(tx) = errors.as_ref() {
                            warn!(generation, "driver event stream ended unexpectedly");
                            let _ = tx.send(SupervisedError {
                                generation,
                                error: Error::ConnectionLost,
                            });
                        }
                    }
                    debug!(generation, "driver event channel closed");
                    break;
                }
            },
        }
    }
}

fn dispatch(
    event: DriverEvent,
    sinks: &RwLock<Vec<Arc<dyn TagSink>>>,
    errors: Option<&mpsc::UnboundedSender<SupervisedError>>,
    generation: u64,
) {
    match event {
        DriverEvent::TagRead(observation) => {
            for sink in sinks.read().iter() {
                sink.accept(&observation);
            }
        }
        DriverEvent::ReadError(error) => match errors {
            Some(tx) => {
                let _ = tx.send(SupervisedError { generation, error });
            }
            None => warn!(error = %error, "read error with no supervisor attached"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfidlib_core::gen2::{LinkFrequency, Tari};
    use rfidlib_core::plan::{ReadPlanRequest, build_read_plan};
    use rfidlib_core::types::TagProtocol;
    use rfidlib_test_harness::{Fault, MockConnector, ReadOutcome};

    const URI: &str = "tmr:///dev/ttyUSB0";

    fn controller(mock: &MockConnector) -> SessionController {
        SessionController::builder(Arc::new(mock.clone()))
            .read_overhead(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn gen2_plan(antennas: &[u8]) -> ReadPlan {
        build_read_plan(&ReadPlanRequest::new(&[TagProtocol::Gen2], antennas)).unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<SessionEvent>,
        mut wanted: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    #[tokio::test]
    async fn connect_reads_identity_and_sets_timeout() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        let info = session.connect(URI).await.unwrap();

        assert_eq!(info.model.name, "M6e");
        assert_eq!(info.info.region, Region::Na);
        assert_eq!(info.info.connected_ports, vec![1, 2]);
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Idle));
        assert_eq!(
            mock.param(paths::TRANSPORT_TIMEOUT),
            Some(ParamValue::Int(1000))
        );
    }

    #[tokio::test]
    async fn connect_rejects_bad_uri_without_opening() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        let err = session.connect("http://nope").await.unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
        assert_eq!(mock.open_calls(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_kind() {
        let mock = MockConnector::new("M6e");
        mock.fail_connects(1, Fault::AccessDenied);
        let session = controller(&mock);
        let err = session.connect(URI).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        // The next attempt goes through.
        session.connect(URI).await.unwrap();
    }

    #[tokio::test]
    async fn second_connect_is_busy() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        assert!(matches!(session.connect(URI).await, Err(Error::Busy(_))));
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_generic() {
        let mock = MockConnector::new("Prototype X");
        let session = controller(&mock);
        let info = session.connect(URI).await.unwrap();
        assert_eq!(info.model.name, "Unknown");
        assert_eq!(info.info.model, "Prototype X");
    }

    #[tokio::test]
    async fn default_region_applied_when_unset() {
        let mock = MockConnector::new("M6e");
        mock.set_param(paths::REGION, ParamValue::from("UNSPEC"));
        let session = SessionController::builder(Arc::new(mock.clone()))
            .default_region(Region::Eu3)
            .build()
            .unwrap();
        let info = session.connect(URI).await.unwrap();
        assert_eq!(info.info.region, Region::Eu3);
        assert_eq!(mock.param(paths::REGION), Some(ParamValue::from("EU3")));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.disconnect().await.unwrap();
        session.connect(URI).await.unwrap();
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.session().await.is_none());
        assert_eq!(mock.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn apply_pushes_plan_and_tuning() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();

        let plan = gen2_plan(&[1, 2]);
        let tuning = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz250),
            ..Default::default()
        };
        session.apply_read_plan(&plan, &tuning).await.unwrap();

        assert_eq!(mock.param(paths::READ_PLAN), Some(ParamValue::Plan(plan.clone())));
        assert_eq!(mock.param(paths::GEN2_BLF), Some(ParamValue::Int(250)));
        let snapshot = session.session().await.unwrap();
        assert_eq!(snapshot.read_plan, Some(plan));
        assert_eq!(snapshot.tuning, tuning);
    }

    #[tokio::test]
    async fn apply_rejects_unsupported_tari_before_device() {
        let mock = MockConnector::new("M6e Nano");
        mock.set_param(paths::CONNECTED_PORTS, ParamValue::Ports(vec![1]));
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let writes_before = mock.param_writes().len();

        let tuning = TuningSettings {
            tari: Some(Tari::Us25),
            ..Default::default()
        };
        let err = session
            .apply_read_plan(&gen2_plan(&[1]), &tuning)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(mock.param_writes().len(), writes_before);

        // The reduced configuration is accepted.
        session
            .apply_read_plan(&gen2_plan(&[1]), &tuning.reduced())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn device_rejection_reverts_to_last_good() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();

        let good = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz250),
            ..Default::default()
        };
        session.apply_read_plan(&gen2_plan(&[1]), &good).await.unwrap();

        mock.reject_value(
            paths::GEN2_BLF,
            ParamValue::Int(640),
            "BLF not allowed in this region",
        );
        let bad = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz640),
            ..Default::default()
        };
        let err = session
            .apply_read_plan(&gen2_plan(&[1, 2]), &bad)
            .await
            .unwrap_err();
        match err {
            Error::UnsupportedConfiguration {
                param, reverted_to, ..
            } => {
                assert_eq!(param, paths::GEN2_BLF);
                assert_eq!(reverted_to.as_deref(), Some("250"));
            }
            other => panic!("expected UnsupportedConfiguration, got {other:?}"),
        }
        assert_eq!(
            mock.param(paths::READ_PLAN),
            Some(ParamValue::Plan(gen2_plan(&[1])))
        );
        let event = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::ConfigurationReverted { .. })
        })
        .await;
        assert_eq!(
            event,
            SessionEvent::ConfigurationReverted {
                param: paths::GEN2_BLF.into(),
                value: "250".into()
            }
        );
    }

    #[tokio::test]
    async fn apply_requires_connection() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        let err = session
            .apply_read_plan(&gen2_plan(&[1]), &TuningSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn read_once_returns_and_aggregates() {
        let mock = MockConnector::new("M6e");
        mock.push_read(ReadOutcome::Tags(vec![
            TagObservation::new("E2001"),
            TagObservation::new("E2002"),
            TagObservation::new("E2001"),
        ]));
        let session = controller(&mock);
        session.connect(URI).await.unwrap();

        let tags = session.read_once(Duration::from_millis(100)).await.unwrap();
        assert_eq!(tags.len(), 3);
        let snap = session.aggregator().snapshot();
        assert_eq!(snap.total_reads, 3);
        assert_eq!(snap.unique_tags, 2);
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Idle));
    }

    #[tokio::test]
    async fn read_once_no_tags_is_empty() {
        let mock = MockConnector::new("M6e");
        mock.push_read(ReadOutcome::Fail(Fault::NoTagResponse));
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let tags = session.read_once(Duration::from_millis(100)).await.unwrap();
        assert!(tags.is_empty());
        assert!(session.state().is_connected());
    }

    #[tokio::test]
    async fn read_once_hang_times_out_and_disconnects() {
        let mock = MockConnector::new("M6e");
        mock.push_read(ReadOutcome::Hang);
        let session = controller(&mock);
        session.connect(URI).await.unwrap();

        let started = std::time::Instant::now();
        let err = session.read_once(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn continuous_start_stop_are_idempotent() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();

        session.stop_continuous().await.unwrap();
        session.start_continuous().await.unwrap();
        session.start_continuous().await.unwrap();
        assert_eq!(mock.start_calls(), 1);
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Reading));

        session.stop_continuous().await.unwrap();
        session.stop_continuous().await.unwrap();
        assert_eq!(mock.stop_calls(), 1);
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Idle));
    }

    #[tokio::test]
    async fn continuous_feeds_sinks_and_nothing_after_stop() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        session.start_continuous().await.unwrap();

        for i in 0..20 {
            assert!(mock.emit_tag(TagObservation::new(format!("E{i:04}"))));
        }
        let aggregator = session.aggregator();
        wait_until(|| aggregator.total_reads() == 20).await;

        session.stop_continuous().await.unwrap();
        assert!(!mock.emit_tag(TagObservation::new("LATE")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(aggregator.total_reads(), 20);
    }

    #[tokio::test]
    async fn configuration_rejected_while_reading() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        session.start_continuous().await.unwrap();

        let err = session
            .apply_read_plan(&gen2_plan(&[1]), &TuningSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert!(matches!(
            session.read_once(Duration::from_millis(10)).await,
            Err(Error::Busy(_))
        ));
        session.stop_continuous().await.unwrap();
    }

    #[tokio::test]
    async fn connection_lost_gives_up_after_five_attempts() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();

        mock.fail_all_connects(Fault::ConnectionLost);
        assert!(mock.emit_error(Fault::ConnectionLost));

        let event = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::ReconnectFailed { .. })
        })
        .await;
        assert_eq!(event, SessionEvent::ReconnectFailed { attempts: 5 });
        // One initial connect plus exactly five reconnects.
        assert_eq!(mock.connect_calls(), 6);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.retry_state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn reconnect_restores_plan_and_resumes_reading() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let plan = gen2_plan(&[2]);
        session
            .apply_read_plan(&plan, &TuningSettings::default())
            .await
            .unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();

        mock.fail_connects(2, Fault::Unreachable);
        mock.clear_param(paths::READ_PLAN);
        assert!(mock.emit_error(Fault::ConnectionLost));

        next_matching(&mut events, |e| matches!(e, SessionEvent::Reconnected)).await;
        assert_eq!(mock.connect_calls(), 4);
        assert_eq!(mock.param(paths::READ_PLAN), Some(ParamValue::Plan(plan)));
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Reading));
        assert_eq!(mock.start_calls(), 2);
        assert_eq!(session.retry_state().consecutive_failures, 0);

        assert!(mock.emit_tag(TagObservation::new("AFTER")));
        let aggregator = session.aggregator();
        wait_until(|| aggregator.total_reads() == 1).await;
        session.stop_continuous().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_while_reading_disconnects() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();

        assert!(mock.emit_error(Fault::Timeout));
        next_matching(&mut events, |e| matches!(e, SessionEvent::ReadError { .. })).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(mock.connect_calls(), 1);
    }

    #[tokio::test]
    async fn transient_errors_keep_reading() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        session.start_continuous().await.unwrap();

        assert!(mock.emit_error(Fault::NoTagResponse));
        assert!(mock.emit_tag(TagObservation::new("E1")));
        let aggregator = session.aggregator();
        wait_until(|| aggregator.total_reads() == 1).await;
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Reading));
        session.stop_continuous().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_error_stops_reading_without_retry() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();

        assert!(mock.emit_error(Fault::Other("firmware assertion".into())));
        let event =
            next_matching(&mut events, |e| matches!(e, SessionEvent::ReadError { .. })).await;
        assert!(matches!(event, SessionEvent::ReadError { message } if message.contains("firmware assertion")));
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Idle));
        assert_eq!(mock.connect_calls(), 1);
    }

    #[tokio::test]
    async fn advisories_surface_until_suppressed() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();

        assert!(mock.emit_error(Fault::Advisory(Advisory::HighTemperature)));
        let event =
            next_matching(&mut events, |e| matches!(e, SessionEvent::Advisory { .. })).await;
        assert!(matches!(
            event,
            SessionEvent::Advisory {
                advisory: Advisory::HighTemperature,
                ..
            }
        ));

        session.suppress_advisory(Advisory::HighTemperature);
        assert!(mock.emit_error(Fault::Advisory(Advisory::HighTemperature)));
        assert!(mock.emit_error(Fault::Advisory(Advisory::HighReturnLoss)));
        let event =
            next_matching(&mut events, |e| matches!(e, SessionEvent::Advisory { .. })).await;
        assert!(matches!(
            event,
            SessionEvent::Advisory {
                advisory: Advisory::HighReturnLoss,
                ..
            }
        ));
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Reading));
        session.stop_continuous().await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_one_session() {
        let mock = MockConnector::new("M6e");
        let a = controller(&mock);
        let b = a.clone();
        a.connect(URI).await.unwrap();
        assert!(b.state().is_connected());
        b.disconnect().await.unwrap();
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn silently_ended_stream_triggers_reconnect() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();

        assert!(mock.end_stream());

        next_matching(&mut events, |e| matches!(e, SessionEvent::Reconnected)).await;
        assert_eq!(mock.connect_calls(), 2);
        assert_eq!(mock.start_calls(), 2);
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Reading));

        assert!(mock.emit_tag(TagObservation::new("AFTER")));
        let aggregator = session.aggregator();
        wait_until(|| aggregator.total_reads() == 1).await;
        session.stop_continuous().await.unwrap();
    }

    #[tokio::test]
    async fn stopping_does_not_look_like_a_lost_stream() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();
        let mut events = session.subscribe();
        session.start_continuous().await.unwrap();
        session.stop_continuous().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Reconnecting { .. }));
        }
        assert_eq!(mock.connect_calls(), 1);
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Idle));
    }

    #[tokio::test]
    async fn set_region_writes_only_on_change() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();

        session.set_region(Region::Na).await.unwrap();
        assert!(
            !mock
                .param_writes()
                .iter()
                .any(|(path, _)| path == paths::REGION)
        );

        session.set_region(Region::Eu3).await.unwrap();
        assert_eq!(mock.param(paths::REGION), Some(ParamValue::from("EU3")));
        assert_eq!(session.session().await.unwrap().info.region, Region::Eu3);
    }

    #[tokio::test]
    async fn flash_reservation_blocks_device_access() {
        let mock = MockConnector::new("M6e");
        let session = controller(&mock);
        session.connect(URI).await.unwrap();

        let endpoint = session.begin_flash().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);

        assert!(matches!(session.connect(URI).await, Err(Error::Busy(_))));
        assert!(matches!(
            session.read_once(Duration::from_millis(10)).await,
            Err(Error::Busy(_))
        ));
        assert!(matches!(session.start_continuous().await, Err(Error::Busy(_))));
        assert!(matches!(
            session
                .apply_read_plan(&gen2_plan(&[1]), &TuningSettings::default())
                .await,
            Err(Error::Busy(_))
        ));
        assert!(matches!(session.begin_flash().await, Err(Error::Busy(_))));
        assert_eq!(mock.open_calls(), 1);

        session.finish_flash(&endpoint).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected(ReadState::Idle));
        session.read_once(Duration::from_millis(10)).await.unwrap();
    }
}
