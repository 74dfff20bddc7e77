//! A simulated reader with a random tag field.
//!
//! [`SimulatedConnector`] stands in for real hardware in the demo binary and
//! in soak-style tests: single-shot reads return a random subset of a fixed
//! tag population, and a continuous read streams observations at a steady
//! pace with randomized RSSI, antenna, frequency, and phase. It can also be
//! told to drop the link once, to exercise reconnection end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rfidlib_core::endpoint::Endpoint;
use rfidlib_core::error::{Error, Result};
use rfidlib_core::events::DriverEvent;
use rfidlib_core::params::{ParamValue, paths};
use rfidlib_core::reader::{ReaderConnector, ReaderDriver};
use rfidlib_core::types::{TagObservation, TagProtocol};

/// Leading bytes every accepted firmware image must carry.
pub const FIRMWARE_MAGIC: &[u8] = b"TMFW";

/// State every handle to the simulated reader shares.
#[derive(Debug)]
struct Field {
    population: Vec<String>,
    params: Mutex<HashMap<String, ParamValue>>,
    /// Observations streamed so far, across every handle.
    streamed: AtomicU64,
    dropped: AtomicBool,
}

/// Connector for a simulated reader.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    model: String,
    interval: Duration,
    seed: Option<u64>,
    drop_after: Option<u64>,
    field: Arc<Field>,
}

impl SimulatedConnector {
    /// A reader reporting `model` with `tags` distinct tags in its field.
    pub fn new(model: &str, tags: usize) -> Self {
        let population = (0..tags).map(|i| format!("E28011700000{i:012X}")).collect();
        let mut params = HashMap::new();
        params.insert(paths::MODEL.to_string(), ParamValue::from(model));
        params.insert(paths::SOFTWARE_VERSION.to_string(), ParamValue::from("1.9.2-sim"));
        params.insert(paths::REGION.to_string(), ParamValue::from("NA"));
        params.insert(
            paths::CONNECTED_PORTS.to_string(),
            ParamValue::Ports(vec![1, 2]),
        );
        SimulatedConnector {
            model: model.to_string(),
            interval: Duration::from_millis(20),
            seed: None,
            drop_after: None,
            field: Arc::new(Field {
                population,
                params: Mutex::new(params),
                streamed: AtomicU64::new(0),
                dropped: AtomicBool::new(false),
            }),
        }
    }

    /// Pause between streamed observations (default: 20ms).
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Seed the random source so runs repeat.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Drop the link once, after `count` streamed observations.
    pub fn lose_connection_after(mut self, count: u64) -> Self {
        self.drop_after = Some(count);
        self
    }

    /// Observations streamed so far.
    pub fn streamed(&self) -> u64 {
        self.field.streamed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReaderConnector for SimulatedConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn ReaderDriver>> {
        debug!(endpoint = %endpoint, model = %self.model, "opening simulated reader");
        Ok(Box::new(SimulatedReader {
            field: self.field.clone(),
            interval: self.interval,
            seed: self.seed,
            drop_after: self.drop_after,
            connected: false,
            stream: None,
        }))
    }
}

struct Stream {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One handle to the simulated reader.
pub struct SimulatedReader {
    field: Arc<Field>,
    interval: Duration,
    seed: Option<u64>,
    drop_after: Option<u64>,
    connected: bool,
    stream: Option<Stream>,
}

impl SimulatedReader {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

fn observe(rng: &mut StdRng, epc: &str) -> TagObservation {
    let mut obs = TagObservation::new(epc);
    obs.timestamp = Utc::now();
    obs.rssi = rng.gen_range(-75..=-35);
    obs.read_count = rng.gen_range(1..=4);
    obs.antenna = rng.gen_range(1..=2);
    obs.protocol = TagProtocol::Gen2;
    obs.frequency_khz = rng.gen_range(902_750..=927_250);
    obs.phase = rng.gen_range(0..360);
    obs
}

#[async_trait]
impl ReaderDriver for SimulatedReader {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let _ = self.stop_reading().await;
        self.connected = false;
        Ok(())
    }

    async fn param_get(&mut self, path: &str) -> Result<ParamValue> {
        self.ensure_connected()?;
        self.field
            .params
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter(format!("no such parameter: {path}")))
    }

    async fn param_set(&mut self, path: &str, value: ParamValue) -> Result<()> {
        self.ensure_connected()?;
        self.field.params.lock().insert(path.to_string(), value);
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<TagObservation>> {
        self.ensure_connected()?;
        tokio::time::sleep(timeout).await;
        let mut rng = self.rng();
        let seen = rng.gen_range(0..=self.field.population.len());
        if seen == 0 {
            return Err(Error::NoTagResponse);
        }
        let picked: Vec<&String> = self
            .field
            .population
            .choose_multiple(&mut rng, seen)
            .collect();
        Ok(picked.into_iter().map(|epc| observe(&mut rng, epc)).collect())
    }

    async fn start_reading(&mut self, events: mpsc::Sender<DriverEvent>) -> Result<()> {
        self.ensure_connected()?;
        if self.stream.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(stream_tags(
            self.field.clone(),
            self.interval,
            self.drop_after,
            self.rng(),
            events,
            cancel.clone(),
        ));
        self.stream = Some(Stream { cancel, task });
        Ok(())
    }

    async fn stop_reading(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.cancel.cancel();
            let _ = stream.task.await;
        }
        Ok(())
    }

    async fn flash_firmware(&mut self, image: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        if !image.starts_with(FIRMWARE_MAGIC) {
            return Err(Error::InvalidFirmwareImage(
                "missing firmware header".into(),
            ));
        }
        // Roughly 1ms per KiB, at least 50ms.
        let millis = (image.len() as u64 / 1024).max(50);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        info!(size = image.len(), "simulated firmware flashed");
        self.connected = false;
        Ok(())
    }
}

async fn stream_tags(
    field: Arc<Field>,
    interval: Duration,
    drop_after: Option<u64>,
    mut rng: StdRng,
    events: mpsc::Sender<DriverEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {}
        }

        let event = match field.population.choose(&mut rng) {
            None => DriverEvent::ReadError(Error::NoTagResponse),
            Some(epc) => {
                let count = field.streamed.fetch_add(1, Ordering::Relaxed) + 1;
                if drop_after == Some(count) && !field.dropped.swap(true, Ordering::Relaxed) {
                    DriverEvent::ReadError(Error::ConnectionLost)
                } else {
                    DriverEvent::TagRead(observe(&mut rng, epc))
                }
            }
        };

        // A full channel must not keep the stream alive past a stop.
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            sent = events.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
