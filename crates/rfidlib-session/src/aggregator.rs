//! Tag aggregation.
//!
//! [`TagAggregator`] folds the observation stream into one record per
//! distinct tag. The key is the EPC, or the EPC plus embedded-read payload
//! when unique-by-data is on. All mutation goes through one
//! [`parking_lot::Mutex`], so `add` from the read task, `clear` from the UI,
//! and `snapshot` from the refresh timer can run concurrently.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;

use rfidlib_core::reader::TagSink;
use rfidlib_core::types::{TagObservation, TagProtocol};

use crate::clock::ElapsedClock;

/// Accumulated state for one distinct tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub epc: String,
    /// Embedded-read payload as hex, if the observation carried one.
    pub data: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Sum of the reader-reported read counts.
    pub read_count: u64,
    /// RSSI of the latest observation.
    pub rssi: i32,
    pub antenna: u8,
    pub protocol: TagProtocol,
    pub frequency_khz: u32,
    pub phase: u16,
}

impl TagRecord {
    fn from_observation(obs: &TagObservation) -> Self {
        TagRecord {
            epc: obs.epc.clone(),
            data: obs.data.as_ref().map(|_| obs.data_hex()),
            first_seen: obs.timestamp,
            last_seen: obs.timestamp,
            read_count: u64::from(obs.read_count),
            rssi: obs.rssi,
            antenna: obs.antenna,
            protocol: obs.protocol,
            frequency_khz: obs.frequency_khz,
            phase: obs.phase,
        }
    }

    fn update(&mut self, obs: &TagObservation) {
        self.last_seen = self.last_seen.max(obs.timestamp);
        self.read_count += u64::from(obs.read_count);
        self.rssi = obs.rssi;
        self.antenna = obs.antenna;
        self.protocol = obs.protocol;
        self.frequency_khz = obs.frequency_khz;
        self.phase = obs.phase;
    }
}

/// Consistent copy of the aggregate, safe to hold while reads continue.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    /// Records in first-seen order.
    pub records: Vec<TagRecord>,
    /// Observations added since the last clear.
    pub total_reads: u64,
    /// Distinct keys seen since the last clear.
    pub unique_tags: usize,
    /// Read time, excluding paused intervals.
    pub elapsed: Duration,
    /// Average observations per second over `elapsed`.
    pub read_rate: f64,
}

#[derive(Debug, Default)]
struct AggregateState {
    records: IndexMap<String, TagRecord>,
    total_reads: u64,
    unique_by_data: bool,
    clock: ElapsedClock,
}

impl AggregateState {
    fn key(&self, obs: &TagObservation) -> String {
        if self.unique_by_data {
            format!("{}:{}", obs.epc, obs.data_hex())
        } else {
            obs.epc.clone()
        }
    }
}

/// Deduplicating accumulator for tag observations.
#[derive(Debug, Default)]
pub struct TagAggregator {
    state: Mutex<AggregateState>,
}

impl TagAggregator {
    pub fn new(unique_by_data: bool) -> Self {
        TagAggregator {
            state: Mutex::new(AggregateState {
                unique_by_data,
                ..Default::default()
            }),
        }
    }

    /// Fold one observation in.
    ///
    /// The total grows by one for every call; the unique count grows only
    /// the first time a key is seen.
    pub fn add(&self, obs: &TagObservation) {
        let mut state = self.state.lock();
        let key = state.key(obs);
        state.total_reads += 1;
        match state.records.get_mut(&key) {
            Some(record) => record.update(obs),
            None => {
                state.records.insert(key, TagRecord::from_observation(obs));
            }
        }
    }

    /// Drop every record and zero the counters and the clock.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.total_reads = 0;
        state.clock.reset();
    }

    pub fn unique_by_data(&self) -> bool {
        self.state.lock().unique_by_data
    }

    /// Change the dedup key. Existing records were keyed the other way, so
    /// the store is cleared when the setting actually changes.
    pub fn set_unique_by_data(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.unique_by_data != enabled {
            state.unique_by_data = enabled;
            state.records.clear();
            state.total_reads = 0;
            state.clock.reset();
        }
    }

    pub fn total_reads(&self) -> u64 {
        self.state.lock().total_reads
    }

    pub fn unique_tags(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Start or resume the read clock.
    pub fn resume_clock(&self) {
        self.state.lock().clock.resume();
    }

    /// Pause the read clock.
    pub fn pause_clock(&self) {
        self.state.lock().clock.pause();
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().clock.elapsed()
    }

    /// Copy the current aggregate. The lock is held only for the copy.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let state = self.state.lock();
        let elapsed = state.clock.elapsed();
        let secs = elapsed.as_secs_f64();
        AggregateSnapshot {
            records: state.records.values().cloned().collect(),
            total_reads: state.total_reads,
            unique_tags: state.records.len(),
            elapsed,
            read_rate: if secs > 0.0 {
                state.total_reads as f64 / secs
            } else {
                0.0
            },
        }
    }
}

impl TagSink for TagAggregator {
    fn accept(&self, observation: &TagObservation) {
        self.add(observation);
    }
}
