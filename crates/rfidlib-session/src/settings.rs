//! Persisted reader settings.
//!
//! Settings are stored as a flat map of strings keyed by the same parameter
//! paths the reader uses, so a saved configuration reads like a dump of the
//! device. Loading never fails: a value that does not parse falls back to
//! its default and is reported as a [`SettingWarning`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use rfidlib_core::error::Result;
use rfidlib_core::gen2::{
    Gen2Session, Gen2Target, LinkFrequency, QAlgorithm, Tari, TagEncoding, TuningSettings,
};
use rfidlib_core::params::paths;
use rfidlib_core::plan::{ReadPlan, ReadPlanBuilder, ReadPlanRequest};
use rfidlib_core::types::{Region, TagProtocol};

use crate::controller::SessionController;

/// Flat key/value form of the settings.
pub type Properties = BTreeMap<String, String>;

/// Value written for an unset optional link parameter.
const AUTO: &str = "AUTO";

/// A stored value that was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingWarning {
    pub key: String,
    pub value: String,
    /// What is used instead.
    pub fallback: String,
}

impl fmt::Display for SettingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: invalid value {:?}, using {}",
            self.key, self.value, self.fallback
        )
    }
}

/// Everything a session needs to reproduce a reader configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSettings {
    /// Region to apply; `None` keeps the reader's own.
    pub region: Option<Region>,
    pub transport_timeout: Duration,
    /// Length of a single-shot read.
    pub read_timeout: Duration,
    pub protocols: Vec<TagProtocol>,
    pub antennas: Vec<u8>,
    pub fast_search: bool,
    pub unique_by_data: bool,
    pub tuning: TuningSettings,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        ReaderSettings {
            region: None,
            transport_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(500),
            protocols: vec![TagProtocol::Gen2],
            antennas: vec![1],
            fast_search: false,
            unique_by_data: false,
            tuning: TuningSettings::default(),
        }
    }
}

/// Collects fallbacks while parsing.
struct Loader<'a> {
    props: &'a Properties,
    warnings: Vec<SettingWarning>,
}

impl Loader<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(|v| v.trim())
    }

    fn reject(&mut self, key: &str, value: &str, fallback: String) {
        warn!(key, value, fallback = %fallback, "ignoring invalid setting");
        self.warnings.push(SettingWarning {
            key: key.to_string(),
            value: value.to_string(),
            fallback,
        });
    }

    /// Parse `key`, keeping `default` when absent or invalid.
    fn value<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr + fmt::Display,
    {
        let Some(raw) = self.raw(key) else {
            debug!(key, default = %default, "setting absent, using default");
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                let raw = raw.to_string();
                self.reject(key, &raw, default.to_string());
                default
            }
        }
    }

    /// Parse an optional link parameter; absent, empty and `AUTO` mean unset.
    fn optional<T: FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = self.raw(key)?;
        if raw.is_empty() || raw.eq_ignore_ascii_case(AUTO) {
            return None;
        }
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                let raw = raw.to_string();
                self.reject(key, &raw, AUTO.to_string());
                None
            }
        }
    }

    fn millis(&mut self, key: &str, default: Duration) -> Duration {
        let ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        match self.value(key, ms) {
            0 => {
                self.reject(key, "0", format!("{ms}"));
                default
            }
            ms => Duration::from_millis(ms),
        }
    }

    /// Parse a comma separated, non-empty list.
    fn list<T>(&mut self, key: &str, default: Vec<T>) -> Vec<T>
    where
        T: FromStr + fmt::Display,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        let parsed: std::result::Result<Vec<T>, _> = raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse)
            .collect();
        match parsed {
            Ok(items) if !items.is_empty() => items,
            _ => {
                let raw = raw.to_string();
                self.reject(key, &raw, join(&default));
                default
            }
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl ReaderSettings {
    /// Load from stored properties. Never fails; see the returned warnings
    /// for anything that was ignored.
    pub fn from_properties(props: &Properties) -> (ReaderSettings, Vec<SettingWarning>) {
        let defaults = ReaderSettings::default();
        let mut loader = Loader {
            props,
            warnings: Vec::new(),
        };

        let region = match loader.value(paths::REGION, Region::Unspecified) {
            Region::Unspecified => None,
            region => Some(region),
        };

        let mut q = loader.value(paths::GEN2_Q, QAlgorithm::Dynamic);
        if let QAlgorithm::Static(n) = q {
            if n > rfidlib_core::gen2::MAX_STATIC_Q {
                loader.reject(paths::GEN2_Q, &q.to_string(), QAlgorithm::Dynamic.to_string());
                q = QAlgorithm::Dynamic;
            }
        }

        let tuning = TuningSettings {
            session: loader.value(paths::GEN2_SESSION, Gen2Session::default()),
            target: loader.value(paths::GEN2_TARGET, Gen2Target::default()),
            q,
            tari: loader.optional::<Tari>(paths::GEN2_TARI),
            link_frequency: loader.optional::<LinkFrequency>(paths::GEN2_BLF),
            tag_encoding: loader.optional::<TagEncoding>(paths::GEN2_TAG_ENCODING),
        };

        let mut antennas = loader.list(paths::PLAN_ANTENNAS, defaults.antennas.clone());
        if antennas.contains(&0) {
            let raw = join(&antennas);
            loader.reject(paths::PLAN_ANTENNAS, &raw, join(&defaults.antennas));
            antennas = defaults.antennas.clone();
        }

        let settings = ReaderSettings {
            region,
            transport_timeout: loader.millis(paths::TRANSPORT_TIMEOUT, defaults.transport_timeout),
            read_timeout: loader.millis(paths::COMMAND_TIMEOUT, defaults.read_timeout),
            protocols: loader.list(paths::PLAN_PROTOCOLS, defaults.protocols.clone()),
            antennas,
            fast_search: loader.value(paths::PLAN_FAST_SEARCH, defaults.fast_search),
            unique_by_data: loader.value(paths::UNIQUE_BY_DATA, defaults.unique_by_data),
            tuning,
        };
        (settings, loader.warnings)
    }

    /// Store form. Loading the result gives back `self` with no warnings.
    pub fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        let mut put = |key: &str, value: String| {
            props.insert(key.to_string(), value);
        };

        put(
            paths::REGION,
            self.region.unwrap_or(Region::Unspecified).to_string(),
        );
        put(
            paths::TRANSPORT_TIMEOUT,
            self.transport_timeout.as_millis().to_string(),
        );
        put(paths::COMMAND_TIMEOUT, self.read_timeout.as_millis().to_string());
        put(paths::PLAN_PROTOCOLS, join(&self.protocols));
        put(paths::PLAN_ANTENNAS, join(&self.antennas));
        put(paths::PLAN_FAST_SEARCH, self.fast_search.to_string());
        put(paths::UNIQUE_BY_DATA, self.unique_by_data.to_string());
        put(paths::GEN2_SESSION, self.tuning.session.to_string());
        put(paths::GEN2_TARGET, self.tuning.target.to_string());
        put(paths::GEN2_Q, self.tuning.q.to_string());
        let or_auto = |v: Option<String>| v.unwrap_or_else(|| AUTO.to_string());
        put(paths::GEN2_TARI, or_auto(self.tuning.tari.map(|t| t.to_string())));
        put(
            paths::GEN2_BLF,
            or_auto(self.tuning.link_frequency.map(|f| f.to_string())),
        );
        put(
            paths::GEN2_TAG_ENCODING,
            or_auto(self.tuning.tag_encoding.map(|e| e.to_string())),
        );
        props
    }

    /// The plan request these settings describe.
    pub fn plan_request(&self) -> ReadPlanRequest {
        let mut request = ReadPlanRequest::new(&self.protocols, &self.antennas);
        request.fast_search = self.fast_search;
        request
    }

    /// Switch the reader to the stored region, if any, then build the plan
    /// through `builder` and push it, with the tuning, to the connected
    /// reader. Returns the plan that is now in effect.
    pub async fn apply(
        &self,
        session: &SessionController,
        builder: &mut ReadPlanBuilder,
    ) -> Result<ReadPlan> {
        let mut tuning = self.tuning.clone();
        let plan = builder.build(&self.plan_request(), &mut tuning)?;
        if let Some(region) = self.region {
            session.set_region(region).await?;
        }
        session.set_unique_by_data(self.unique_by_data).await?;
        session.apply_read_plan(&plan, &tuning).await?;
        Ok(plan)
    }
}

/// The seam to wherever settings are persisted.
pub trait PropertyStore: Send + Sync {
    fn load(&self) -> Result<Properties>;
    fn save(&self, props: &Properties) -> Result<()>;
}

/// In-memory [`PropertyStore`].
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    props: Mutex<Properties>,
}

impl MemoryPropertyStore {
    pub fn new(props: Properties) -> Self {
        MemoryPropertyStore {
            props: Mutex::new(props),
        }
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn load(&self) -> Result<Properties> {
        Ok(self.props.lock().clone())
    }

    fn save(&self, props: &Properties) -> Result<()> {
        *self.props.lock() = props.clone();
        Ok(())
    }
}
