//! Gen2 link and inventory tuning.
//!
//! [`TuningSettings`] collects the Gen2 parameters a user can change
//! (session, target, Q, Tari, link frequency, encoding) and checks them
//! against a model's [`ReaderCapabilities`] before they reach the device.
//! Invalid combinations are rejected with a descriptive error; nothing is
//! clamped silently.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::ReaderCapabilities;
use crate::params::{ParamValue, paths};
use crate::types::ParseValueError;

/// Gen2 inventory session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Gen2Session {
    #[default]
    S0,
    S1,
    S2,
    S3,
}

impl fmt::Display for Gen2Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gen2Session::S0 => "S0",
            Gen2Session::S1 => "S1",
            Gen2Session::S2 => "S2",
            Gen2Session::S3 => "S3",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Gen2Session {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "S0" => Ok(Gen2Session::S0),
            "S1" => Ok(Gen2Session::S1),
            "S2" => Ok(Gen2Session::S2),
            "S3" => Ok(Gen2Session::S3),
            _ => Err(ParseValueError::new("session", s)),
        }
    }
}

/// Gen2 inventory target (which inventoried flag state is singulated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Gen2Target {
    #[default]
    A,
    B,
    /// Alternate A then B; what fast search forces.
    AB,
    BA,
}

impl fmt::Display for Gen2Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gen2Target::A => "A",
            Gen2Target::B => "B",
            Gen2Target::AB => "AB",
            Gen2Target::BA => "BA",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Gen2Target {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(Gen2Target::A),
            "B" => Ok(Gen2Target::B),
            "AB" => Ok(Gen2Target::AB),
            "BA" => Ok(Gen2Target::BA),
            _ => Err(ParseValueError::new("target", s)),
        }
    }
}

/// Reader-to-tag data-0 symbol length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tari {
    Us25,
    Us12_5,
    Us6_25,
}

impl fmt::Display for Tari {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tari::Us25 => "TARI_25US",
            Tari::Us12_5 => "TARI_12_5US",
            Tari::Us6_25 => "TARI_6_25US",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Tari {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "TARI_25US" | "25" => Ok(Tari::Us25),
            "TARI_12_5US" | "12.5" => Ok(Tari::Us12_5),
            "TARI_6_25US" | "6.25" => Ok(Tari::Us6_25),
            _ => Err(ParseValueError::new("tari", s)),
        }
    }
}

/// Backscatter link frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkFrequency {
    Khz250,
    Khz640,
}

impl LinkFrequency {
    /// Frequency in kHz, the unit the device parameter uses.
    pub fn khz(self) -> i64 {
        match self {
            LinkFrequency::Khz250 => 250,
            LinkFrequency::Khz640 => 640,
        }
    }
}

impl fmt::Display for LinkFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LINK{}KHZ", self.khz())
    }
}

impl FromStr for LinkFrequency {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LINK250KHZ" | "250" => Ok(LinkFrequency::Khz250),
            "LINK640KHZ" | "640" => Ok(LinkFrequency::Khz640),
            _ => Err(ParseValueError::new("link frequency", s)),
        }
    }
}

/// Tag-to-reader encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagEncoding {
    Fm0,
    M2,
    M4,
    M8,
}

impl fmt::Display for TagEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TagEncoding::Fm0 => "FM0",
            TagEncoding::M2 => "M2",
            TagEncoding::M4 => "M4",
            TagEncoding::M8 => "M8",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TagEncoding {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FM0" => Ok(TagEncoding::Fm0),
            "M2" => Ok(TagEncoding::M2),
            "M4" => Ok(TagEncoding::M4),
            "M8" => Ok(TagEncoding::M8),
            _ => Err(ParseValueError::new("tag encoding", s)),
        }
    }
}

/// Largest legal static Q.
pub const MAX_STATIC_Q: u8 = 15;

/// Gen2 Q algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QAlgorithm {
    /// The reader adapts Q to the tag population.
    #[default]
    Dynamic,
    /// Fixed slot count 2^Q, Q in 0..=15.
    Static(u8),
}

impl fmt::Display for QAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QAlgorithm::Dynamic => write!(f, "DYNAMIC"),
            QAlgorithm::Static(q) => write!(f, "STATIC({q})"),
        }
    }
}

impl FromStr for QAlgorithm {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let t = s.trim().to_uppercase();
        if t == "DYNAMIC" {
            return Ok(QAlgorithm::Dynamic);
        }
        t.strip_prefix("STATIC(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|n| n.trim().parse::<u8>().ok())
            .map(QAlgorithm::Static)
            .ok_or_else(|| ParseValueError::new("Q algorithm", s))
    }
}

/// Gen2 tuning applied together with a read plan.
///
/// `None` for the model-specific link parameters leaves the device's own
/// setting untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TuningSettings {
    pub session: Gen2Session,
    pub target: Gen2Target,
    pub q: QAlgorithm,
    pub tari: Option<Tari>,
    pub link_frequency: Option<LinkFrequency>,
    pub tag_encoding: Option<TagEncoding>,
}

impl TuningSettings {
    /// Check these settings against what `caps` allows.
    pub fn validate(&self, caps: &ReaderCapabilities) -> Result<()> {
        if let QAlgorithm::Static(q) = self.q {
            if q > MAX_STATIC_Q {
                return Err(Error::InvalidParameter(format!(
                    "static Q must be 0..={MAX_STATIC_Q}, got {q}"
                )));
            }
        }

        if let Some(tari) = self.tari {
            if !caps.supports_tari {
                return Err(Error::unsupported(
                    paths::GEN2_TARI,
                    format!("{tari} requested but this model has a fixed Tari"),
                ));
            }
        }

        if let Some(blf) = self.link_frequency {
            if !caps.link_frequencies.contains(&blf) {
                return Err(Error::unsupported(
                    paths::GEN2_BLF,
                    format!("{blf} is not available on this model"),
                ));
            }
        }

        if let Some(encoding) = self.tag_encoding {
            if !caps.tag_encodings.contains(&encoding) {
                return Err(Error::unsupported(
                    paths::GEN2_TAG_ENCODING,
                    format!("{encoding} is not available on this model"),
                ));
            }
        }

        // 640 kHz backscatter only works with FM0 and the shortest Tari.
        if self.link_frequency == Some(LinkFrequency::Khz640) {
            if let Some(encoding) = self.tag_encoding.filter(|e| *e != TagEncoding::Fm0) {
                return Err(Error::unsupported(
                    paths::GEN2_TAG_ENCODING,
                    format!("{encoding} cannot be combined with LINK640KHZ (FM0 required)"),
                ));
            }
            if let Some(tari) = self.tari.filter(|t| *t != Tari::Us6_25) {
                return Err(Error::unsupported(
                    paths::GEN2_TARI,
                    format!("{tari} cannot be combined with LINK640KHZ (TARI_6_25US required)"),
                ));
            }
        }

        Ok(())
    }

    /// The same settings with the model-specific link parameters cleared.
    ///
    /// This is the configuration to retry with after the device rejects a
    /// link parameter.
    pub fn reduced(&self) -> TuningSettings {
        TuningSettings {
            tari: None,
            link_frequency: None,
            tag_encoding: None,
            ..self.clone()
        }
    }

    /// Parameter writes that apply these settings, in push order.
    ///
    /// Link frequency precedes Tari and encoding so the device never sees
    /// an intermediate illegal combination when moving to 640 kHz.
    pub fn to_params(&self) -> Vec<(&'static str, ParamValue)> {
        let mut params = vec![
            (paths::GEN2_SESSION, ParamValue::from(self.session.to_string())),
            (paths::GEN2_TARGET, ParamValue::from(self.target.to_string())),
            (paths::GEN2_Q, ParamValue::from(self.q.to_string())),
        ];
        if let Some(blf) = self.link_frequency {
            params.push((paths::GEN2_BLF, ParamValue::Int(blf.khz())));
        }
        if let Some(tari) = self.tari {
            params.push((paths::GEN2_TARI, ParamValue::from(tari.to_string())));
        }
        if let Some(encoding) = self.tag_encoding {
            params.push((paths::GEN2_TAG_ENCODING, ParamValue::from(encoding.to_string())));
        }
        params
    }
}

impl fmt::Display for TuningSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session={} target={} q={}", self.session, self.target, self.q)?;
        if let Some(blf) = self.link_frequency {
            write!(f, " blf={blf}")?;
        }
        if let Some(tari) = self.tari {
            write!(f, " tari={tari}")?;
        }
        if let Some(encoding) = self.tag_encoding {
            write!(f, " encoding={encoding}")?;
        }
        Ok(())
    }
}

/// Remembers the Gen2 target that fast search overrode.
///
/// Enabling fast search forces [`Gen2Target::AB`]; disabling it restores
/// whatever target was active right before it was enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastSearchState {
    saved_target: Option<Gen2Target>,
}

impl FastSearchState {
    /// Whether fast search is currently forcing the target.
    pub fn is_active(&self) -> bool {
        self.saved_target.is_some()
    }

    /// Bring `tuning` in line with the requested fast-search flag.
    pub fn sync(&mut self, enabled: bool, tuning: &mut TuningSettings) {
        match (enabled, self.saved_target) {
            (true, None) => {
                self.saved_target = Some(tuning.target);
                tuning.target = Gen2Target::AB;
            }
            (false, Some(previous)) => {
                tuning.target = previous;
                self.saved_target = None;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{m6e, m6e_nano};

    #[test]
    fn q_parse_and_display() {
        assert_eq!("dynamic".parse::<QAlgorithm>().unwrap(), QAlgorithm::Dynamic);
        assert_eq!("STATIC(4)".parse::<QAlgorithm>().unwrap(), QAlgorithm::Static(4));
        assert_eq!(QAlgorithm::Static(7).to_string(), "STATIC(7)");
        assert!("STATIC(x)".parse::<QAlgorithm>().is_err());
    }

    #[test]
    fn static_q_above_fifteen_rejected() {
        let tuning = TuningSettings {
            q: QAlgorithm::Static(16),
            ..Default::default()
        };
        let err = tuning.validate(&m6e().capabilities).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn static_q_fifteen_accepted() {
        let tuning = TuningSettings {
            q: QAlgorithm::Static(15),
            ..Default::default()
        };
        assert!(tuning.validate(&m6e().capabilities).is_ok());
    }

    #[test]
    fn tari_on_fixed_tari_model_is_unsupported() {
        let tuning = TuningSettings {
            tari: Some(Tari::Us25),
            ..Default::default()
        };
        let err = tuning.validate(&m6e_nano().capabilities).unwrap_err();
        match err {
            Error::UnsupportedConfiguration { param, .. } => {
                assert_eq!(param, paths::GEN2_TARI);
            }
            other => panic!("expected UnsupportedConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn link_640_requires_fm0() {
        let tuning = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz640),
            tag_encoding: Some(TagEncoding::M4),
            ..Default::default()
        };
        let err = tuning.validate(&m6e().capabilities).unwrap_err();
        assert!(err.to_string().contains("FM0 required"));
    }

    #[test]
    fn link_640_requires_short_tari() {
        let tuning = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz640),
            tari: Some(Tari::Us25),
            ..Default::default()
        };
        assert!(tuning.validate(&m6e().capabilities).is_err());

        let ok = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz640),
            tari: Some(Tari::Us6_25),
            tag_encoding: Some(TagEncoding::Fm0),
            ..Default::default()
        };
        assert!(ok.validate(&m6e().capabilities).is_ok());
    }

    #[test]
    fn reduced_passes_on_restrictive_model() {
        let tuning = TuningSettings {
            session: Gen2Session::S1,
            tari: Some(Tari::Us12_5),
            link_frequency: Some(LinkFrequency::Khz640),
            tag_encoding: Some(TagEncoding::Fm0),
            ..Default::default()
        };
        assert!(tuning.validate(&m6e_nano().capabilities).is_err());
        let reduced = tuning.reduced();
        assert_eq!(reduced.session, Gen2Session::S1);
        assert!(reduced.validate(&m6e_nano().capabilities).is_ok());
    }

    #[test]
    fn to_params_orders_blf_first_among_link_params() {
        let tuning = TuningSettings {
            link_frequency: Some(LinkFrequency::Khz640),
            tari: Some(Tari::Us6_25),
            tag_encoding: Some(TagEncoding::Fm0),
            ..Default::default()
        };
        let keys: Vec<&str> = tuning.to_params().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec![
                paths::GEN2_SESSION,
                paths::GEN2_TARGET,
                paths::GEN2_Q,
                paths::GEN2_BLF,
                paths::GEN2_TARI,
                paths::GEN2_TAG_ENCODING,
            ]
        );
    }

    #[test]
    fn fast_search_toggle_restores_every_target() {
        for target in [Gen2Target::A, Gen2Target::B, Gen2Target::AB, Gen2Target::BA] {
            let mut tuning = TuningSettings {
                target,
                ..Default::default()
            };
            let mut fast = FastSearchState::default();

            fast.sync(true, &mut tuning);
            assert_eq!(tuning.target, Gen2Target::AB);
            assert!(fast.is_active());

            fast.sync(false, &mut tuning);
            assert_eq!(tuning.target, target);
            assert!(!fast.is_active());
        }
    }

    #[test]
    fn fast_search_enable_twice_keeps_original() {
        let mut tuning = TuningSettings {
            target: Gen2Target::B,
            ..Default::default()
        };
        let mut fast = FastSearchState::default();
        fast.sync(true, &mut tuning);
        fast.sync(true, &mut tuning);
        fast.sync(false, &mut tuning);
        assert_eq!(tuning.target, Gen2Target::B);
    }
}
