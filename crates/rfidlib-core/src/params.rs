//! Reader parameter paths and values.
//!
//! Readers expose their configuration as a hierarchical key-value store
//! (`/reader/gen2/session`, `/reader/region/id`, ...). The core treats the
//! store as opaque: it only needs to know which path carries which setting
//! and how to express a value. The same paths key the persisted settings
//! map, so a saved configuration can be replayed against the device.

use std::fmt;

use crate::plan::ReadPlan;

/// Well-known parameter paths.
pub mod paths {
    /// Model string (read-only).
    pub const MODEL: &str = "/reader/version/model";
    /// Firmware version string (read-only).
    pub const SOFTWARE_VERSION: &str = "/reader/version/software";
    /// Regulatory region.
    pub const REGION: &str = "/reader/region/id";
    /// Ports with an antenna detected (read-only).
    pub const CONNECTED_PORTS: &str = "/reader/antenna/connectedPortList";
    /// Host-side transport timeout in milliseconds.
    pub const TRANSPORT_TIMEOUT: &str = "/reader/transportTimeout";
    /// Per-command timeout in milliseconds.
    pub const COMMAND_TIMEOUT: &str = "/reader/commandTimeout";
    /// Active read plan.
    pub const READ_PLAN: &str = "/reader/read/plan";
    /// Gen2 inventory session.
    pub const GEN2_SESSION: &str = "/reader/gen2/session";
    /// Gen2 inventory target.
    pub const GEN2_TARGET: &str = "/reader/gen2/target";
    /// Gen2 Q algorithm.
    pub const GEN2_Q: &str = "/reader/gen2/q";
    /// Gen2 Tari.
    pub const GEN2_TARI: &str = "/reader/gen2/tari";
    /// Gen2 backscatter link frequency.
    pub const GEN2_BLF: &str = "/reader/gen2/BLF";
    /// Gen2 tag encoding.
    pub const GEN2_TAG_ENCODING: &str = "/reader/gen2/tagEncoding";
    /// Whether the reader reports EPC+data pairs as distinct tags.
    pub const UNIQUE_BY_DATA: &str = "/reader/tagReadData/uniqueByData";

    // Host-side selections persisted alongside the device parameters. They
    // are never written to the reader; the plan built from them is.

    /// Selected protocols, comma separated.
    pub const PLAN_PROTOCOLS: &str = "/reader/read/plan/protocols";
    /// Selected antenna ports, comma separated.
    pub const PLAN_ANTENNAS: &str = "/reader/read/plan/antennas";
    /// Fast search flag.
    pub const PLAN_FAST_SEARCH: &str = "/reader/read/plan/fastSearch";
}

/// A value read from or written to a parameter path.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer (timeouts, counts).
    Int(i64),
    /// Text, including enumerated values in their canonical spelling.
    Text(String),
    /// List of antenna ports.
    Ports(Vec<u8>),
    /// A complete read plan.
    Plan(ReadPlan),
}

impl ParamValue {
    /// The value as text, if it is [`ParamValue::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an integer, if it is [`ParamValue::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The value as a boolean, if it is [`ParamValue::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as a port list, if it is [`ParamValue::Ports`].
    pub fn as_ports(&self) -> Option<&[u8]> {
        match self {
            ParamValue::Ports(p) => Some(p),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Int(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(n) => write!(f, "{n}"),
            ParamValue::Text(s) => write!(f, "{s}"),
            ParamValue::Ports(p) => {
                let parts: Vec<String> = p.iter().map(u8::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
            ParamValue::Plan(plan) => write!(f, "{plan}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_match_variant() {
        assert_eq!(ParamValue::from("NA").as_text(), Some("NA"));
        assert_eq!(ParamValue::from(250_i64).as_int(), Some(250));
        assert_eq!(ParamValue::from(true).as_bool(), Some(true));
        assert_eq!(ParamValue::Ports(vec![1, 2]).as_ports(), Some(&[1u8, 2][..]));
        assert_eq!(ParamValue::from(true).as_text(), None);
    }

    #[test]
    fn ports_display_comma_separated() {
        assert_eq!(ParamValue::Ports(vec![1, 3, 4]).to_string(), "1,3,4");
    }
}
