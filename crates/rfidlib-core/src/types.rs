//! Core types used throughout rfidlib.
//!
//! These types describe what a reader observes and how it is addressed,
//! independent of the driver (serial, RQL, LLRP) that produced them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Air-interface protocol a tag was inventoried with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagProtocol {
    /// EPC UHF Class 1 Generation 2.
    Gen2,
    /// ISO 18000-6B.
    Iso180006b,
    /// IPICO 64-bit.
    Ipx64,
    /// IPICO 256-bit.
    Ipx256,
    /// American Trucking Association tags.
    Ata,
}

impl TagProtocol {
    /// Every protocol, in display order.
    pub const ALL: [TagProtocol; 5] = [
        TagProtocol::Gen2,
        TagProtocol::Iso180006b,
        TagProtocol::Ipx64,
        TagProtocol::Ipx256,
        TagProtocol::Ata,
    ];
}

impl fmt::Display for TagProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TagProtocol::Gen2 => "GEN2",
            TagProtocol::Iso180006b => "ISO180006B",
            TagProtocol::Ipx64 => "IPX64",
            TagProtocol::Ipx256 => "IPX256",
            TagProtocol::Ata => "ATA",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string names no known enumeration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseValueError {
    /// What was being parsed (e.g. "protocol").
    pub what: &'static str,
    /// The rejected input.
    pub input: String,
}

impl ParseValueError {
    pub(crate) fn new(what: &'static str, input: &str) -> Self {
        ParseValueError {
            what,
            input: input.to_string(),
        }
    }
}

impl fmt::Display for ParseValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.what, self.input)
    }
}

impl std::error::Error for ParseValueError {}

impl FromStr for TagProtocol {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "GEN2" => Ok(TagProtocol::Gen2),
            "ISO180006B" | "ISO18K6B" => Ok(TagProtocol::Iso180006b),
            "IPX64" => Ok(TagProtocol::Ipx64),
            "IPX256" => Ok(TagProtocol::Ipx256),
            "ATA" => Ok(TagProtocol::Ata),
            _ => Err(ParseValueError::new("protocol", s)),
        }
    }
}

/// Gen2 tag memory bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryBank {
    /// Kill and access passwords.
    Reserved,
    /// CRC, PC word, and EPC.
    Epc,
    /// Tag identifier (manufacturer, model, serial).
    Tid,
    /// User memory.
    User,
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryBank::Reserved => "RESERVED",
            MemoryBank::Epc => "EPC",
            MemoryBank::Tid => "TID",
            MemoryBank::User => "USER",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MemoryBank {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RESERVED" => Ok(MemoryBank::Reserved),
            "EPC" => Ok(MemoryBank::Epc),
            "TID" => Ok(MemoryBank::Tid),
            "USER" => Ok(MemoryBank::User),
            _ => Err(ParseValueError::new("memory bank", s)),
        }
    }
}

/// Regulatory region the reader operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// The reader has not been assigned a region.
    Unspecified,
    /// North America (FCC).
    Na,
    /// European Union (ETSI EN 302 208).
    Eu3,
    /// India.
    In,
    /// Japan.
    Jp,
    /// People's Republic of China.
    Prc,
    /// Korea.
    Kr2,
    /// Australia.
    Au,
    /// New Zealand.
    Nz,
    /// Unrestricted (lab use).
    Open,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Region::Unspecified => "UNSPEC",
            Region::Na => "NA",
            Region::Eu3 => "EU3",
            Region::In => "IN",
            Region::Jp => "JP",
            Region::Prc => "PRC",
            Region::Kr2 => "KR2",
            Region::Au => "AU",
            Region::Nz => "NZ",
            Region::Open => "OPEN",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Region {
    type Err = ParseValueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "UNSPEC" | "" => Ok(Region::Unspecified),
            "NA" => Ok(Region::Na),
            "EU3" => Ok(Region::Eu3),
            "IN" => Ok(Region::In),
            "JP" => Ok(Region::Jp),
            "PRC" => Ok(Region::Prc),
            "KR2" => Ok(Region::Kr2),
            "AU" => Ok(Region::Au),
            "NZ" => Ok(Region::Nz),
            "OPEN" => Ok(Region::Open),
            _ => Err(ParseValueError::new("region", s)),
        }
    }
}

/// One tag observation produced by the driver.
///
/// Immutable once produced; consumed by the aggregator and the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct TagObservation {
    /// EPC as uppercase hex.
    pub epc: String,
    /// When the reader saw the tag.
    pub timestamp: DateTime<Utc>,
    /// Received signal strength in dBm.
    pub rssi: i32,
    /// How many times the tag was seen in this report.
    pub read_count: u32,
    /// Antenna port the tag was seen on.
    pub antenna: u8,
    /// Protocol the tag answered with.
    pub protocol: TagProtocol,
    /// Carrier frequency in kHz.
    pub frequency_khz: u32,
    /// Backscatter phase in degrees.
    pub phase: u16,
    /// Payload of the embedded read operation, if the plan had one.
    pub data: Option<Vec<u8>>,
}

impl TagObservation {
    /// Create a Gen2 observation seen once on antenna 1, stamped now.
    pub fn new(epc: impl Into<String>) -> Self {
        TagObservation {
            epc: epc.into(),
            timestamp: Utc::now(),
            rssi: 0,
            read_count: 1,
            antenna: 1,
            protocol: TagProtocol::Gen2,
            frequency_khz: 0,
            phase: 0,
            data: None,
        }
    }

    /// Embedded payload rendered as uppercase hex, empty if absent.
    pub fn data_hex(&self) -> String {
        self.data.as_deref().map(bytes_to_hex).unwrap_or_default()
    }
}

/// Render bytes as contiguous uppercase hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Information read from the reader at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Model string as reported by the reader.
    pub model: String,
    /// Firmware/software version string.
    pub software_version: String,
    /// Region the reader is operating in.
    pub region: Region,
    /// Antenna ports with something attached.
    pub connected_ports: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips_through_display() {
        for p in TagProtocol::ALL {
            assert_eq!(p.to_string().parse::<TagProtocol>().unwrap(), p);
        }
    }

    #[test]
    fn protocol_parse_is_case_insensitive() {
        assert_eq!("gen2".parse::<TagProtocol>().unwrap(), TagProtocol::Gen2);
        assert_eq!(
            "iso18k6b".parse::<TagProtocol>().unwrap(),
            TagProtocol::Iso180006b
        );
    }

    #[test]
    fn protocol_parse_rejects_unknown() {
        let err = "UHF9".parse::<TagProtocol>().unwrap_err();
        assert_eq!(err.to_string(), "unknown protocol: UHF9");
    }

    #[test]
    fn region_parse() {
        assert_eq!("na".parse::<Region>().unwrap(), Region::Na);
        assert_eq!("UNSPEC".parse::<Region>().unwrap(), Region::Unspecified);
        assert!("MARS".parse::<Region>().is_err());
    }

    #[test]
    fn memory_bank_parse() {
        assert_eq!("tid".parse::<MemoryBank>().unwrap(), MemoryBank::Tid);
        assert!("bank9".parse::<MemoryBank>().is_err());
    }

    #[test]
    fn data_hex_renders_payload() {
        let mut obs = TagObservation::new("E2001234");
        assert_eq!(obs.data_hex(), "");
        obs.data = Some(vec![0xAB, 0x01]);
        assert_eq!(obs.data_hex(), "AB01");
    }
}
