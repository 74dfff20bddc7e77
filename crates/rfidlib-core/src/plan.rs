//! Read plans and the builder that produces them from user selections.
//!
//! A [`ReadPlan`] is an ordered list of per-protocol [`SubPlan`]s. Plans are
//! immutable once built; any configuration change builds a new one.
//!
//! Selections arrive as text (start addresses, filter data) the way a user
//! typed them. Numbers accept decimal or `0x`-prefixed hex. Filter data is
//! hex; an odd trailing nibble is packed into the high half of a final byte.

use std::fmt;

use crate::error::{Error, Result, ValidationError};
use crate::gen2::{FastSearchState, TuningSettings};
use crate::models::ReaderCapabilities;
use crate::params::paths;
use crate::types::{MemoryBank, TagProtocol, bytes_to_hex};

/// Tag-selection filter applied before inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub bank: MemoryBank,
    /// Bit address the comparison starts at.
    pub start_bit: u32,
    /// Packed mask bytes.
    pub mask: Vec<u8>,
    /// Number of significant bits in `mask`.
    pub bit_length: u32,
    /// Select tags that do *not* match.
    pub invert: bool,
}

/// Memory read performed on every singulated tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedRead {
    pub bank: MemoryBank,
    pub start_word: u32,
    /// Words to read; 0 reads the whole bank.
    pub word_count: u8,
}

/// Inventory settings for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPlan {
    pub protocol: TagProtocol,
    /// Antenna ports, never empty.
    pub antennas: Vec<u8>,
    pub embedded: Option<EmbeddedRead>,
    pub filter: Option<TagFilter>,
    pub fast_search: bool,
}

/// A complete read plan, at most one sub-plan per protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    sub_plans: Vec<SubPlan>,
}

impl ReadPlan {
    pub fn sub_plans(&self) -> &[SubPlan] {
        &self.sub_plans
    }

    /// Sub-plan for `protocol`, if the plan covers it.
    pub fn sub_plan(&self, protocol: TagProtocol) -> Option<&SubPlan> {
        self.sub_plans.iter().find(|s| s.protocol == protocol)
    }

    pub fn protocols(&self) -> Vec<TagProtocol> {
        self.sub_plans.iter().map(|s| s.protocol).collect()
    }

    /// Whether any sub-plan asks for fast search.
    pub fn fast_search(&self) -> bool {
        self.sub_plans.iter().any(|s| s.fast_search)
    }

    /// Check the plan against what the connected model offers.
    pub fn check_capabilities(&self, caps: &ReaderCapabilities) -> Result<()> {
        for sub in &self.sub_plans {
            if !caps.protocols.contains(&sub.protocol) {
                return Err(Error::unsupported(
                    paths::READ_PLAN,
                    format!("protocol {} is not supported by this model", sub.protocol),
                ));
            }
            if let Some(port) = sub.antennas.iter().find(|a| !caps.antenna_ports.contains(a)) {
                return Err(Error::unsupported(
                    paths::READ_PLAN,
                    format!("antenna port {port} does not exist on this model"),
                ));
            }
            if sub.fast_search && !caps.supports_fast_search {
                return Err(Error::unsupported(
                    paths::READ_PLAN,
                    "fast search is not supported by this model",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ReadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, sub) in self.sub_plans.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            let ports: Vec<String> = sub.antennas.iter().map(u8::to_string).collect();
            write!(f, "{}[{}]", sub.protocol, ports.join(","))?;
            if let Some(filter) = &sub.filter {
                write!(
                    f,
                    " filter={}{}@{}:{}/{}",
                    if filter.invert { "!" } else { "" },
                    filter.bank,
                    filter.start_bit,
                    bytes_to_hex(&filter.mask),
                    filter.bit_length
                )?;
            }
            if let Some(embedded) = &sub.embedded {
                write!(
                    f,
                    " read={}@{}x{}",
                    embedded.bank, embedded.start_word, embedded.word_count
                )?;
            }
            if sub.fast_search {
                write!(f, " fast")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// User selections
// ---------------------------------------------------------------------------

/// Filter as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub bank: MemoryBank,
    /// Start bit address, decimal or `0x` hex.
    pub start_address: String,
    /// Mask data in hex, optional `0x` prefix.
    pub data: String,
    pub invert: bool,
}

/// Embedded read as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedReadSpec {
    pub bank: MemoryBank,
    /// Start word address, decimal or `0x` hex.
    pub start_address: String,
    /// Word count, decimal or `0x` hex.
    pub word_count: String,
}

/// Everything the user selected for the next read plan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadPlanRequest {
    pub protocols: Vec<TagProtocol>,
    pub antennas: Vec<u8>,
    pub filter: Option<FilterSpec>,
    pub embedded: Option<EmbeddedReadSpec>,
    pub fast_search: bool,
}

impl ReadPlanRequest {
    /// A request for `protocols` on `antennas` with no filter or embedded read.
    pub fn new(protocols: &[TagProtocol], antennas: &[u8]) -> Self {
        ReadPlanRequest {
            protocols: protocols.to_vec(),
            antennas: antennas.to_vec(),
            ..Default::default()
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(field: &'static str, text: &str) -> std::result::Result<u32, ValidationError> {
    let t = text.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => t.parse::<u32>(),
    };
    parsed.map_err(|_| ValidationError::InvalidNumericFormat {
        field,
        value: text.to_string(),
    })
}

/// Parse hex filter data into packed bytes and a bit length.
///
/// An odd number of nibbles leaves the last digit in the high half of the
/// final byte: `"ABC"` becomes `[0xAB, 0xC0]` with 12 significant bits.
pub fn parse_hex_data(
    field: &'static str,
    text: &str,
) -> std::result::Result<(Vec<u8>, u32), ValidationError> {
    let t = text.trim();
    let digits = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t);
    let invalid = || ValidationError::InvalidHexData {
        field,
        value: text.to_string(),
    };

    let nibbles = digits
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(invalid)?;
    if nibbles.is_empty() {
        return Err(invalid());
    }

    let bytes = nibbles
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => (hi << 4) | lo,
            [last] => last << 4,
            _ => 0,
        })
        .collect();
    Ok((bytes, nibbles.len() as u32 * 4))
}

/// Collapse duplicates, keeping first-seen order.
fn dedup_ordered<T: PartialEq + Copy>(items: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(*item);
        }
    }
    out
}

/// Build a read plan from `request`.
///
/// Produces exactly one sub-plan per distinct selected protocol, each with
/// the full antenna list. Filter, embedded read, and fast search are Gen2
/// operations and only attach to the Gen2 sub-plan.
pub fn build_read_plan(request: &ReadPlanRequest) -> std::result::Result<ReadPlan, ValidationError> {
    let antennas = dedup_ordered(&request.antennas);
    if antennas.is_empty() {
        return Err(ValidationError::NoAntennaSelected);
    }
    if antennas.contains(&0) {
        return Err(ValidationError::InvalidAntenna(0));
    }

    let protocols = dedup_ordered(&request.protocols);
    if protocols.is_empty() {
        return Err(ValidationError::NoProtocolSelected);
    }

    let filter = match &request.filter {
        Some(spec) => {
            let start_bit = parse_number("filter start address", &spec.start_address)?;
            let (mask, bit_length) = parse_hex_data("filter data", &spec.data)?;
            Some(TagFilter {
                bank: spec.bank,
                start_bit,
                mask,
                bit_length,
                invert: spec.invert,
            })
        }
        None => None,
    };

    let embedded = match &request.embedded {
        Some(spec) => {
            let start_word = parse_number("embedded read start address", &spec.start_address)?;
            let count = parse_number("embedded read length", &spec.word_count)?;
            let word_count =
                u8::try_from(count).map_err(|_| ValidationError::InvalidNumericFormat {
                    field: "embedded read length",
                    value: spec.word_count.clone(),
                })?;
            Some(EmbeddedRead {
                bank: spec.bank,
                start_word,
                word_count,
            })
        }
        None => None,
    };

    let sub_plans = protocols
        .into_iter()
        .map(|protocol| {
            let gen2 = protocol == TagProtocol::Gen2;
            SubPlan {
                protocol,
                antennas: antennas.clone(),
                embedded: if gen2 { embedded } else { None },
                filter: if gen2 { filter.clone() } else { None },
                fast_search: gen2 && request.fast_search,
            }
        })
        .collect();

    Ok(ReadPlan { sub_plans })
}

/// Stateful front end over [`build_read_plan`].
///
/// Tracks fast search across rebuilds so that turning it off restores the
/// Gen2 target that was in effect before it was turned on.
#[derive(Debug, Default, Clone)]
pub struct ReadPlanBuilder {
    fast_search: FastSearchState,
}

impl ReadPlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a plan and bring `tuning.target` in line with fast search.
    ///
    /// `tuning` is left untouched when the request is rejected.
    pub fn build(
        &mut self,
        request: &ReadPlanRequest,
        tuning: &mut TuningSettings,
    ) -> std::result::Result<ReadPlan, ValidationError> {
        let plan = build_read_plan(request)?;
        self.fast_search.sync(plan.fast_search(), tuning);
        Ok(plan)
    }

    /// Whether fast search currently overrides the target.
    pub fn fast_search_active(&self) -> bool {
        self.fast_search.is_active()
    }
}
