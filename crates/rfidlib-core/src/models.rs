//! Reader model definitions.
//!
//! Each supported reader module is described by a [`ReaderModel`] that
//! captures which antenna ports it has, which protocols it can inventory,
//! and which Gen2 link parameters it lets the host change. The session
//! controller validates read plans and tuning against these capabilities
//! before anything is pushed to the device.
//!
//! | Model      | Ports | Tari | Link frequencies  | Fast search |
//! |------------|-------|------|-------------------|-------------|
//! | M6e        | 1-4   | yes  | 250, 640 kHz      | yes         |
//! | M6e Micro  | 1-2   | yes  | 250, 640 kHz      | yes         |
//! | M6e Nano   | 1     | no   | 250 kHz           | no          |
//! | Micro      | 1-2   | yes  | 250, 640 kHz      | yes         |
//! | Sargas     | 1-2   | yes  | 250, 640 kHz      | yes         |
//! | Izar       | 1-4   | yes  | 250, 640 kHz      | yes         |
//! | Astra-EX   | 1     | no   | 250 kHz           | no          |

use crate::gen2::{LinkFrequency, TagEncoding};
use crate::types::TagProtocol;

/// What a reader model lets the host configure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderCapabilities {
    /// Physical antenna port numbers.
    pub antenna_ports: Vec<u8>,
    /// Protocols the module can inventory.
    pub protocols: Vec<TagProtocol>,
    /// Whether the Gen2 Tari can be changed.
    pub supports_tari: bool,
    /// Settable backscatter link frequencies.
    pub link_frequencies: Vec<LinkFrequency>,
    /// Settable Miller/FM0 encodings.
    pub tag_encodings: Vec<TagEncoding>,
    /// Whether fast search (forced AB targeting) is available.
    pub supports_fast_search: bool,
}

/// Static model definition for a reader module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderModel {
    /// Human-readable model name (e.g. "M6e").
    pub name: &'static str,
    /// Model strings the reader may report for this model.
    pub aliases: &'static [&'static str],
    /// Full capability description.
    pub capabilities: ReaderCapabilities,
}

impl ReaderModel {
    /// Resolve the model string reported by `/reader/version/model`.
    ///
    /// Matching ignores case and surrounding whitespace. Returns `None` for
    /// unknown models; callers fall back to [`generic()`].
    pub fn lookup(reported: &str) -> Option<ReaderModel> {
        let wanted = reported.trim().to_ascii_lowercase();
        all_models().into_iter().find(|m| {
            m.name.to_ascii_lowercase() == wanted
                || m.aliases.iter().any(|a| a.to_ascii_lowercase() == wanted)
        })
    }
}

fn all_encodings() -> Vec<TagEncoding> {
    vec![
        TagEncoding::Fm0,
        TagEncoding::M2,
        TagEncoding::M4,
        TagEncoding::M8,
    ]
}

fn full_link_frequencies() -> Vec<LinkFrequency> {
    vec![LinkFrequency::Khz250, LinkFrequency::Khz640]
}

/// M6e: four-port embedded module, all Gen2 link parameters settable.
pub fn m6e() -> ReaderModel {
    ReaderModel {
        name: "M6e",
        aliases: &["Mercury6e"],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1, 2, 3, 4],
            protocols: TagProtocol::ALL.to_vec(),
            supports_tari: true,
            link_frequencies: full_link_frequencies(),
            tag_encodings: all_encodings(),
            supports_fast_search: true,
        },
    }
}

/// M6e Micro: two-port, Gen2 and ISO 18000-6B only.
pub fn m6e_micro() -> ReaderModel {
    ReaderModel {
        name: "M6e Micro",
        aliases: &["M6eMicro", "M6e Micro USB", "M6e Micro USBPro"],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1, 2],
            protocols: vec![TagProtocol::Gen2, TagProtocol::Iso180006b],
            supports_tari: true,
            link_frequencies: full_link_frequencies(),
            tag_encodings: all_encodings(),
            supports_fast_search: true,
        },
    }
}

/// M6e Nano: single port, fixed Tari, 250 kHz only.
pub fn m6e_nano() -> ReaderModel {
    ReaderModel {
        name: "M6e Nano",
        aliases: &["M6eNano"],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1],
            protocols: vec![TagProtocol::Gen2],
            supports_tari: false,
            link_frequencies: vec![LinkFrequency::Khz250],
            tag_encodings: all_encodings(),
            supports_fast_search: false,
        },
    }
}

/// Micro: two-port Gen2 module.
pub fn micro() -> ReaderModel {
    ReaderModel {
        name: "Micro",
        aliases: &["M6eMicro6"],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1, 2],
            protocols: vec![TagProtocol::Gen2],
            supports_tari: true,
            link_frequencies: full_link_frequencies(),
            tag_encodings: all_encodings(),
            supports_fast_search: true,
        },
    }
}

/// Sargas: two-port fixed reader.
pub fn sargas() -> ReaderModel {
    ReaderModel {
        name: "Sargas",
        aliases: &[],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1, 2],
            protocols: vec![TagProtocol::Gen2, TagProtocol::Iso180006b],
            supports_tari: true,
            link_frequencies: full_link_frequencies(),
            tag_encodings: all_encodings(),
            supports_fast_search: true,
        },
    }
}

/// Izar: four-port fixed reader.
pub fn izar() -> ReaderModel {
    ReaderModel {
        name: "Izar",
        aliases: &[],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1, 2, 3, 4],
            protocols: vec![TagProtocol::Gen2, TagProtocol::Iso180006b],
            supports_tari: true,
            link_frequencies: full_link_frequencies(),
            tag_encodings: all_encodings(),
            supports_fast_search: true,
        },
    }
}

/// Astra-EX: integrated-antenna reader, fixed Tari.
pub fn astra_ex() -> ReaderModel {
    ReaderModel {
        name: "Astra-EX",
        aliases: &["AstraEX", "Astra"],
        capabilities: ReaderCapabilities {
            antenna_ports: vec![1],
            protocols: vec![TagProtocol::Gen2],
            supports_tari: false,
            link_frequencies: vec![LinkFrequency::Khz250],
            tag_encodings: all_encodings(),
            supports_fast_search: false,
        },
    }
}

/// Permissive model used when the reader reports an unknown model string.
///
/// Validation against it passes for anything the device itself accepts; the
/// device remains the final authority.
pub fn generic() -> ReaderModel {
    ReaderModel {
        name: "Unknown",
        aliases: &[],
        capabilities: ReaderCapabilities {
            antenna_ports: (1..=8).collect(),
            protocols: TagProtocol::ALL.to_vec(),
            supports_tari: true,
            link_frequencies: full_link_frequencies(),
            tag_encodings: all_encodings(),
            supports_fast_search: true,
        },
    }
}

/// All known models.
pub fn all_models() -> Vec<ReaderModel> {
    vec![
        m6e(),
        m6e_micro(),
        m6e_nano(),
        micro(),
        sargas(),
        izar(),
        astra_ex(),
    ]
}
