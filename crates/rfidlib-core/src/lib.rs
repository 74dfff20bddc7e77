//! rfidlib-core: Core traits, types, and error definitions for rfidlib.
//!
//! This crate defines the driver-agnostic abstractions the session layer is
//! built on. Applications depend on these types without pulling in any
//! specific reader driver.
//!
//! # Key types
//!
//! - [`ReaderDriver`] / [`ReaderConnector`] -- the driver seam
//! - [`ReadPlan`] / [`ReadPlanBuilder`] -- what to inventory and how
//! - [`TuningSettings`] -- Gen2 link parameters
//! - [`SessionEvent`] -- asynchronous session notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod endpoint;
pub mod error;
pub mod events;
pub mod gen2;
pub mod models;
pub mod params;
pub mod plan;
pub mod reader;
pub mod types;
pub mod vendor;

// Re-export key types at crate root for ergonomic `use rfidlib_core::*`.
pub use endpoint::{Endpoint, EndpointTarget, Scheme};
pub use error::{Advisory, Error, ErrorKind, Result, ValidationError};
pub use events::{DriverEvent, SessionEvent};
pub use gen2::{
    FastSearchState, Gen2Session, Gen2Target, LinkFrequency, QAlgorithm, Tari, TagEncoding,
    TuningSettings,
};
pub use models::{ReaderCapabilities, ReaderModel};
pub use params::{ParamValue, paths};
pub use plan::{
    EmbeddedRead, EmbeddedReadSpec, FilterSpec, ReadPlan, ReadPlanBuilder, ReadPlanRequest,
    SubPlan, TagFilter, build_read_plan,
};
pub use reader::{ReaderConnector, ReaderDriver, TagSink};
pub use types::*;
pub use vendor::classify_vendor_message;
