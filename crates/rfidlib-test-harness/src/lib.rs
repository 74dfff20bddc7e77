//! rfidlib-test-harness: Test utilities for rfidlib.
//!
//! This crate provides [`MockConnector`] for deterministic unit testing of
//! the session layer without real reader hardware, and
//! [`SimulatedConnector`] for demos and soak runs against a random tag
//! field.

pub mod mock_reader;
pub mod simulated;

pub use mock_reader::{Fault, MockConnector, MockReader, ReadOutcome};
pub use simulated::{FIRMWARE_MAGIC, SimulatedConnector, SimulatedReader};
