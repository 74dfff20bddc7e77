//! rfidlib-relay: Re-broadcast live tag observations over TCP.
//!
//! [`StreamRelay`] is a [`TagSink`](rfidlib_core::TagSink): attach it to a
//! session and every observation is written, one tab-separated line each,
//! to whichever client is connected.

pub mod relay;

pub use relay::{GREETING, LINE_CHANNEL_CAPACITY, StreamRelay, format_record};
