//! rfidlib-session: Session control for one RFID reader.
//!
//! [`SessionController`] owns the connection to a reader and everything that
//! happens on it: pushing read plans, single-shot and continuous reads,
//! supervised reconnection, and firmware updates. Every tag it sees is fed
//! to the [`TagAggregator`] and to any other [`TagSink`](rfidlib_core::TagSink)
//! attached to the session.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rfidlib_core::{ReadPlanBuilder, ReadPlanRequest, TagProtocol, TuningSettings};
//! use rfidlib_session::SessionController;
//!
//! # async fn example(connector: Arc<dyn rfidlib_core::ReaderConnector>) -> rfidlib_core::Result<()> {
//! let session = SessionController::builder(connector).build()?;
//! session.connect("tmr:///dev/ttyUSB0").await?;
//!
//! let mut tuning = TuningSettings::default();
//! let plan = ReadPlanBuilder::new()
//!     .build(&ReadPlanRequest::new(&[TagProtocol::Gen2], &[1, 2]), &mut tuning)?;
//! session.apply_read_plan(&plan, &tuning).await?;
//!
//! let tags = session.read_once(Duration::from_millis(500)).await?;
//! println!("{} tags", tags.len());
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod builder;
pub mod clock;
pub mod controller;
pub mod firmware;
pub mod refresh;
pub mod settings;
pub mod supervisor;

pub use aggregator::{AggregateSnapshot, TagAggregator, TagRecord};
pub use builder::SessionBuilder;
pub use clock::ElapsedClock;
pub use controller::{ConnectionState, ReadState, ReaderSession, SessionController};
pub use firmware::{FirmwareError, FirmwareUpdateController};
pub use refresh::{RefreshTick, RefreshTimer, spawn_refresh_timer};
pub use settings::{MemoryPropertyStore, Properties, PropertyStore, ReaderSettings, SettingWarning};
pub use supervisor::{AdvisoryFilter, Recovery, RetryState, recovery_for};
