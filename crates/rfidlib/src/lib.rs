//! # rfidlib -- Session Control for UHF RFID Readers
//!
//! `rfidlib` drives an RFID reader through its whole working life: connect
//! and identify it, build and push a read plan, read once or continuously,
//! survive a dropped link, flash new firmware, and relay what it sees to a
//! TCP client.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rfidlib::{ReadPlanBuilder, ReadPlanRequest, SessionController, TagProtocol, TuningSettings};
//!
//! # async fn example(connector: Arc<dyn rfidlib::ReaderConnector>) -> anyhow::Result<()> {
//! let session = SessionController::builder(connector).build()?;
//! session.connect("tmr:///dev/ttyUSB0").await?;
//!
//! let mut tuning = TuningSettings::default();
//! let plan = ReadPlanBuilder::new()
//!     .build(&ReadPlanRequest::new(&[TagProtocol::Gen2], &[1]), &mut tuning)?;
//! session.apply_read_plan(&plan, &tuning).await?;
//!
//! session.start_continuous().await?;
//! tokio::time::sleep(Duration::from_secs(10)).await;
//! session.stop_continuous().await?;
//!
//! let snapshot = session.aggregator().snapshot();
//! println!("{} unique tags, {} reads", snapshot.unique_tags, snapshot.total_reads);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate                   | Purpose                                              |
//! |-------------------------|------------------------------------------------------|
//! | `rfidlib-core`          | Driver traits, read plans, Gen2 tuning, errors       |
//! | `rfidlib-session`       | Session controller, reconnection, aggregation, firmware |
//! | `rfidlib-relay`         | TCP line relay for live observations                 |
//! | `rfidlib-test-harness`  | Scripted mock reader and simulated tag field         |
//! | **`rfidlib`**           | This facade crate -- re-exports everything           |
//!
//! Wire protocols live behind [`ReaderDriver`]; the session only ever sees
//! parameters, tag observations, and typed errors.
//!
//! ## Feature Flags
//!
//! | Feature | Enables                      | Default |
//! |---------|------------------------------|---------|
//! | `relay` | [`relay`] module (TCP relay) | yes     |
//!
//! ## Events
//!
//! Sessions publish [`SessionEvent`]s through a broadcast channel:
//!
//! ```no_run
//! use rfidlib::{SessionController, SessionEvent};
//! # async fn example(session: SessionController) {
//! let mut events = session.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Reconnecting { attempt } => println!("reconnecting ({attempt})"),
//!         SessionEvent::Advisory { advisory, .. } => println!("warning: {advisory}"),
//!         other => println!("{other:?}"),
//!     }
//! }
//! # }
//! ```

pub use rfidlib_core::*;
pub use rfidlib_session::{
    AdvisoryFilter, AggregateSnapshot, ConnectionState, ElapsedClock, FirmwareError,
    FirmwareUpdateController, MemoryPropertyStore, Properties, PropertyStore, ReadState,
    ReaderSession, ReaderSettings, Recovery, RefreshTick, RefreshTimer, RetryState,
    SessionBuilder, SessionController, SettingWarning, TagAggregator, TagRecord, recovery_for,
    spawn_refresh_timer,
};

/// TCP relay of live observations.
///
/// Provides [`StreamRelay`](relay::StreamRelay), a [`TagSink`] that writes
/// one line per observation to a connected client.
#[cfg(feature = "relay")]
pub mod relay {
    pub use rfidlib_relay::*;
}

/// Summary of one supported reader model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDefinition {
    pub name: &'static str,
    pub antenna_ports: Vec<u8>,
    pub protocols: Vec<TagProtocol>,
    pub supports_tari: bool,
    pub supports_fast_search: bool,
}

impl From<&ReaderModel> for ModelDefinition {
    fn from(model: &ReaderModel) -> Self {
        ModelDefinition {
            name: model.name,
            antenna_ports: model.capabilities.antenna_ports.clone(),
            protocols: model.capabilities.protocols.clone(),
            supports_tari: model.capabilities.supports_tari,
            supports_fast_search: model.capabilities.supports_fast_search,
        }
    }
}

/// Every reader model with a known capability table.
///
/// Readers reporting any other model string still connect, with generic
/// capabilities.
///
/// # Example
///
/// ```
/// for model in rfidlib::supported_models() {
///     println!("{} ({} ports)", model.name, model.antenna_ports.len());
/// }
/// ```
pub fn supported_models() -> Vec<ModelDefinition> {
    models::all_models().iter().map(ModelDefinition::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rfidlib_test_harness::{Fault, MockConnector};

    #[test]
    fn supported_models_lists_table() {
        let models = supported_models();
        let names: Vec<&str> = models.iter().map(|m| m.name).collect();
        assert!(names.contains(&"M6e"));
        assert!(names.contains(&"M6e Nano"));
        assert!(!names.contains(&"Unknown"));
        let nano = models.iter().find(|m| m.name == "M6e Nano").unwrap();
        assert!(!nano.supports_tari);
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Settings in, continuous read with a relay client, a dropped link,
    /// and an aggregate that kept counting across it.
    #[cfg(feature = "relay")]
    #[tokio::test]
    async fn session_survives_dropped_link_with_relay_attached() -> anyhow::Result<()> {
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::TcpStream;

        let mock = MockConnector::new("M6e");
        let session = SessionController::builder(Arc::new(mock.clone())).build()?;
        session.connect("tmr:///dev/ttyUSB0").await?;

        let (settings, warnings) = ReaderSettings::from_properties(
            &[(paths::PLAN_ANTENNAS.to_string(), "1,2".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(warnings.is_empty());
        let mut builder = ReadPlanBuilder::new();
        let plan = settings.apply(&session, &mut builder).await?;
        assert_eq!(plan.sub_plans()[0].antennas, vec![1, 2]);

        let relay = Arc::new(relay::StreamRelay::bind("127.0.0.1:0").await?);
        session.add_sink(relay.clone());
        let mut client = BufReader::new(TcpStream::connect(relay.local_addr()).await?);
        let mut line = String::new();
        client.read_line(&mut line).await?;
        assert!(relay.is_client_connected());

        session.start_continuous().await?;
        assert!(mock.emit_tag(TagObservation::new("E1")));
        assert!(mock.emit_tag(TagObservation::new("E2")));
        let aggregator = session.aggregator();
        wait_until(|| aggregator.total_reads() == 2).await;

        let mut events = session.subscribe();
        mock.fail_connects(1, Fault::Unreachable);
        assert!(mock.emit_error(Fault::ConnectionLost));
        loop {
            if matches!(events.recv().await?, SessionEvent::Reconnected) {
                break;
            }
        }

        assert!(mock.emit_tag(TagObservation::new("E1")));
        wait_until(|| aggregator.total_reads() == 3).await;
        assert_eq!(aggregator.unique_tags(), 2);

        for expected in ["E1", "E2", "E1"] {
            line.clear();
            client.read_line(&mut line).await?;
            assert!(line.starts_with(&format!("{expected}\t")), "got {line:?}");
        }

        session.stop_continuous().await?;
        session.disconnect().await?;
        relay.stop().await;
        Ok(())
    }
}
