// rfidlib test application -- CLI tool for exercising reader sessions
// against a simulated reader.
//
// Usage:
//   rfidlib-test-app models
//   rfidlib-test-app --settings reader.toml settings
//   rfidlib-test-app --settings reader.toml settings --write
//   rfidlib-test-app --tags 40 read-once --timeout-ms 250
//   rfidlib-test-app continuous --duration 30
//   rfidlib-test-app --drop-after 200 continuous --relay-port 8081
//   rfidlib-test-app firmware --image M6e-1.9.4.sim
//
// Logging goes to stderr and follows RUST_LOG (default: info).

mod store;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rfidlib::relay::StreamRelay;
use rfidlib::{
    AggregateSnapshot, Error, FirmwareUpdateController, Properties, PropertyStore,
    ReadPlanBuilder, ReaderSettings, SessionController, SessionEvent, spawn_refresh_timer,
};
use rfidlib_test_harness::SimulatedConnector;

use crate::store::TomlFileStore;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// rfidlib test application -- drives reader sessions from the command line.
#[derive(Parser)]
#[command(name = "rfidlib-test-app", version, about)]
struct Cli {
    /// Reader URI (e.g. tmr:///dev/ttyUSB0, tmr://192.168.1.50).
    #[arg(long, default_value = "tmr:///dev/sim0")]
    uri: String,

    /// Model the simulated reader reports (e.g. M6e, M6e Nano, Sargas).
    #[arg(long, default_value = "M6e")]
    model: String,

    /// Number of distinct tags in the simulated field.
    #[arg(long, default_value_t = 25)]
    tags: usize,

    /// Seed for the simulated field, for repeatable runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Drop the simulated link once after this many streamed tags.
    #[arg(long)]
    drop_after: Option<u64>,

    /// Settings file (flat TOML table of parameter paths).
    #[arg(long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List supported reader models.
    Models,

    /// Validate the settings file and print the effective values.
    Settings {
        /// Write the normalized settings back to the file.
        #[arg(long)]
        write: bool,
    },

    /// Run one timed read and print what was seen.
    ReadOnce {
        /// Read length in milliseconds (default: from settings).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Read continuously, printing events and read rate.
    Continuous {
        /// Duration in seconds (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// Relay observations to TCP clients on this port.
        #[arg(long)]
        relay_port: Option<u16>,

        /// Rate refresh period in milliseconds.
        #[arg(long, default_value_t = 1000)]
        refresh_ms: u64,
    },

    /// Flash a firmware image.
    Firmware {
        /// Path to the image file.
        #[arg(long)]
        image: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_properties(cli: &Cli) -> Result<Properties> {
    match &cli.settings {
        Some(path) => TomlFileStore::new(path)
            .load()
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(Properties::new()),
    }
}

/// Load settings, reporting anything that fell back to a default.
fn load_settings(cli: &Cli) -> Result<ReaderSettings> {
    let props = load_properties(cli)?;
    let (settings, warnings) = ReaderSettings::from_properties(&props);
    for warning in &warnings {
        println!("[warning] {warning}");
    }
    Ok(settings)
}

/// Build a session against the simulated reader, connect, and push the
/// configured read plan.
async fn open_session(cli: &Cli, settings: &ReaderSettings) -> Result<SessionController> {
    let mut connector = SimulatedConnector::new(&cli.model, cli.tags);
    if let Some(seed) = cli.seed {
        connector = connector.seed(seed);
    }
    if let Some(count) = cli.drop_after {
        connector = connector.lose_connection_after(count);
    }

    let mut builder = SessionController::builder(Arc::new(connector))
        .transport_timeout(settings.transport_timeout)
        .unique_by_data(settings.unique_by_data);
    if let Some(region) = settings.region {
        builder = builder.default_region(region);
    }
    let session = builder.build().context("invalid session options")?;

    let connected = session
        .connect(&cli.uri)
        .await
        .with_context(|| format!("connecting to {}", cli.uri))?;
    println!(
        "Connected: {} (software {}, region {}, ports {:?})",
        connected.model.name,
        connected.info.software_version,
        connected.info.region,
        connected.info.connected_ports
    );

    let mut plans = ReadPlanBuilder::new();
    let plan = match settings.apply(&session, &mut plans).await {
        Ok(plan) => plan,
        Err(e @ Error::UnsupportedConfiguration { .. }) => {
            warn!(error = %e, "tuning rejected, retrying with reduced settings");
            let mut reduced = settings.clone();
            reduced.tuning = settings.tuning.reduced();
            reduced
                .apply(&session, &mut plans)
                .await
                .context("applying reduced read plan")?
        }
        Err(e) => return Err(e).context("applying read plan"),
    };
    info!(protocols = ?plan.protocols(), fast_search = plan.fast_search(), "read plan applied");

    Ok(session)
}

fn print_snapshot(snapshot: &AggregateSnapshot) {
    if snapshot.records.is_empty() {
        println!("No tags seen.");
        return;
    }

    let epc_width = snapshot
        .records
        .iter()
        .map(|r| r.epc.len())
        .max()
        .unwrap_or(24)
        .max(24);

    println!(
        "{:<epc_width$}  {:>7}  {:>5}  {:>3}  Last Seen",
        "EPC", "Reads", "RSSI", "Ant",
    );
    println!(
        "{:<epc_width$}  {:>7}  {:>5}  {:>3}  ---------",
        "-".repeat(epc_width),
        "-------",
        "-----",
        "---",
    );
    for record in &snapshot.records {
        println!(
            "{:<epc_width$}  {:>7}  {:>5}  {:>3}  {}",
            record.epc,
            record.read_count,
            record.rssi,
            record.antenna,
            record.last_seen.format("%H:%M:%S%.3f"),
        );
    }

    println!();
    println!(
        "{} unique tags, {} reads in {:.1}s ({:.1} reads/s).",
        snapshot.unique_tags,
        snapshot.total_reads,
        snapshot.elapsed.as_secs_f64(),
        snapshot.read_rate
    );
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_models() -> Result<()> {
    let models = rfidlib::supported_models();

    let name_width = models
        .iter()
        .map(|m| m.name.len())
        .max()
        .unwrap_or(12)
        .max(12);

    println!(
        "{:<name_width$}  {:<10}  {:<4}  {:<4}  Protocols",
        "Model", "Antennas", "Tari", "Fast",
    );
    println!(
        "{:<name_width$}  {:<10}  {:<4}  {:<4}  ---------",
        "-".repeat(name_width),
        "----------",
        "----",
        "----",
    );

    let yes_no = |b: bool| if b { "yes" } else { "no" };
    for model in &models {
        let ports: Vec<String> = model.antenna_ports.iter().map(|p| p.to_string()).collect();
        let protocols: Vec<String> = model.protocols.iter().map(|p| p.to_string()).collect();
        println!(
            "{:<name_width$}  {:<10}  {:<4}  {:<4}  {}",
            model.name,
            ports.join(","),
            yes_no(model.supports_tari),
            yes_no(model.supports_fast_search),
            protocols.join(", "),
        );
    }

    println!();
    println!("{} models total.", models.len());

    Ok(())
}

fn cmd_settings(cli: &Cli, write: bool) -> Result<()> {
    let settings = load_settings(cli)?;

    for (key, value) in settings.to_properties() {
        println!("{key} = {value}");
    }

    if write {
        let Some(path) = &cli.settings else {
            bail!("--write needs --settings <file>");
        };
        TomlFileStore::new(path)
            .save(&settings.to_properties())
            .with_context(|| format!("writing settings to {}", path.display()))?;
        println!("Settings written to {}.", path.display());
    }

    Ok(())
}

async fn cmd_read_once(session: &SessionController, timeout: Duration) -> Result<()> {
    println!("Reading for {} ms...", timeout.as_millis());
    let tags = session.read_once(timeout).await.context("read failed")?;
    if tags.is_empty() {
        println!("No tags responded.");
        return Ok(());
    }
    println!("{} observations.", tags.len());
    print_snapshot(&session.aggregator().snapshot());
    Ok(())
}

async fn cmd_continuous(
    session: &SessionController,
    duration_secs: u64,
    relay_port: Option<u16>,
    refresh: Duration,
) -> Result<()> {
    let relay = match relay_port {
        Some(port) => {
            let relay = Arc::new(
                StreamRelay::bind(("0.0.0.0", port))
                    .await
                    .with_context(|| format!("binding relay port {port}"))?,
            );
            session.add_sink(relay.clone());
            println!("Relaying tags on {}.", relay.local_addr());
            Some(relay)
        }
        None => None,
    };

    let mut event_rx = session.subscribe();
    let timer = spawn_refresh_timer(session.aggregator(), refresh);
    let mut ticks = timer.subscribe();

    session
        .start_continuous()
        .await
        .context("starting continuous read")?;
    println!("Reading continuously (Ctrl-C to stop)...");

    let elapsed = async {
        if duration_secs > 0 {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(elapsed);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut gave_up = false;
    loop {
        tokio::select! {
            _ = &mut elapsed => {
                println!("Read duration elapsed.");
                break;
            }

            _ = &mut ctrl_c => {
                println!("Interrupted.");
                break;
            }

            changed = ticks.changed() => {
                if changed.is_err() {
                    break;
                }
                let tick = ticks.borrow_and_update().clone();
                if let Some(tick) = tick {
                    println!(
                        "[rate] {:.1} reads/s now, {:.1} overall, {} unique, {} total",
                        tick.instant_rate,
                        tick.snapshot.read_rate,
                        tick.snapshot.unique_tags,
                        tick.snapshot.total_reads
                    );
                }
            }

            event = event_rx.recv() => match event {
                Ok(event @ SessionEvent::ReconnectFailed { .. }) => {
                    println!("[event] {event:?}");
                    gave_up = true;
                    break;
                }
                Ok(event) => println!("[event] {event:?}"),
                Err(RecvError::Lagged(n)) => {
                    println!("[warning] missed {n} events (consumer too slow)");
                }
                Err(RecvError::Closed) => {
                    println!("Event channel closed.");
                    break;
                }
            },
        }
    }

    if !gave_up {
        session
            .stop_continuous()
            .await
            .context("stopping continuous read")?;
    }
    timer.stop().await;
    if let Some(relay) = relay {
        println!(
            "Relay wrote {} lines ({} dropped).",
            relay.lines_written(),
            relay.lines_dropped()
        );
        relay.stop().await;
    }

    println!();
    print_snapshot(&session.aggregator().snapshot());

    if gave_up {
        bail!("reader connection lost and not recovered");
    }
    Ok(())
}

async fn cmd_firmware(session: &SessionController, image: &Path) -> Result<()> {
    let file = tokio::fs::File::open(image)
        .await
        .with_context(|| format!("opening {}", image.display()))?;

    let updater = FirmwareUpdateController::new(session.clone());
    let mut progress = updater.progress();
    let printer = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let percent = *progress.borrow_and_update();
            print!("\rFlashing: {percent:>3}%");
            let _ = io::stdout().flush();
        }
        println!();
    });

    let result = updater.update(file).await;
    drop(updater);
    let _ = printer.await;

    match result {
        Ok(()) => {
            let version = session
                .session()
                .await
                .map(|s| s.info.software_version)
                .unwrap_or_default();
            println!("Firmware updated, reader now reports {version}.");
            Ok(())
        }
        Err(e) if e.recovered() => bail!("{e}"),
        Err(e) => bail!("{e}; reconnect manually before continuing"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // These do not need a reader.
    match &cli.command {
        Command::Models => return cmd_models(),
        Command::Settings { write } => return cmd_settings(&cli, *write),
        _ => {}
    }

    let settings = load_settings(&cli)?;
    let session = open_session(&cli, &settings).await?;

    let result = match &cli.command {
        Command::ReadOnce { timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(settings.read_timeout);
            cmd_read_once(&session, timeout).await
        }
        Command::Continuous {
            duration,
            relay_port,
            refresh_ms,
        } => {
            cmd_continuous(
                &session,
                *duration,
                *relay_port,
                Duration::from_millis(*refresh_ms),
            )
            .await
        }
        Command::Firmware { image } => cmd_firmware(&session, image).await,
        Command::Models => unreachable!("models handled above"),
        Command::Settings { .. } => unreachable!("settings handled above"),
    };

    session.disconnect().await.ok();
    result
}
