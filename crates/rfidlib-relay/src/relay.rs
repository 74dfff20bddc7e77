//! TCP relay for live tag observations.
//!
//! [`StreamRelay`] listens on a TCP port and serves one client at a time.
//! A client receives a greeting line, then one line per observation:
//!
//! ```text
//! EPC<TAB>timestamp<TAB>RSSI<TAB>read count
//! ```
//!
//! with the timestamp in RFC 3339. Forwarding is a non-blocking hand-off
//! to the relay's own task, so a slow or vanished client never stalls the
//! read that produces the observations. While nobody is connected,
//! forwarding does nothing at all.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rfidlib_relay::StreamRelay;
//!
//! # async fn example() -> rfidlib_core::Result<()> {
//! let relay = Arc::new(StreamRelay::bind("0.0.0.0:8081").await?);
//! println!("relay listening on {}", relay.local_addr());
//! // session.add_sink(relay.clone());
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::SecondsFormat;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use rfidlib_core::error::Result;
use rfidlib_core::reader::TagSink;
use rfidlib_core::types::TagObservation;

/// First line sent to every client.
pub const GREETING: &str = "rfidlib tag relay ready";

/// Lines buffered between the read and the socket.
pub const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Render one observation as a relay line, newline included.
pub fn format_record(obs: &TagObservation) -> String {
    format!(
        "{}\t{}\t{}\t{}\n",
        obs.epc,
        obs.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        obs.rssi,
        obs.read_count
    )
}

/// A relay line, tagged with the client it was queued for.
type Line = (u64, String);

/// Counters shared with the relay task.
#[derive(Debug, Default)]
struct RelayState {
    /// Bumped for each accepted client.
    epoch: AtomicU64,
    client_connected: AtomicBool,
    lines_written: AtomicU64,
    lines_dropped: AtomicU64,
}

/// A running relay. Dropping it stops the listener.
#[derive(Debug)]
pub struct StreamRelay {
    local_addr: SocketAddr,
    lines: mpsc::Sender<Line>,
    state: Arc<RelayState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamRelay {
    /// Bind to `addr` and start waiting for a client.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (lines, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let state = Arc::new(RelayState::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(accept_loop(listener, rx, state.clone(), cancel.clone()));
        info!(addr = %local_addr, "tag relay listening");

        Ok(StreamRelay {
            local_addr,
            lines,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_client_connected(&self) -> bool {
        self.state.client_connected.load(Ordering::Acquire)
    }

    /// Lines written to clients so far.
    pub fn lines_written(&self) -> u64 {
        self.state.lines_written.load(Ordering::Relaxed)
    }

    /// Lines discarded because the client could not keep up.
    pub fn lines_dropped(&self) -> u64 {
        self.state.lines_dropped.load(Ordering::Relaxed)
    }

    /// Queue `obs` for the connected client. Never blocks; a no-op while no
    /// client is connected.
    pub fn forward(&self, obs: &TagObservation) {
        let epoch = self.state.epoch.load(Ordering::Acquire);
        if !self.is_client_connected() {
            return;
        }
        match self.lines.try_send((epoch, format_record(obs))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.state.lines_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Close any client, release the port, and wait for the task to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl TagSink for StreamRelay {
    fn accept(&self, observation: &TagObservation) {
        self.forward(observation);
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut lines: mpsc::Receiver<Line>,
    state: Arc<RelayState>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "relay accept failed");
                continue;
            }
        };

        let epoch = state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        info!(peer = %peer, epoch, "relay client connected");
        state.client_connected.store(true, Ordering::Release);
        let keep_going = serve(stream, epoch, &mut lines, &state, &cancel).await;
        state.client_connected.store(false, Ordering::Release);

        // Whatever was queued for the old client is stale. A forward racing
        // with the disconnect can still land later; `serve` drops it by epoch.
        while lines.try_recv().is_ok() {}
        info!(peer = %peer, "relay client disconnected");

        if !keep_going {
            break;
        }
    }
    debug!("relay accept loop stopped");
}

/// Serve one client. Returns false when the relay is stopping.
async fn serve(
    stream: TcpStream,
    epoch: u64,
    lines: &mut mpsc::Receiver<Line>,
    state: &RelayState,
    cancel: &CancellationToken,
) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    if let Err(e) = write_line(&mut writer, &format!("{GREETING}\n")).await {
        debug!(error = %e, "relay greeting failed");
        return true;
    }

    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = writer.shutdown().await;
                return false;
            }

            line = lines.recv() => {
                let Some((queued_for, line)) = line else {
                    return false;
                };
                if queued_for != epoch {
                    trace!(queued_for, epoch, "dropping line queued for an earlier client");
                    continue;
                }
                if let Err(e) = write_line(&mut writer, &line).await {
                    debug!(error = %e, "relay write failed, dropping client");
                    return true;
                }
                state.lines_written.fetch_add(1, Ordering::Relaxed);
            }

            read = client_input(&mut reader, &mut scratch) => {
                if !read {
                    return true;
                }
            }
        }
    }
}

/// Discard anything the client sends. False once it has gone away.
async fn client_input(reader: &mut OwnedReadHalf, scratch: &mut [u8]) -> bool {
    match reader.read(scratch).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            trace!(bytes = n, "ignoring client input");
            true
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
