//! Reconnection supervisor.
//!
//! While a continuous read runs, every driver error is forwarded here tagged
//! with the read generation it came from. The supervisor classifies each
//! error and acts on it:
//!
//! | Kind              | Action                                              |
//! |-------------------|-----------------------------------------------------|
//! | transient read    | log only                                            |
//! | timeout           | disconnect, surface [`SessionEvent::ReadError`]     |
//! | connection lost   | reconnect, up to `max_retries` immediate attempts   |
//! | advisory          | surface unless suppressed                           |
//! | anything else     | stop the continuous read, surface, no retry         |
//!
//! Errors from an older generation are stale (the read they came from has
//! already been torn down or replaced) and are dropped. Together with the
//! one-message-at-a-time loop this makes recovery single-flight.

use std::collections::HashSet;
use std::sync::Weak;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use rfidlib_core::error::{Advisory, Error, ErrorKind};
use rfidlib_core::events::SessionEvent;

use crate::controller::{SessionController, Shared};

/// Default bound on consecutive reconnection attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// A driver error tagged with the read generation that produced it.
#[derive(Debug)]
pub(crate) struct SupervisedError {
    pub generation: u64,
    pub error: Error,
}

/// Consecutive-failure bookkeeping for one continuous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub consecutive_failures: u32,
    pub max_retries: u32,
}

impl RetryState {
    pub fn new(max_retries: u32) -> Self {
        RetryState {
            consecutive_failures: 0,
            max_retries,
        }
    }

    /// Count one more failure and return the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn exhausted(&self) -> bool {
        self.consecutive_failures >= self.max_retries
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        RetryState::new(DEFAULT_MAX_RETRIES)
    }
}

/// Advisories the user asked not to be shown again.
#[derive(Debug, Clone, Default)]
pub struct AdvisoryFilter {
    suppressed: HashSet<Advisory>,
}

impl AdvisoryFilter {
    pub fn suppress(&mut self, advisory: Advisory) {
        self.suppressed.insert(advisory);
    }

    pub fn allow(&mut self, advisory: Advisory) {
        self.suppressed.remove(&advisory);
    }

    pub fn is_suppressed(&self, advisory: Advisory) -> bool {
        self.suppressed.contains(&advisory)
    }
}

/// What the supervisor does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    LogOnly,
    Disconnect,
    Reconnect,
    Advise,
    StopReading,
}

/// Map an error onto the supervisor's response.
pub fn recovery_for(error: &Error) -> Recovery {
    match error.kind() {
        ErrorKind::TransientRead => Recovery::LogOnly,
        ErrorKind::Timeout => Recovery::Disconnect,
        ErrorKind::ConnectionLost => Recovery::Reconnect,
        ErrorKind::Advisory => Recovery::Advise,
        ErrorKind::Connection
        | ErrorKind::Configuration
        | ErrorKind::Firmware
        | ErrorKind::Fatal => Recovery::StopReading,
    }
}

/// Handle to a running supervisor task.
#[derive(Debug)]
pub(crate) struct SupervisorHandle {
    pub errors: mpsc::UnboundedSender<SupervisedError>,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Ask the task to exit. Does not wait: the task may be the caller.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawn a supervisor for the session behind `shared`.
///
/// The task holds only a weak reference, so it ends on its own once every
/// controller handle has been dropped.
pub(crate) fn spawn_supervisor(shared: Weak<Shared>) -> SupervisorHandle {
    let (errors, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervise(shared, rx, cancel.clone()));
    SupervisorHandle {
        errors,
        cancel,
        _task: task,
    }
}

async fn supervise(
    shared: Weak<Shared>,
    mut rx: mpsc::UnboundedReceiver<SupervisedError>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("reconnection supervisor stopped");
                break;
            }

            msg = rx.recv() => msg,
        };

        let Some(msg) = msg else {
            debug!("supervisor error channel closed");
            break;
        };
        let Some(session) = SessionController::upgrade(&shared) else {
            break;
        };

        if !session.is_current(msg.generation).await {
            trace!(generation = msg.generation, error = %msg.error, "dropping stale read error");
            continue;
        }

        handle_error(&session, msg.error, &cancel).await;
    }
}

async fn handle_error(session: &SessionController, err: Error, cancel: &CancellationToken) {
    match recovery_for(&err) {
        Recovery::LogOnly => {
            debug!(error = %err, "transient read error");
        }
        Recovery::Disconnect => {
            warn!(error = %err, "reader stopped answering, disconnecting");
            let _ = session.disconnect().await;
            session.emit(SessionEvent::ReadError {
                message: err.to_string(),
            });
        }
        Recovery::Reconnect => {
            warn!("connection to reader lost");
            reconnect_with_retry(session, cancel).await;
        }
        Recovery::Advise => {
            if let Error::Advisory { advisory, message } = err {
                if session.is_advisory_suppressed(advisory) {
                    debug!(%advisory, "suppressed reader advisory");
                } else {
                    warn!(%advisory, message = %message, "reader advisory");
                    session.emit(SessionEvent::Advisory { advisory, message });
                }
            }
        }
        Recovery::StopReading => {
            error!(error = %err, "unrecoverable read error, stopping continuous read");
            let _ = session.stop_continuous().await;
            session.emit(SessionEvent::ReadError {
                message: err.to_string(),
            });
        }
    }
}

/// Retry the connection immediately, up to the configured bound.
///
/// The read clock is paused for the whole window; a successful reconnect
/// resumes it when reading restarts.
async fn reconnect_with_retry(session: &SessionController, cancel: &CancellationToken) {
    session.aggregator().pause_clock();

    loop {
        if cancel.is_cancelled() {
            debug!("reconnection abandoned, session stopped");
            return;
        }

        let (attempt, max) = session.record_failure();
        session.emit(SessionEvent::Reconnecting { attempt });
        info!(attempt, max, "reconnecting to reader");

        match session.reconnect().await {
            Ok(()) => {
                session.reset_retry();
                info!(attempt, "reader reconnected");
                session.emit(SessionEvent::Reconnected);
                return;
            }
            Err(e) => {
                warn!(attempt, max, error = %e, "reconnect attempt failed");
                if attempt >= max {
                    break;
                }
            }
        }
    }

    let attempts = session.retry_state().consecutive_failures;
    error!(attempts, "reader unrecoverable, tearing down session");
    let _ = session.disconnect().await;
    session.reset_retry();
    session.emit(SessionEvent::ReconnectFailed { attempts });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_state_counts_and_resets() {
        let mut retry = RetryState::default();
        assert_eq!(retry.max_retries, 5);
        for n in 1..=5 {
            assert_eq!(retry.record_failure(), n);
        }
        assert!(retry.exhausted());
        retry.reset();
        assert_eq!(retry.consecutive_failures, 0);
        assert!(!retry.exhausted());
    }

    #[test]
    fn recovery_follows_error_kind() {
        assert_eq!(recovery_for(&Error::NoTagResponse), Recovery::LogOnly);
        assert_eq!(recovery_for(&Error::Timeout), Recovery::Disconnect);
        assert_eq!(recovery_for(&Error::ConnectionLost), Recovery::Reconnect);
        assert_eq!(
            recovery_for(&Error::Advisory {
                advisory: Advisory::HighTemperature,
                message: "hot".into()
            }),
            Recovery::Advise
        );
        assert_eq!(recovery_for(&Error::Fault("boom".into())), Recovery::StopReading);
        assert_eq!(
            recovery_for(&Error::AccessDenied("COM3".into())),
            Recovery::StopReading
        );
    }

    #[test]
    fn advisory_filter() {
        let mut filter = AdvisoryFilter::default();
        assert!(!filter.is_suppressed(Advisory::HighReturnLoss));
        filter.suppress(Advisory::HighReturnLoss);
        assert!(filter.is_suppressed(Advisory::HighReturnLoss));
        assert!(!filter.is_suppressed(Advisory::HighTemperature));
        filter.allow(Advisory::HighReturnLoss);
        assert!(!filter.is_suppressed(Advisory::HighReturnLoss));
    }
}
