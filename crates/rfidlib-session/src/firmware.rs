//! Firmware update.
//!
//! Flashing needs a fresh, exclusive reader handle: the session is torn
//! down and reserved, a new driver is opened to the same endpoint, and the
//! flash runs on its own task. While the reservation holds, every other
//! device operation on the session fails with `Busy`. A second task advances a progress percentage while the
//! flash is in flight; it never reports 100 until the flash has actually
//! succeeded, and it freezes where it was if the flash fails.
//!
//! After a successful flash the session is reconnected from scratch, since
//! the reader's identity and parameters may have changed. After any failure
//! past the teardown, including a flash handle that would not open, a
//! reconnect is still attempted so the reader is left usable, and the
//! outcome is reported in the error.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rfidlib_core::endpoint::Endpoint;
use rfidlib_core::error::Error;
use rfidlib_core::events::SessionEvent;

use crate::controller::SessionController;

/// Why a firmware update did not complete.
#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    /// The image could not be read from its source.
    #[error("could not read firmware image: {0}")]
    Read(#[from] std::io::Error),

    /// The reader (or a pre-flight check) refused the image.
    #[error("invalid firmware image: {message}{}", recovery_note(*.recovered))]
    InvalidImage {
        message: String,
        /// Whether the session was reconnected afterwards.
        recovered: bool,
    },

    /// Flashing started and then failed.
    #[error("firmware flash failed: {message}{}", recovery_note(*.recovered))]
    FlashFailed { message: String, recovered: bool },

    /// No session to update, or the flash handle could not be opened.
    #[error("firmware update could not reach the reader: {source}{}", recovery_note(*.recovered))]
    Connection { source: Error, recovered: bool },

    /// The flash succeeded but the reader could not be reconnected.
    #[error("firmware flashed but reconnect failed: {0}")]
    ReconnectFailed(Error),
}

fn recovery_note(recovered: bool) -> &'static str {
    if recovered {
        " (reader reconnected)"
    } else {
        " (reader not reconnected)"
    }
}

impl FirmwareError {
    /// Whether the reader was left connected.
    pub fn recovered(&self) -> bool {
        match self {
            FirmwareError::InvalidImage { recovered, .. }
            | FirmwareError::FlashFailed { recovered, .. }
            | FirmwareError::Connection { recovered, .. } => *recovered,
            FirmwareError::Read(_) => true,
            FirmwareError::ReconnectFailed(_) => false,
        }
    }
}

/// Drives firmware updates for a session.
pub struct FirmwareUpdateController {
    session: SessionController,
    progress_tx: watch::Sender<u8>,
    tick: Duration,
    step: u8,
}

impl FirmwareUpdateController {
    pub fn new(session: SessionController) -> Self {
        let (progress_tx, _) = watch::channel(0);
        FirmwareUpdateController {
            session,
            progress_tx,
            tick: Duration::from_millis(500),
            step: 2,
        }
    }

    /// Progress ticker period and increment (defaults: 500ms, 2%).
    pub fn with_progress_rate(mut self, tick: Duration, step: u8) -> Self {
        self.tick = tick;
        self.step = step.max(1);
        self
    }

    /// Receiver for the current progress percentage.
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress_tx.subscribe()
    }

    /// Flash the image read from `image` and reconnect.
    pub async fn update<R>(&self, mut image: R) -> Result<(), FirmwareError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut bytes = Vec::new();
        image.read_to_end(&mut bytes).await?;
        if bytes.is_empty() {
            return Err(FirmwareError::InvalidImage {
                message: "image is empty".into(),
                recovered: self.session.state().is_connected(),
            });
        }

        // Nothing has been torn down if this fails.
        let endpoint = self.session.begin_flash().await.map_err(|source| {
            FirmwareError::Connection {
                source,
                recovered: self.session.state().is_connected(),
            }
        })?;

        info!(endpoint = %endpoint, size = bytes.len(), "starting firmware update");
        let mut driver = match self.session.open_flash_handle(&endpoint).await {
            Ok(driver) => driver,
            Err(source) => {
                warn!(error = %source, "could not open flash handle");
                let recovered = self.recover(&endpoint).await;
                return Err(FirmwareError::Connection { source, recovered });
            }
        };

        self.publish(0);
        let cancel = CancellationToken::new();
        let ticker = tokio::spawn(progress_ticker(
            self.progress_tx.clone(),
            self.session.clone(),
            self.tick,
            self.step,
            cancel.clone(),
        ));

        let flash = tokio::spawn(async move {
            let result = driver.flash_firmware(&bytes).await;
            if let Err(e) = driver.disconnect().await {
                debug!(error = %e, "flash handle disconnect failed");
            }
            result
        });

        let outcome = match flash.await {
            Ok(result) => result,
            Err(join) => Err(Error::FirmwareFlash(format!("flash worker failed: {join}"))),
        };
        cancel.cancel();
        let _ = ticker.await;

        match outcome {
            Ok(()) => {
                self.publish(100);
                info!("firmware flashed, reconnecting");
                self.reconnect(&endpoint)
                    .await
                    .map_err(FirmwareError::ReconnectFailed)
            }
            Err(e) => {
                let frozen = *self.progress_tx.borrow();
                error!(error = %e, progress = frozen, "firmware flash failed");
                let recovered = self.recover(&endpoint).await;
                Err(match e {
                    Error::InvalidFirmwareImage(message) => {
                        FirmwareError::InvalidImage { message, recovered }
                    }
                    Error::FirmwareFlash(message) => FirmwareError::FlashFailed { message, recovered },
                    other => FirmwareError::FlashFailed {
                        message: other.to_string(),
                        recovered,
                    },
                })
            }
        }
    }

    /// Lift the reservation and reconnect.
    async fn reconnect(&self, endpoint: &Endpoint) -> Result<(), Error> {
        self.session.finish_flash(endpoint).await.map(|_| ())
    }

    /// Reconnect after a failure. True when the reader is usable again.
    async fn recover(&self, endpoint: &Endpoint) -> bool {
        match self.reconnect(endpoint).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "reader not reachable after failed update");
                false
            }
        }
    }

    fn publish(&self, percent: u8) {
        self.progress_tx.send_replace(percent);
        self.session.emit(SessionEvent::FirmwareProgress { percent });
    }
}

/// Advance progress until cancelled, holding below 100.
async fn progress_ticker(
    progress: watch::Sender<u8>,
    session: SessionController,
    tick: Duration,
    step: u8,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = interval.tick() => {
                let current = *progress.borrow();
                let next = current.saturating_add(step).min(99);
                if next != current {
                    progress.send_replace(next);
                    session.emit(SessionEvent::FirmwareProgress { percent: next });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rfidlib_test_harness::{Fault, MockConnector};

    const URI: &str = "tmr:///dev/ttyUSB0";
    const IMAGE: &[u8] = b"TMFW-1.9.4-build-2231";

    async fn connected(mock: &MockConnector) -> SessionController {
        let session = SessionController::builder(Arc::new(mock.clone()))
            .build()
            .unwrap();
        session.connect(URI).await.unwrap();
        session
    }

    #[tokio::test]
    async fn empty_image_rejected_before_opening() {
        let mock = MockConnector::new("M6e");
        let session = connected(&mock).await;
        let updater = FirmwareUpdateController::new(session.clone());

        let err = updater.update(&b""[..]).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::InvalidImage {
                recovered: true,
                ..
            }
        ));
        assert_eq!(mock.open_calls(), 1);
        assert!(session.state().is_connected());
    }

    #[tokio::test]
    async fn update_requires_session() {
        let mock = MockConnector::new("M6e");
        let session = SessionController::builder(Arc::new(mock.clone()))
            .build()
            .unwrap();
        let updater = FirmwareUpdateController::new(session);
        let err = updater.update(IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Connection {
                source: Error::NotConnected,
                recovered: false
            }
        ));
        assert!(!err.recovered());
    }

    #[tokio::test]
    async fn successful_flash_reports_progress_and_reconnects() {
        let mock = MockConnector::new("M6e");
        mock.flash_delay(Duration::from_millis(60));
        let session = connected(&mock).await;
        let mut events = session.subscribe();
        let updater = FirmwareUpdateController::new(session.clone())
            .with_progress_rate(Duration::from_millis(5), 10);
        let progress = updater.progress();

        updater.update(IMAGE).await.unwrap();

        assert_eq!(mock.flashed_images(), vec![IMAGE.to_vec()]);
        assert_eq!(*progress.borrow(), 100);
        assert!(session.state().is_connected());
        // Initial connect, flash handle, reconnect.
        assert_eq!(mock.open_calls(), 3);

        let mut percents = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::FirmwareProgress { percent } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.iter().any(|p| (1..100).contains(p)));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn rejected_image_freezes_progress_and_recovers() {
        let mock = MockConnector::new("M6e");
        mock.flash_delay(Duration::from_millis(20));
        mock.fail_flash(Fault::InvalidImage);
        let session = connected(&mock).await;
        let updater = FirmwareUpdateController::new(session.clone())
            .with_progress_rate(Duration::from_millis(5), 10);
        let progress = updater.progress();

        let err = updater.update(IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::InvalidImage {
                recovered: true,
                ..
            }
        ));
        assert!(*progress.borrow() < 100);
        assert!(mock.flashed_images().is_empty());
        assert!(session.state().is_connected());
    }

    #[tokio::test]
    async fn flash_failure_is_reported_as_such() {
        let mock = MockConnector::new("M6e");
        mock.fail_flash(Fault::Flash);
        let session = connected(&mock).await;
        let updater = FirmwareUpdateController::new(session.clone());

        let err = updater.update(IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::FlashFailed {
                recovered: true,
                ..
            }
        ));
        assert!(err.to_string().contains("reader reconnected"));
    }

    #[tokio::test]
    async fn unreachable_flash_handle() {
        let mock = MockConnector::new("M6e");
        let session = connected(&mock).await;
        mock.fail_all_connects(Fault::Unreachable);
        let updater = FirmwareUpdateController::new(session.clone());

        let err = updater.update(IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Connection {
                source: Error::DeviceUnreachable(_),
                recovered: false
            }
        ));
        assert!(!err.recovered());
        assert!(!session.state().is_connected());
        assert!(mock.flashed_images().is_empty());
    }

    #[tokio::test]
    async fn transient_flash_handle_failure_reconnects() {
        let mock = MockConnector::new("M6e");
        let session = connected(&mock).await;
        mock.fail_connects(1, Fault::Unreachable);
        let updater = FirmwareUpdateController::new(session.clone());

        let err = updater.update(IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Connection {
                source: Error::DeviceUnreachable(_),
                recovered: true
            }
        ));
        assert!(err.recovered());
        assert!(session.state().is_connected());
        // Initial connect, failed flash handle, reconnect.
        assert_eq!(mock.connect_calls(), 3);
        assert!(mock.flashed_images().is_empty());
    }

    #[tokio::test]
    async fn session_is_reserved_while_flashing() {
        let mock = MockConnector::new("M6e");
        mock.flash_delay(Duration::from_millis(300));
        let session = connected(&mock).await;
        let other = session.clone();
        let updater = FirmwareUpdateController::new(session.clone());
        let flashing = tokio::spawn(async move { updater.update(IMAGE).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(other.connect(URI).await, Err(Error::Busy(_))));
        assert!(matches!(
            other.read_once(Duration::from_millis(10)).await,
            Err(Error::Busy(_))
        ));
        assert!(matches!(other.start_continuous().await, Err(Error::Busy(_))));

        let second = FirmwareUpdateController::new(other.clone());
        let err = second.update(IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Connection {
                source: Error::Busy(_),
                ..
            }
        ));

        flashing.await.unwrap().unwrap();
        assert_eq!(mock.flashed_images(), vec![IMAGE.to_vec()]);
        assert!(session.state().is_connected());
        // Initial connect, flash handle, reconnect.
        assert_eq!(mock.open_calls(), 3);
    }
}
