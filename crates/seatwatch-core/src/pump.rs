//! The single background reader that feeds a facility's subscriptions.
//!
//! Each facility owns one [`SignalPump`]. It is the only caller of its
//! handler's [`SignalHandler::handle`], so dispatch never runs concurrently
//! with itself. The pump stops when:
//! - the facility cancels it (close), or the pump handle is dropped,
//! - the transport's signal stream ends (treated as a close already in effect),
//! - the handler reports a [`ProtocolViolation`]. The violation is kept and
//!   exposed through [`SignalPump::fault`]; no further signals are delivered.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::Signal;
use crate::error::{Error, ProtocolViolation, Result};

/// Routes one incoming signal to the listeners that asked for it.
#[async_trait]
pub trait SignalHandler: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns a `ProtocolViolation` if the signal matched but its body
    /// did not have the expected shape.
    async fn handle(&self, signal: Signal) -> std::result::Result<(), ProtocolViolation>;
}

/// Handle to a running signal reader task.
#[derive(Debug)]
pub struct SignalPump {
    cancel: CancellationToken,
    fault: Arc<OnceLock<ProtocolViolation>>,
}

impl SignalPump {
    /// Spawns the reader task on the current tokio runtime.
    ///
    /// `name` only labels log output.
    pub fn spawn<H: SignalHandler>(
        name: &'static str,
        mut signals: mpsc::Receiver<Signal>,
        handler: Arc<H>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let fault = Arc::new(OnceLock::new());

        let task_cancel = cancel.clone();
        let task_fault = Arc::clone(&fault);
        tokio::spawn(async move {
            info!(facility = name, "Signal reader starting");

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!(facility = name, "Signal reader cancelled");
                        break;
                    }

                    signal = signals.recv() => {
                        let Some(signal) = signal else {
                            debug!(facility = name, "Signal stream ended");
                            break;
                        };

                        if let Err(violation) = handler.handle(signal).await {
                            error!(
                                facility = name,
                                signal = %violation.signal,
                                detail = %violation.detail,
                                "Protocol violation, signal reader stopping"
                            );
                            let _ = task_fault.set(violation);
                            break;
                        }
                    }
                }
            }

            // Receiver is dropped here, which unhooks it from the transport.
            task_cancel.cancel();
            info!(facility = name, "Signal reader stopped");
        });

        Self { cancel, fault }
    }

    /// Asks the reader to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// True once the reader has been asked to stop or has stopped on its own.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The violation that stopped the reader, if any.
    pub fn fault(&self) -> Option<ProtocolViolation> {
        self.fault.get().cloned()
    }

    /// Fails unless the reader is still running.
    ///
    /// # Errors
    ///
    /// - `Error::Faulted` carrying the recorded violation
    /// - `Error::ChannelClosed` if the reader was stopped or its stream ended
    pub fn ensure_running(&self) -> Result<()> {
        if let Some(violation) = self.fault.get() {
            return Err(Error::Faulted(violation.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    /// Token cancelled when the reader stops for any reason.
    pub fn stopped(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SignalPump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
