//! ARMv7-M interrupt protocol - lifecycle of one forwarding session per target.
//!
//! Flow:
//! 1. Ask the emulator to forward interrupts over our queue pair
//! 2. Open the inbound queue, then the outbound one (rolling back on failure)
//! 3. Start the exit listener
//! 4. Acknowledge exits / inject interrupts on the orchestrator's schedule
//! 5. On shutdown: stop the listener, then unlink and close both queues

use std::sync::Arc;

use serde::Serialize;

use crate::bridge::channel::{Direction, MessageChannel, tolerate_absent};
use crate::bridge::wire::ExitResponse;
use crate::commands::InterruptCommands;
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::events::EventQueue;
use crate::listener::{ExitListener, ListenerReport, ListenerSettings};
use crate::target::{QueuePair, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Created,
    Enabling,
    Running,
    Stopping,
    Stopped,
}

impl ProtocolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Enabling => "enabling",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interrupt forwarding session between the orchestrator and one emulated core.
///
/// Two jobs:
/// - relay interrupt exits from the core to the orchestrator's event queue, so
///   that two targets can be kept in sync on interrupt return
/// - inject interrupts into the core on request
///
/// The ARMv7-M NVIC returns from an interrupt when a magic EXC_RETURN value
/// is loaded into `pc`; that value selects the kind of return, so it travels
/// with every exit alongside the interrupt number.
pub struct InterruptProtocol {
    target: Arc<dyn Target>,
    commands: InterruptCommands,
    events: Arc<dyn EventQueue>,
    queues: QueuePair,
    config: ProtocolConfig,
    state: ProtocolState,
    rx: Option<Arc<dyn MessageChannel>>,
    tx: Option<Arc<dyn MessageChannel>>,
    listener: Option<ExitListener>,
}

impl InterruptProtocol {
    /// `queues` are named from this side: exits arrive on `rx`, responses leave on `tx`.
    pub fn new(
        target: Arc<dyn Target>,
        events: Arc<dyn EventQueue>,
        queues: QueuePair,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            commands: InterruptCommands::new(Arc::clone(&target)),
            target,
            events,
            queues,
            config,
            state: ProtocolState::Created,
            rx: None,
            tx: None,
            listener: None,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn queues(&self) -> &QueuePair {
        &self.queues
    }

    pub fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }

    /// Whether the exit listener is alive. It can end on its own if the
    /// inbound queue turns out to be unrecoverable.
    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    /// Enable interrupt forwarding and start relaying exits.
    ///
    /// Queue failures leave the protocol in `Created` with nothing left open,
    /// so the call may be retried. `UnsupportedTarget` is reported before any
    /// command is issued or queue opened.
    pub async fn enable(&mut self) -> Result<()> {
        if self.state != ProtocolState::Created {
            return Err(ProtocolError::InvalidState {
                operation: "enable",
                state: self.state,
            });
        }
        self.config.validate()?;
        self.commands.remote_memory()?;

        self.state = ProtocolState::Enabling;
        match self.try_enable().await {
            Ok(()) => {
                self.state = ProtocolState::Running;
                tracing::info!(
                    target_name = %self.target.name(),
                    rx = %self.queues.rx,
                    tx = %self.queues.tx,
                    "Enabled interrupt forwarding"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ProtocolState::Created;
                Err(e)
            }
        }
    }

    async fn try_enable(&mut self) -> Result<()> {
        self.commands.enable_forwarding(&self.queues).await?;

        let channels = Arc::clone(&self.config.channels);
        let rx = channels
            .open(&self.queues.rx, Direction::Receive)
            .map_err(|e| {
                tracing::error!(error = %e, "Unable to create rx queue");
                ProtocolError::from(e)
            })?;

        let tx = match channels.open(&self.queues.tx, Direction::Send) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!(error = %e, "Unable to create tx queue");
                if let Err(close_err) = tolerate_absent(rx.close()) {
                    tracing::warn!(error = %close_err, "Failed to close rx queue during rollback");
                }
                // A name the emulator created stays; it is the emulator's to remove.
                if rx.created() {
                    if let Err(unlink_err) = tolerate_absent(rx.destroy()) {
                        tracing::warn!(error = %unlink_err, "Failed to unlink rx queue during rollback");
                    }
                }
                return Err(e.into());
            }
        };

        let listener = ExitListener::spawn(
            self.target.name(),
            Arc::clone(&rx),
            Arc::clone(&self.events),
            ListenerSettings::from(&self.config),
        );

        self.rx = Some(rx);
        self.tx = Some(tx);
        self.listener = Some(listener);
        Ok(())
    }

    /// Raise interrupt `irq` on virtual CPU `cpu` of the target.
    pub async fn inject_interrupt(&self, irq: u32, cpu: u32) -> Result<()> {
        self.commands.inject_interrupt(irq, cpu).await
    }

    /// Acknowledge the exit identified by `id`. Not retried on failure.
    pub fn send_interrupt_exit_response(&self, id: u64, success: bool) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| ProtocolError::SendFailed {
            name: self.queues.tx.clone(),
            reason: format!("queue is not open ({})", self.state),
        })?;

        tx.send(&ExitResponse::new(id, success).encode())
            .map_err(|e| {
                tracing::error!(id, error = %e, "Unable to send interrupt exit response");
                ProtocolError::from(e)
            })?;

        tracing::debug!(id, success, "Sent interrupt exit response");
        Ok(())
    }

    /// Stop the exit listener and wait for it, keeping the queues.
    ///
    /// Returns the listener's report, or `None` if no listener was running.
    pub async fn stop(&mut self) -> Option<ListenerReport> {
        let listener = self.listener.take()?;
        if self.state == ProtocolState::Running {
            self.state = ProtocolState::Stopping;
        }

        let report = listener.stop().await;
        tracing::info!(
            target_name = %self.target.name(),
            exit = ?report.exit,
            forwarded = report.stats.forwarded,
            malformed = report.stats.malformed,
            dropped = report.stats.dropped,
            "Exit listener stopped"
        );
        Some(report)
    }

    /// Stop the listener and release both queues.
    ///
    /// Safe to call repeatedly and without a prior successful `enable`.
    /// Teardown errors are logged, never returned.
    pub async fn shutdown(&mut self) -> Option<ListenerReport> {
        if self.state == ProtocolState::Stopped {
            return None;
        }

        let report = self.stop().await;
        self.state = ProtocolState::Stopping;

        for channel in [self.rx.take(), self.tx.take()].into_iter().flatten() {
            teardown(channel.as_ref());
        }

        self.state = ProtocolState::Stopped;
        tracing::debug!(target_name = %self.target.name(), "Interrupt protocol shut down");
        report
    }
}

/// Unlink then close, each step independently; absence counts as done.
fn teardown(channel: &dyn MessageChannel) {
    let steps = [
        ("unlink", tolerate_absent(channel.destroy())),
        ("close", tolerate_absent(channel.close())),
    ];
    for (step, result) in steps {
        if let Err(e) = result {
            tracing::warn!(queue = %channel.name(), step, error = %e, "Queue teardown step failed");
        }
    }
}

impl Drop for InterruptProtocol {
    fn drop(&mut self) {
        if self.state == ProtocolState::Stopped {
            return;
        }
        // Cannot await here: signal the listener and unlink the names; the
        // handles close once the listener lets go of them.
        if let Some(listener) = self.listener.take() {
            listener.signal_stop();
        }
        for channel in [self.rx.take(), self.tx.take()].into_iter().flatten() {
            if let Err(e) = tolerate_absent(channel.destroy()) {
                tracing::warn!(queue = %channel.name(), error = %e, "Failed to unlink queue on drop");
            }
        }
    }
}
