//! Remote commands understood by the emulator's ARMv7-M interrupt support.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ProtocolError;
use crate::target::{QueuePair, Target};

pub const ENABLE_IRQ_COMMAND: &str = "avatar-armv7m-enable-irq";
pub const INJECT_IRQ_COMMAND: &str = "avatar-armv7m-inject-irq";

/// Arguments of [`ENABLE_IRQ_COMMAND`], named from the emulator's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableIrqArgs {
    pub irq_rx_queue_name: String,
    pub irq_tx_queue_name: String,
    pub rmem_rx_queue_name: String,
    pub rmem_tx_queue_name: String,
}

impl EnableIrqArgs {
    /// Build the arguments from this side's queue names.
    ///
    /// What we send on, the emulator receives on, and vice versa; the same
    /// holds for the remote-memory pair.
    pub fn from_local(irq: &QueuePair, remote_memory: &QueuePair) -> Self {
        let irq = irq.reversed();
        let rmem = remote_memory.reversed();
        Self {
            irq_rx_queue_name: irq.rx,
            irq_tx_queue_name: irq.tx,
            rmem_rx_queue_name: rmem.rx,
            rmem_tx_queue_name: rmem.tx,
        }
    }

    pub fn to_arguments(&self) -> serde_json::Value {
        json!({
            "irq_rx_queue_name": self.irq_rx_queue_name,
            "irq_tx_queue_name": self.irq_tx_queue_name,
            "rmem_rx_queue_name": self.rmem_rx_queue_name,
            "rmem_tx_queue_name": self.rmem_tx_queue_name,
        })
    }
}

/// Arguments of [`INJECT_IRQ_COMMAND`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectIrqArgs {
    pub num_irq: u32,
    pub num_cpu: u32,
}

impl InjectIrqArgs {
    pub fn to_arguments(&self) -> serde_json::Value {
        json!({ "num_irq": self.num_irq, "num_cpu": self.num_cpu })
    }
}

/// Issues the interrupt commands on a target's monitor.
pub struct InterruptCommands {
    target: Arc<dyn Target>,
}

impl InterruptCommands {
    pub fn new(target: Arc<dyn Target>) -> Self {
        Self { target }
    }

    /// Remote-memory queues of the target, or `UnsupportedTarget`.
    pub fn remote_memory(&self) -> Result<QueuePair, ProtocolError> {
        let kind = self.target.kind();
        let unsupported = || ProtocolError::UnsupportedTarget {
            target: self.target.name().to_string(),
            kind,
        };
        if !kind.supports_interrupt_forwarding() {
            return Err(unsupported());
        }
        self.target.interrupt_forwarding().ok_or_else(unsupported)
    }

    /// Ask the emulator to start forwarding interrupt exits over `irq`.
    pub async fn enable_forwarding(&self, irq: &QueuePair) -> Result<(), ProtocolError> {
        let remote_memory = self.remote_memory()?;
        let args = EnableIrqArgs::from_local(irq, &remote_memory);

        tracing::debug!(
            target_name = %self.target.name(),
            irq_rx = %irq.rx,
            irq_tx = %irq.tx,
            "Enabling interrupt forwarding"
        );
        self.target
            .monitor()
            .execute_command(ENABLE_IRQ_COMMAND, args.to_arguments())
            .await
            .map_err(|source| ProtocolError::Monitor {
                command: ENABLE_IRQ_COMMAND,
                source,
            })?;
        Ok(())
    }

    /// Raise interrupt `irq` on virtual CPU `cpu`.
    ///
    /// There is no acknowledgement beyond command success; the resulting
    /// handler shows up later as a forwarded exit.
    pub async fn inject_interrupt(&self, irq: u32, cpu: u32) -> Result<(), ProtocolError> {
        let kind = self.target.kind();
        if !kind.supports_interrupt_forwarding() {
            return Err(ProtocolError::UnsupportedTarget {
                target: self.target.name().to_string(),
                kind,
            });
        }

        tracing::info!(irq, cpu, target_name = %self.target.name(), "Injecting interrupt");
        let args = InjectIrqArgs {
            num_irq: irq,
            num_cpu: cpu,
        };
        self.target
            .monitor()
            .execute_command(INJECT_IRQ_COMMAND, args.to_arguments())
            .await
            .map_err(|source| ProtocolError::Monitor {
                command: INJECT_IRQ_COMMAND,
                source,
            })?;
        Ok(())
    }
}
