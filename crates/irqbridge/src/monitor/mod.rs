//! Emulator command interface.
//!
//! The protocol only needs to issue named commands with a JSON argument object
//! and wait for the emulator to acknowledge them. [`qmp::QmpMonitor`] speaks
//! the QEMU Machine Protocol; tests substitute a recording fake.

pub mod qmp;

use async_trait::async_trait;

pub use qmp::QmpMonitor;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("monitor protocol error: {0}")]
    Protocol(String),
    #[error("command rejected ({class}): {desc}")]
    Command { class: String, desc: String },
    #[error("monitor connection closed")]
    Closed,
}

/// Synchronous remote-command channel to an emulator.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Execute `command` and wait for its acknowledgement, returning the reply payload.
    async fn execute_command(
        &self,
        command: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, MonitorError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Records every command and answers with an empty object.
    #[derive(Default)]
    pub struct RecordingMonitor {
        calls: Mutex<Vec<(String, serde_json::Value)>>,
        reject: Mutex<Option<String>>,
    }

    impl RecordingMonitor {
        pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
            self.calls.lock().unwrap().clone()
        }

        /// Reject `command` with a `GenericError`.
        pub fn reject(&self, command: &str) {
            *self.reject.lock().unwrap() = Some(command.to_string());
        }
    }

    #[async_trait]
    impl Monitor for RecordingMonitor {
        async fn execute_command(
            &self,
            command: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, MonitorError> {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_string(), arguments));
            if self.reject.lock().unwrap().as_deref() == Some(command) {
                return Err(MonitorError::Command {
                    class: "GenericError".to_string(),
                    desc: format!("{command} is not available"),
                });
            }
            Ok(serde_json::json!({}))
        }
    }
}
