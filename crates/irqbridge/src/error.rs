use crate::bridge::channel::ChannelError;
use crate::bridge::wire::DecodeError;
use crate::monitor::MonitorError;
use crate::protocol::ProtocolState;
use crate::target::TargetKind;

/// Errors surfaced by [`InterruptProtocol`](crate::InterruptProtocol).
///
/// `ChannelUnavailable` and `SendFailed` are recoverable outcomes the caller is
/// expected to handle; `UnsupportedTarget`, `InvalidConfig` and `InvalidState` indicate a
/// programming or configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("queue {name} unavailable: {reason}")]
    ChannelUnavailable { name: String, reason: String },

    #[error(transparent)]
    MalformedMessage(#[from] DecodeError),

    #[error("unable to send on queue {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("interrupt forwarding is not implemented for target {target} ({kind})")]
    UnsupportedTarget { target: String, kind: TargetKind },

    #[error("queue {name} is already absent")]
    AlreadyAbsent { name: String },

    #[error("monitor command {command} failed: {source}")]
    Monitor {
        command: &'static str,
        #[source]
        source: MonitorError,
    },

    #[error("invalid protocol configuration: {reason}")]
    InvalidConfig { reason: &'static str },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ProtocolState,
    },
}

impl From<ChannelError> for ProtocolError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Unavailable { name, reason } => Self::ChannelUnavailable { name, reason },
            ChannelError::SendFailed { name, reason } => Self::SendFailed { name, reason },
            ChannelError::ReceiveFailed { name, reason } => {
                Self::ChannelUnavailable { name, reason }
            }
            ChannelError::AlreadyAbsent { name } => Self::AlreadyAbsent { name },
        }
    }
}

impl ProtocolError {
    /// Whether the caller may retry or carry on (as opposed to a misconfiguration).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable { .. }
                | Self::MalformedMessage(_)
                | Self::SendFailed { .. }
                | Self::AlreadyAbsent { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
