//! irqbridge: interrupt forwarding between an orchestrator and an emulated ARMv7-M core.

pub mod bridge;
pub mod commands;
mod config;
mod error;
pub mod events;
pub mod listener;
pub mod monitor;
mod protocol;
pub mod target;

pub use bridge::channel::{ChannelError, ChannelFactory, Direction, MessageChannel, Received};
pub use bridge::memory::MemoryChannels;
pub use bridge::wire::{DecodeError, ExitRequest, ExitResponse};
pub use config::{
    DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_POLL_INTERVAL, DEFAULT_PUSH_TIMEOUT, ProtocolConfig,
};
pub use error::{ProtocolError, Result};
pub use events::{EventQueue, ForwardedExitEvent, QueueClosed};
pub use listener::{ListenerExit, ListenerReport, ListenerStats};
pub use monitor::{Monitor, MonitorError, QmpMonitor};
pub use protocol::{InterruptProtocol, ProtocolState};
pub use target::{EmulatorTarget, QueuePair, Target, TargetKind, UnknownTargetKind};
