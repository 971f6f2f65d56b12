//! Protocol tuning knobs.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::channel::{ChannelFactory, default_channels};
use crate::error::{ProtocolError, Result};

/// Bound for each receive on the inbound queue, and hence for shutdown latency.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Longest the listener waits for room in the orchestrator queue per event.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_millis(250);

/// Consecutive undecodable or failed reads before the inbound queue is given up on.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 32;

#[derive(Clone)]
pub struct ProtocolConfig {
    pub poll_interval: Duration,
    pub push_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub channels: Arc<dyn ChannelFactory>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            channels: default_channels(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// Zero disables the limit.
    pub fn with_max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn with_channels(mut self, channels: Arc<dyn ChannelFactory>) -> Self {
        self.channels = channels;
        self
    }

    /// Reject settings the listener cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ProtocolError::InvalidConfig {
                reason: "poll interval must be non-zero",
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolConfig")
            .field("poll_interval", &self.poll_interval)
            .field("push_timeout", &self.push_timeout)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .finish_non_exhaustive()
    }
}
