//! Named, unidirectional message channels shared with the emulator.
//!
//! Backends:
//! - **PosixChannels**: POSIX message queues (Linux), the transport the emulator speaks
//! - **MemoryChannels**: in-process queues (see [`super::memory`])

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which way bytes flow through a channel, from this side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Receive,
    Send,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Receive => f.write_str("receive"),
            Self::Send => f.write_str("send"),
        }
    }
}

/// Outcome of a bounded-wait receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Payload(Vec<u8>),
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },
    #[error("send on {name} failed: {reason}")]
    SendFailed { name: String, reason: String },
    #[error("receive on {name} failed: {reason}")]
    ReceiveFailed { name: String, reason: String },
    #[error("channel {name} is already absent")]
    AlreadyAbsent { name: String },
}

impl ChannelError {
    pub fn is_already_absent(&self) -> bool {
        matches!(self, Self::AlreadyAbsent { .. })
    }
}

/// One end of a named channel.
///
/// `close` releases this handle, `destroy` removes the name from the system.
/// Both are idempotent: repeating either reports [`ChannelError::AlreadyAbsent`].
pub trait MessageChannel: Send + Sync {
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Wait at most `timeout` for one message. Never blocks indefinitely.
    fn receive(&self, timeout: Duration) -> Result<Received, ChannelError>;

    /// Send one message without waiting for room in the peer's queue.
    fn send(&self, payload: &[u8]) -> Result<(), ChannelError>;

    fn close(&self) -> Result<(), ChannelError>;

    fn destroy(&self) -> Result<(), ChannelError>;

    /// Whether opening this handle created the name, as opposed to attaching
    /// to one the peer had already created.
    fn created(&self) -> bool;
}

/// Creates or attaches to named channels.
///
/// Extension point for swapping the IPC mechanism (and for tests).
pub trait ChannelFactory: Send + Sync {
    fn open(
        &self,
        name: &str,
        direction: Direction,
    ) -> Result<Arc<dyn MessageChannel>, ChannelError>;
}

/// Collapse an `AlreadyAbsent` teardown outcome into success, logging it.
pub fn tolerate_absent(result: Result<(), ChannelError>) -> Result<(), ChannelError> {
    match result {
        Err(ChannelError::AlreadyAbsent { name }) => {
            tracing::warn!(queue = %name, "Tried to close/unlink non-existent queue");
            Ok(())
        }
        other => other,
    }
}

/// Platform default backend.
pub fn default_channels() -> Arc<dyn ChannelFactory> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(posix::PosixChannels)
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(super::memory::MemoryChannels::new())
    }
}

#[cfg(target_os = "linux")]
pub use posix::{PosixChannels, PosixQueue};

#[cfg(target_os = "linux")]
mod posix {
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use nix::errno::Errno;
    use nix::mqueue::{
        MQ_OFlag, MqAttr, MqdT, mq_attr_member_t, mq_close, mq_getattr, mq_open, mq_send,
        mq_timedreceive, mq_unlink,
    };
    use nix::sys::stat::Mode;
    use nix::sys::time::TimeSpec;

    use super::{ChannelError, ChannelFactory, Direction, MessageChannel, Received};
    use crate::bridge::wire::ExitRequest;

    /// Depth of queues created by this side (Linux `msg_max` default).
    const QUEUE_DEPTH: mq_attr_member_t = 10;

    /// Message size of queues created by this side (Linux `msgsize_max` default).
    const QUEUE_MSG_SIZE: mq_attr_member_t = 8192;

    /// POSIX message queue backend.
    ///
    /// Queues are created on demand so that whichever side opens first wins the
    /// creation race; the loser attaches to the existing queue.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PosixChannels;

    impl ChannelFactory for PosixChannels {
        fn open(
            &self,
            name: &str,
            direction: Direction,
        ) -> Result<Arc<dyn MessageChannel>, ChannelError> {
            Ok(Arc::new(PosixQueue::open(name, direction)?))
        }
    }

    pub struct PosixQueue {
        name: String,
        direction: Direction,
        mqd: Mutex<Option<MqdT>>,
        msg_size: usize,
        created: bool,
    }

    impl PosixQueue {
        pub fn open(name: &str, direction: Direction) -> Result<Self, ChannelError> {
            let access = match direction {
                Direction::Receive => MQ_OFlag::O_RDONLY,
                // Never stall the caller on a full peer queue.
                Direction::Send => MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK,
            };
            let access = access | MQ_OFlag::O_CLOEXEC;
            let mode = Mode::S_IRUSR | Mode::S_IWUSR;
            let unavailable = |e: Errno| ChannelError::Unavailable {
                name: name.to_string(),
                reason: e.desc().to_string(),
            };

            // O_CREAT needs explicit attributes: without them the mode is not
            // passed to mq_open at all.
            let attr = MqAttr::new(0, QUEUE_DEPTH, QUEUE_MSG_SIZE, 0);
            let exclusive = access | MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL;
            let (mqd, created) = match mq_open(name, exclusive, mode, Some(&attr)) {
                Ok(mqd) => (mqd, true),
                Err(Errno::EEXIST) => (
                    mq_open(name, access, Mode::empty(), None).map_err(unavailable)?,
                    false,
                ),
                Err(e) => return Err(unavailable(e)),
            };

            let attr = match mq_getattr(&mqd) {
                Ok(attr) => attr,
                Err(e) => {
                    let _ = mq_close(mqd);
                    return Err(ChannelError::Unavailable {
                        name: name.to_string(),
                        reason: format!("mq_getattr: {}", e.desc()),
                    });
                }
            };
            let msg_size = usize::try_from(attr.msgsize())
                .unwrap_or(ExitRequest::WIRE_SIZE)
                .max(ExitRequest::WIRE_SIZE);

            tracing::debug!(queue = %name, %direction, msg_size, created, "Opened message queue");

            Ok(Self {
                name: name.to_string(),
                direction,
                mqd: Mutex::new(Some(mqd)),
                msg_size,
                created,
            })
        }

        fn lock(&self) -> MutexGuard<'_, Option<MqdT>> {
            match self.mqd.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::error!(queue = %self.name, "Queue descriptor mutex poisoned");
                    poisoned.into_inner()
                }
            }
        }
    }

    impl MessageChannel for PosixQueue {
        fn name(&self) -> &str {
            &self.name
        }

        fn direction(&self) -> Direction {
            self.direction
        }

        fn receive(&self, timeout: Duration) -> Result<Received, ChannelError> {
            let failed = |reason: &str| ChannelError::ReceiveFailed {
                name: self.name.clone(),
                reason: reason.to_string(),
            };
            if self.direction != Direction::Receive {
                return Err(failed("queue is write-only"));
            }

            let guard = self.lock();
            let mqd = guard.as_ref().ok_or_else(|| failed("queue is closed"))?;

            // mq_timedreceive takes an absolute CLOCK_REALTIME deadline.
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let deadline = TimeSpec::from_duration(now + timeout);

            let mut buf = vec![0u8; self.msg_size];
            let mut priority = 0u32;
            match mq_timedreceive(mqd, &mut buf, &mut priority, &deadline) {
                Ok(len) => {
                    buf.truncate(len);
                    Ok(Received::Payload(buf))
                }
                Err(Errno::ETIMEDOUT) | Err(Errno::EINTR) => Ok(Received::Timeout),
                Err(e) => Err(failed(e.desc())),
            }
        }

        fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
            let failed = |reason: &str| ChannelError::SendFailed {
                name: self.name.clone(),
                reason: reason.to_string(),
            };
            if self.direction != Direction::Send {
                return Err(failed("queue is read-only"));
            }

            let guard = self.lock();
            let mqd = guard.as_ref().ok_or_else(|| failed("queue is closed"))?;
            match mq_send(mqd, payload, 0) {
                Ok(()) => Ok(()),
                Err(Errno::EAGAIN) => Err(failed("peer queue is full")),
                Err(e) => Err(failed(e.desc())),
            }
        }

        fn close(&self) -> Result<(), ChannelError> {
            let mqd = self.lock().take().ok_or_else(|| ChannelError::AlreadyAbsent {
                name: self.name.clone(),
            })?;
            match mq_close(mqd) {
                Ok(()) => Ok(()),
                Err(Errno::EBADF) => Err(ChannelError::AlreadyAbsent {
                    name: self.name.clone(),
                }),
                Err(e) => Err(ChannelError::Unavailable {
                    name: self.name.clone(),
                    reason: format!("mq_close: {}", e.desc()),
                }),
            }
        }

        fn destroy(&self) -> Result<(), ChannelError> {
            match mq_unlink(self.name.as_str()) {
                Ok(()) => {
                    tracing::debug!(queue = %self.name, "Unlinked message queue");
                    Ok(())
                }
                Err(Errno::ENOENT) => Err(ChannelError::AlreadyAbsent {
                    name: self.name.clone(),
                }),
                Err(e) => Err(ChannelError::Unavailable {
                    name: self.name.clone(),
                    reason: format!("mq_unlink: {}", e.desc()),
                }),
            }
        }

        fn created(&self) -> bool {
            self.created
        }
    }

    impl Drop for PosixQueue {
        fn drop(&mut self) {
            if let Some(mqd) = self.lock().take() {
                if let Err(e) = mq_close(mqd) {
                    tracing::warn!(queue = %self.name, error = %e, "Failed to close message queue");
                }
            }
        }
    }
}
