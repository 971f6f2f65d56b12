//! In-process channel backend.
//!
//! Mirrors POSIX queue semantics closely enough to drive the protocol without
//! an emulator: names live in a shared registry, queues are bounded, handles
//! survive `destroy` of their name, and a peer can inject or drain messages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::channel::{ChannelError, ChannelFactory, Direction, MessageChannel, Received};

/// Default queue depth, matching the Linux `mq_maxmsg` default.
pub const DEFAULT_CAPACITY: usize = 10;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct MemoryQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    capacity: usize,
}

impl MemoryQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, name: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let mut messages = lock(&self.messages);
        if messages.len() >= self.capacity {
            return Err(ChannelError::SendFailed {
                name: name.to_string(),
                reason: "peer queue is full".to_string(),
            });
        }
        messages.push_back(payload.to_vec());
        self.ready.notify_one();
        Ok(())
    }
}

struct Registry {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    failing: Mutex<HashSet<String>>,
    open_handles: AtomicUsize,
    capacity: usize,
}

impl Registry {
    /// The queue behind `name`, and whether this call created it.
    fn queue(&self, name: &str) -> (Arc<MemoryQueue>, bool) {
        let mut queues = lock(&self.queues);
        if let Some(existing) = queues.get(name) {
            return (Arc::clone(existing), false);
        }
        let queue = Arc::new(MemoryQueue::new(self.capacity));
        queues.insert(name.to_string(), Arc::clone(&queue));
        (queue, true)
    }
}

/// Shared registry of in-memory queues. Clones share the same registry.
#[derive(Clone)]
pub struct MemoryChannels {
    registry: Arc<Registry>,
}

impl Default for MemoryChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannels {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                queues: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                open_handles: AtomicUsize::new(0),
                capacity,
            }),
        }
    }

    /// Make every later `open` of `name` fail with `Unavailable`.
    pub fn fail_open(&self, name: &str) {
        lock(&self.registry.failing).insert(name.to_string());
    }

    /// Whether `name` currently exists (created and not destroyed).
    pub fn exists(&self, name: &str) -> bool {
        lock(&self.registry.queues).contains_key(name)
    }

    /// Handles opened through this registry that have not been closed yet.
    pub fn open_handles(&self) -> usize {
        self.registry.open_handles.load(Ordering::Acquire)
    }

    /// Write `payload` into `name` as the remote peer would.
    pub fn inject(&self, name: &str, payload: &[u8]) -> Result<(), ChannelError> {
        self.registry.queue(name).0.push(name, payload)
    }

    /// Remove and return everything queued on `name`, as the remote peer would.
    pub fn drain(&self, name: &str) -> Vec<Vec<u8>> {
        match lock(&self.registry.queues).get(name) {
            Some(queue) => lock(&queue.messages).drain(..).collect(),
            None => Vec::new(),
        }
    }
}

impl ChannelFactory for MemoryChannels {
    fn open(
        &self,
        name: &str,
        direction: Direction,
    ) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        if lock(&self.registry.failing).contains(name) {
            return Err(ChannelError::Unavailable {
                name: name.to_string(),
                reason: "open refused".to_string(),
            });
        }

        let (queue, created) = self.registry.queue(name);
        self.registry.open_handles.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(queue = %name, %direction, "Opened in-memory queue");

        Ok(Arc::new(MemoryChannel {
            name: name.to_string(),
            direction,
            queue,
            registry: Arc::clone(&self.registry),
            open: AtomicBool::new(true),
            created,
        }))
    }
}

struct MemoryChannel {
    name: String,
    direction: Direction,
    queue: Arc<MemoryQueue>,
    registry: Arc<Registry>,
    open: AtomicBool,
    created: bool,
}

impl MemoryChannel {
    fn release(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        if was_open {
            self.registry.open_handles.fetch_sub(1, Ordering::AcqRel);
        }
        was_open
    }
}

impl MessageChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn receive(&self, timeout: Duration) -> Result<Received, ChannelError> {
        if self.direction != Direction::Receive || !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::ReceiveFailed {
                name: self.name.clone(),
                reason: "queue is not readable".to_string(),
            });
        }

        let messages = lock(&self.queue.messages);
        let (mut messages, _) = match self
            .queue
            .ready
            .wait_timeout_while(messages, timeout, |m| m.is_empty())
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };

        Ok(match messages.pop_front() {
            Some(payload) => Received::Payload(payload),
            None => Received::Timeout,
        })
    }

    fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.direction != Direction::Send || !self.open.load(Ordering::Acquire) {
            return Err(ChannelError::SendFailed {
                name: self.name.clone(),
                reason: "queue is not writable".to_string(),
            });
        }
        self.queue.push(&self.name, payload)
    }

    fn close(&self) -> Result<(), ChannelError> {
        if self.release() {
            Ok(())
        } else {
            Err(ChannelError::AlreadyAbsent {
                name: self.name.clone(),
            })
        }
    }

    fn destroy(&self) -> Result<(), ChannelError> {
        let mut queues = lock(&self.registry.queues);
        match queues.get(&self.name) {
            Some(existing) if Arc::ptr_eq(existing, &self.queue) => {
                queues.remove(&self.name);
                Ok(())
            }
            _ => Err(ChannelError::AlreadyAbsent {
                name: self.name.clone(),
            }),
        }
    }

    fn created(&self) -> bool {
        self.created
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_reaches_receiver_in_order() {
        let channels = MemoryChannels::new();
        let rx = channels.open("/rx", Direction::Receive).unwrap();

        channels.inject("/rx", b"one").unwrap();
        channels.inject("/rx", b"two").unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(rx.receive(timeout).unwrap(), Received::Payload(b"one".to_vec()));
        assert_eq!(rx.receive(timeout).unwrap(), Received::Payload(b"two".to_vec()));
        assert_eq!(rx.receive(timeout).unwrap(), Received::Timeout);
    }

    #[test]
    fn receive_wakes_on_late_message() {
        let channels = MemoryChannels::new();
        let rx = channels.open("/late", Direction::Receive).unwrap();

        let peer = channels.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            peer.inject("/late", b"hello").unwrap();
        });

        let got = rx.receive(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        assert_eq!(got, Received::Payload(b"hello".to_vec()));
    }

    #[test]
    fn send_lands_in_peer_drain() {
        let channels = MemoryChannels::new();
        let tx = channels.open("/tx", Direction::Send).unwrap();

        tx.send(b"ack").unwrap();
        assert_eq!(channels.drain("/tx"), vec![b"ack".to_vec()]);
        assert!(channels.drain("/tx").is_empty());
    }

    #[test]
    fn full_queue_rejects_send() {
        let channels = MemoryChannels::with_capacity(1);
        let tx = channels.open("/tx", Direction::Send).unwrap();

        tx.send(b"first").unwrap();
        assert!(matches!(
            tx.send(b"second"),
            Err(ChannelError::SendFailed { .. })
        ));
    }

    #[test]
    fn close_and_destroy_are_idempotent() {
        let channels = MemoryChannels::new();
        let rx = channels.open("/rx", Direction::Receive).unwrap();
        assert_eq!(channels.open_handles(), 1);
        assert!(channels.exists("/rx"));

        rx.destroy().unwrap();
        assert!(!channels.exists("/rx"));
        assert!(rx.destroy().unwrap_err().is_already_absent());

        rx.close().unwrap();
        assert_eq!(channels.open_handles(), 0);
        assert!(rx.close().unwrap_err().is_already_absent());
    }

    #[test]
    fn first_opener_creates_the_name() {
        let channels = MemoryChannels::new();
        let rx = channels.open("/rx", Direction::Receive).unwrap();
        let tx = channels.open("/rx", Direction::Send).unwrap();
        assert!(rx.created());
        assert!(!tx.created());

        channels.inject("/peer", b"early").unwrap();
        let late = channels.open("/peer", Direction::Receive).unwrap();
        assert!(!late.created());
    }

    #[test]
    fn fail_open_refuses_name() {
        let channels = MemoryChannels::new();
        channels.fail_open("/broken");
        assert!(matches!(
            channels.open("/broken", Direction::Send),
            Err(ChannelError::Unavailable { .. })
        ));
        assert_eq!(channels.open_handles(), 0);
    }

    #[test]
    fn dropping_handle_releases_it() {
        let channels = MemoryChannels::new();
        let tx = channels.open("/tx", Direction::Send).unwrap();
        assert_eq!(channels.open_handles(), 1);
        drop(tx);
        assert_eq!(channels.open_handles(), 0);
    }
}
