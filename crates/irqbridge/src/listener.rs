//! Exit listener - relays interrupt exits from the inbound queue to the orchestrator.
//!
//! Flow, once per poll interval:
//! 1. Check the stop signal
//! 2. Bounded receive on the inbound queue (on the blocking pool)
//! 3. Decode the exit request; malformed payloads are dropped
//! 4. Push a [`ForwardedExitEvent`] with a bounded wait
//!
//! A single task per target keeps exits in receive order.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::channel::{ChannelError, MessageChannel, Received};
use crate::bridge::wire::ExitRequest;
use crate::config::ProtocolConfig;
use crate::events::{EventQueue, ForwardedExitEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub poll_interval: Duration,
    pub push_timeout: Duration,
    /// Zero disables the limit.
    pub max_consecutive_failures: u32,
}

impl From<&ProtocolConfig> for ListenerSettings {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            push_timeout: config.push_timeout,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// Per-listener counters, reported when the listener is joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub forwarded: u64,
    pub malformed: u64,
    /// Decoded exits that could not be handed to the orchestrator in time.
    pub dropped: u64,
    pub receive_errors: u64,
}

/// Why the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ListenerExit {
    Stopped,
    /// Too many consecutive unusable reads; the queue cannot be trusted anymore.
    ChannelCorrupted { consecutive_failures: u32 },
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerReport {
    pub exit: ListenerExit,
    pub stats: ListenerStats,
}

/// Handle to the running listener task.
pub struct ExitListener {
    cancel: CancellationToken,
    handle: JoinHandle<ListenerReport>,
}

impl ExitListener {
    pub fn spawn(
        origin: impl Into<String>,
        rx: Arc<dyn MessageChannel>,
        events: Arc<dyn EventQueue>,
        settings: ListenerSettings,
    ) -> Self {
        let origin = origin.into();
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("exit_listener", target_name = %origin, queue = %rx.name());

        let handle = tokio::spawn(
            run_listener(origin, rx, events, settings, cancel.clone()).instrument(span),
        );

        Self { cancel, handle }
    }

    /// Signal the listener without waiting for it.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    /// True once the task has exited (stopped or given up on the queue).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the listener and wait until it has observably stopped.
    ///
    /// Returns after at most one poll interval plus one push timeout.
    pub async fn stop(self) -> ListenerReport {
        self.cancel.cancel();
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Exit listener task failed");
                ListenerReport {
                    exit: ListenerExit::Panicked,
                    stats: ListenerStats::default(),
                }
            }
        }
    }
}

async fn run_listener(
    origin: String,
    rx: Arc<dyn MessageChannel>,
    events: Arc<dyn EventQueue>,
    settings: ListenerSettings,
    cancel: CancellationToken,
) -> ListenerReport {
    let mut stats = ListenerStats::default();
    let mut consecutive_failures: u32 = 0;

    tracing::debug!("Exit listener started");

    while !cancel.is_cancelled() {
        let channel = Arc::clone(&rx);
        let poll_interval = settings.poll_interval;
        let received = tokio::task::spawn_blocking(move || channel.receive(poll_interval))
            .await
            .unwrap_or_else(|e| {
                Err(ChannelError::ReceiveFailed {
                    name: rx.name().to_string(),
                    reason: format!("receive task failed: {}", e),
                })
            });

        match received {
            Ok(Received::Timeout) => continue,
            Ok(Received::Payload(bytes)) => match ExitRequest::decode(&bytes) {
                Ok(request) => {
                    consecutive_failures = 0;
                    tracing::debug!(
                        irq = request.irq_number,
                        return_type = format_args!("{:#x}", request.return_type),
                        id = request.id,
                        "Received an interrupt exit request"
                    );
                    let event = ForwardedExitEvent::from_request(origin.as_str(), &request);
                    match tokio::time::timeout(settings.push_timeout, events.put(event)).await {
                        Ok(Ok(())) => stats.forwarded += 1,
                        Ok(Err(e)) => {
                            stats.dropped += 1;
                            tracing::error!(id = request.id, error = %e, "Dropping interrupt exit");
                        }
                        Err(_) => {
                            stats.dropped += 1;
                            tracing::error!(
                                id = request.id,
                                timeout_ms = settings.push_timeout.as_millis() as u64,
                                "Event queue full, dropping interrupt exit"
                            );
                        }
                    }
                }
                Err(e) => {
                    stats.malformed += 1;
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::warn!(error = %e, consecutive_failures, "Dropping malformed exit request");
                }
            },
            Err(e) => {
                stats.receive_errors += 1;
                consecutive_failures = consecutive_failures.saturating_add(1);
                tracing::warn!(error = %e, consecutive_failures, "Receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(settings.poll_interval / 10) => {}
                }
            }
        }

        let limit = settings.max_consecutive_failures;
        if limit > 0 && consecutive_failures >= limit {
            tracing::error!(
                consecutive_failures,
                "Inbound queue unrecoverable, exit listener giving up"
            );
            return ListenerReport {
                exit: ListenerExit::ChannelCorrupted {
                    consecutive_failures,
                },
                stats,
            };
        }
    }

    tracing::debug!(?stats, "Exit listener stopped");
    ListenerReport {
        exit: ListenerExit::Stopped,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::sync::mpsc;

    use super::*;
    use crate::bridge::channel::{ChannelFactory, Direction};
    use crate::bridge::memory::MemoryChannels;

    const RX: &str = "/irq_rx";

    fn settings(poll_ms: u64) -> ListenerSettings {
        ListenerSettings {
            poll_interval: Duration::from_millis(poll_ms),
            push_timeout: Duration::from_millis(20),
            max_consecutive_failures: 4,
        }
    }

    fn listen(
        channels: &MemoryChannels,
        events: Arc<dyn EventQueue>,
        settings: ListenerSettings,
    ) -> ExitListener {
        let rx = channels.open(RX, Direction::Receive).unwrap();
        ExitListener::spawn("qemu0", rx, events, settings)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ForwardedExitEvent>) -> ForwardedExitEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event queue closed")
    }

    #[tokio::test]
    async fn forwards_exits_in_receive_order() {
        let channels = MemoryChannels::new();
        let (tx, mut events) = mpsc::channel(16);
        let listener = listen(&channels, Arc::new(tx), settings(50));

        for (id, irq) in [(1u64, 5u32), (2, 6), (3, 7)] {
            channels
                .inject(RX, &ExitRequest::new(id, irq, 0xFFFF_FFF9).encode())
                .unwrap();
        }

        for (id, irq) in [(1u64, 5u32), (2, 6), (3, 7)] {
            let event = next_event(&mut events).await;
            assert_eq!(
                event,
                ForwardedExitEvent {
                    origin: "qemu0".to_string(),
                    id,
                    return_type: 0xFFFF_FFF9,
                    irq_number: irq,
                }
            );
        }

        let report = listener.stop().await;
        assert_eq!(report.exit, ListenerExit::Stopped);
        assert_eq!(report.stats.forwarded, 3);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_loop_continues() {
        let channels = MemoryChannels::new();
        let (tx, mut events) = mpsc::channel(16);
        let listener = listen(&channels, Arc::new(tx), settings(50));

        channels.inject(RX, &ExitRequest::new(1, 5, 0).encode()).unwrap();
        channels.inject(RX, &[0xFF; 5]).unwrap();
        channels.inject(RX, &ExitRequest::new(2, 6, 0).encode()).unwrap();

        assert_eq!(next_event(&mut events).await.id, 1);
        assert_eq!(next_event(&mut events).await.id, 2);

        let report = listener.stop().await;
        assert_eq!(report.exit, ListenerExit::Stopped);
        assert_eq!(report.stats.malformed, 1);
        assert_eq!(report.stats.forwarded, 2);
    }

    #[tokio::test]
    async fn consecutive_malformed_reads_end_listener() {
        let channels = MemoryChannels::new();
        let (tx, _events) = mpsc::channel::<ForwardedExitEvent>(16);
        let listener = listen(&channels, Arc::new(tx), settings(50));

        for _ in 0..4 {
            channels.inject(RX, b"junk").unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !listener.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = listener.stop().await;
        assert_eq!(
            report.exit,
            ListenerExit::ChannelCorrupted {
                consecutive_failures: 4
            }
        );
        assert_eq!(report.stats.malformed, 4);
    }

    #[tokio::test]
    async fn failing_receives_end_listener() {
        let channels = MemoryChannels::new();
        let (tx, _events) = mpsc::channel::<ForwardedExitEvent>(16);
        let rx = channels.open(RX, Direction::Receive).unwrap();
        rx.close().unwrap();

        let listener = ExitListener::spawn("qemu0", rx, Arc::new(tx), settings(50));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !listener.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = listener.stop().await;
        assert_eq!(
            report.exit,
            ListenerExit::ChannelCorrupted {
                consecutive_failures: 4
            }
        );
        assert_eq!(report.stats.receive_errors, 4);
        assert_eq!(report.stats.malformed, 0);
    }

    #[tokio::test]
    async fn valid_exit_resets_failure_count() {
        let channels = MemoryChannels::new();
        let (tx, mut events) = mpsc::channel(16);
        let listener = listen(&channels, Arc::new(tx), settings(50));

        for _ in 0..3 {
            channels.inject(RX, b"junk").unwrap();
        }
        channels.inject(RX, &ExitRequest::new(1, 5, 0).encode()).unwrap();
        for _ in 0..3 {
            channels.inject(RX, b"junk").unwrap();
        }
        channels.inject(RX, &ExitRequest::new(2, 6, 0).encode()).unwrap();

        assert_eq!(next_event(&mut events).await.id, 1);
        assert_eq!(next_event(&mut events).await.id, 2);

        let report = listener.stop().await;
        assert_eq!(report.exit, ListenerExit::Stopped);
        assert_eq!(report.stats.malformed, 6);
    }

    #[tokio::test]
    async fn full_event_queue_drops_after_push_timeout() {
        let channels = MemoryChannels::new();
        let (tx, mut events) = mpsc::channel(1);
        let listener = listen(&channels, Arc::new(tx), settings(50));

        for id in 1..=3u64 {
            channels.inject(RX, &ExitRequest::new(id, 1, 0).encode()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = listener.stop().await;
        assert_eq!(report.stats.forwarded, 1);
        assert_eq!(report.stats.dropped, 2);
        assert_eq!(next_event(&mut events).await.id, 1);
    }

    #[tokio::test]
    async fn stop_is_bounded_by_poll_interval() {
        let channels = MemoryChannels::new();
        let (tx, _events) = mpsc::channel::<ForwardedExitEvent>(1);
        let poll = Duration::from_millis(200);
        let listener = listen(&channels, Arc::new(tx), settings(200));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        let report = listener.stop().await;

        assert_eq!(report.exit, ListenerExit::Stopped);
        assert!(started.elapsed() <= poll * 2, "stop took {:?}", started.elapsed());
    }

    #[test]
    fn report_serializes_exit_reason() {
        let report = ListenerReport {
            exit: ListenerExit::ChannelCorrupted {
                consecutive_failures: 32,
            },
            stats: ListenerStats {
                forwarded: 10,
                malformed: 32,
                dropped: 0,
                receive_errors: 0,
            },
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "exit": {
            "reason": "channel_corrupted",
            "consecutive_failures": 32
          },
          "stats": {
            "forwarded": 10,
            "malformed": 32,
            "dropped": 0,
            "receive_errors": 0
          }
        }
        "#);
    }
}
