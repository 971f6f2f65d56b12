//! Events handed to the orchestrator's central queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::wire::ExitRequest;

/// An interrupt exit observed on a target, awaiting acknowledgement.
///
/// The orchestrator answers it with
/// [`InterruptProtocol::send_interrupt_exit_response`](crate::InterruptProtocol::send_interrupt_exit_response)
/// using the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedExitEvent {
    /// Name of the target the exit came from.
    pub origin: String,
    pub id: u64,
    pub return_type: u32,
    pub irq_number: u32,
}

impl ForwardedExitEvent {
    pub fn from_request(origin: impl Into<String>, request: &ExitRequest) -> Self {
        Self {
            origin: origin.into(),
            id: request.id,
            return_type: request.return_type,
            irq_number: request.irq_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event queue closed")]
pub struct QueueClosed;

/// The orchestrator's multi-producer event queue.
///
/// Only enqueue is required. Implementations may apply backpressure; callers
/// bound the wait themselves.
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn put(&self, event: ForwardedExitEvent) -> Result<(), QueueClosed>;
}

#[async_trait]
impl<M> EventQueue for mpsc::Sender<M>
where
    M: From<ForwardedExitEvent> + Send + 'static,
{
    async fn put(&self, event: ForwardedExitEvent) -> Result<(), QueueClosed> {
        self.send(M::from(event)).await.map_err(|_| QueueClosed)
    }
}

#[async_trait]
impl<M> EventQueue for mpsc::UnboundedSender<M>
where
    M: From<ForwardedExitEvent> + Send + 'static,
{
    async fn put(&self, event: ForwardedExitEvent) -> Result<(), QueueClosed> {
        self.send(M::from(event)).map_err(|_| QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum OrchestratorMessage {
        InterruptExit(ForwardedExitEvent),
    }

    impl From<ForwardedExitEvent> for OrchestratorMessage {
        fn from(event: ForwardedExitEvent) -> Self {
            Self::InterruptExit(event)
        }
    }

    #[test]
    fn event_copies_request_fields() {
        let event = ForwardedExitEvent::from_request("qemu", &ExitRequest::new(9, 4, 0xFFFF_FFF9));
        insta::assert_json_snapshot!(event, @r#"
        {
          "origin": "qemu",
          "id": 9,
          "return_type": 4294967289,
          "irq_number": 4
        }
        "#);
    }

    #[tokio::test]
    async fn sender_wraps_event_into_orchestrator_message() {
        let (tx, mut rx) = mpsc::channel::<OrchestratorMessage>(4);
        let event = ForwardedExitEvent::from_request("qemu", &ExitRequest::new(1, 2, 3));

        tx.put(event.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(OrchestratorMessage::InterruptExit(event)));
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (tx, rx) = mpsc::unbounded_channel::<ForwardedExitEvent>();
        drop(rx);
        let event = ForwardedExitEvent::from_request("qemu", &ExitRequest::new(1, 2, 3));
        assert_eq!(tx.put(event).await, Err(QueueClosed));
    }
}
