//! In-process queue with lease, redelivery and dead-letter semantics.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::ports::{MessageConsumer, MessagePublisher, QueueError, QueueResult, ReceivedMessage};

#[derive(Debug, Clone)]
struct Envelope {
    id: Uuid,
    body: String,
    content_type: String,
    /// Deliveries so far.
    delivery_count: u32,
}

/// A message moved to the dead-letter list.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub queue: String,
    pub message_id: Uuid,
    pub body: String,
    pub delivery_count: u32,
    pub reason: String,
    pub description: String,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<Envelope>>,
    /// Leased messages keyed by lock token.
    in_flight: HashMap<String, (String, Envelope)>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer bound to `queue`. Consumers of the same queue compete for messages.
    pub fn consumer(&self, queue: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            queue: queue.into(),
            inner: self.clone(),
        }
    }

    pub async fn pending_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.pending.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    pub async fn pending_bodies(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .pending
            .get(queue)
            .map(|q| q.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Enqueues a body that has already been delivered `delivery_count` times.
    pub async fn enqueue_redelivered(&self, queue: &str, body: &str, delivery_count: u32) {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            body: body.to_string(),
            content_type: crate::domain::CONTENT_TYPE_JSON.to_string(),
            delivery_count,
        };
        self.push(queue, envelope).await;
    }

    async fn push(&self, queue: &str, envelope: Envelope) {
        let mut state = self.state.lock().await;
        state
            .pending
            .entry(queue.to_string())
            .or_default()
            .push_back(envelope);
        drop(state);
        self.notify.notify_waiters();
    }

    async fn take(&self, queue: &str) -> Option<ReceivedMessage> {
        let mut state = self.state.lock().await;
        let mut envelope = state.pending.get_mut(queue)?.pop_front()?;
        envelope.delivery_count += 1;

        let lock_token = Uuid::new_v4().to_string();
        let message = ReceivedMessage {
            message_id: envelope.id,
            body: envelope.body.clone(),
            content_type: envelope.content_type.clone(),
            delivery_count: envelope.delivery_count,
            lock_token: lock_token.clone(),
        };
        state
            .in_flight
            .insert(lock_token, (queue.to_string(), envelope));
        Some(message)
    }

    async fn release(&self, message: &ReceivedMessage) -> QueueResult<(String, Envelope)> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&message.lock_token)
            .ok_or_else(|| QueueError::UnknownMessage(message.message_id.to_string()))
    }
}

#[async_trait]
impl MessagePublisher for InMemoryQueue {
    async fn publish(&self, queue: &str, payload: &str, content_type: &str) -> QueueResult<()> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            body: payload.to_string(),
            content_type: content_type.to_string(),
            delivery_count: 0,
        };
        self.push(queue, envelope).await;
        Ok(())
    }
}

#[derive(Clone)]
pub struct InMemoryConsumer {
    queue: String,
    inner: InMemoryQueue,
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    async fn receive(&self, wait: Duration) -> QueueResult<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.inner.take(&self.queue).await {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> QueueResult<()> {
        self.inner.release(message).await?;
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> QueueResult<()> {
        let (queue, envelope) = self.inner.release(message).await?;
        self.inner.push(&queue, envelope).await;
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str, description: &str) -> QueueResult<()> {
        let (queue, envelope) = self.inner.release(message).await?;
        let mut state = self.inner.state.lock().await;
        state.dead_letters.push(DeadLetter {
            queue,
            message_id: envelope.id,
            body: envelope.body,
            delivery_count: envelope.delivery_count,
            reason: reason.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }
}
