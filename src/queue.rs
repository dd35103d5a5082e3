use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, RunnerError};

/// How often a blocked `receive` re-checks the queue.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(25);

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// A claimed message. The token identifies this delivery and is what gets
/// acknowledged; it is only valid until the visibility timeout elapses.
#[derive(Debug, Clone)]
pub struct Message {
    pub token: Uuid,
    pub payload: Vec<u8>,
}

/// Durable, named message channel with at-least-once delivery.
///
/// Messages published under distinct queue names are fully isolated. A
/// claimed message stays invisible to other consumers until acknowledged or
/// until its visibility timeout elapses, after which it becomes receivable
/// again. The queue never silently drops a message.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<Uuid>;

    /// Claim one message, waiting up to `wait` for one to arrive. Returns
    /// `None` if the queue stays empty for the whole wait.
    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<Message>>;

    async fn acknowledge(&self, token: Uuid) -> Result<()>;

    /// Push the visibility deadline of a claimed message further out.
    /// Long-running consumers call this to keep their claim while working.
    async fn extend_visibility(&self, token: Uuid, duration: Duration) -> Result<()>;
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    payload: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<Vec<u8>>>,
    in_flight: HashMap<Uuid, InFlight>,
}

impl QueueState {
    /// Move expired in-flight messages back to the front of their queues.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(msg) = self.in_flight.remove(&token) {
                tracing::warn!(token = %token, queue = %msg.queue, "Visibility timeout expired, requeueing message");
                self.pending
                    .entry(msg.queue)
                    .or_default()
                    .push_front(msg.payload);
            }
        }
    }
}

/// In-process broker implementing the queue contract.
///
/// Stands in for the external pub/sub transport behind the [`JobQueue`]
/// seam; clones share the same broker state.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of immediately receivable messages on a queue.
    pub async fn pending_len(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        state.reclaim_expired(Instant::now());
        state.pending.get(queue).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<Uuid> {
        let message_id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state
            .pending
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        tracing::debug!(queue, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<Message>> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                if let Some(payload) = state.pending.get_mut(queue).and_then(|q| q.pop_front()) {
                    let token = Uuid::new_v4();
                    state.in_flight.insert(
                        token,
                        InFlight {
                            queue: queue.to_string(),
                            payload: payload.clone(),
                            deadline: now + visibility,
                        },
                    );
                    tracing::debug!(queue, token = %token, "Message claimed");
                    return Ok(Some(Message { token, payload }));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL).await;
        }
    }

    async fn acknowledge(&self, token: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&token).is_none() {
            // The claim expired and the message was already requeued; the
            // redelivered copy will be acknowledged by whoever claims it.
            tracing::warn!(token = %token, "Acknowledge for unknown or expired delivery token");
        }
        Ok(())
    }

    async fn extend_visibility(&self, token: Uuid, duration: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(&token) {
            Some(msg) => {
                msg.deadline = Instant::now() + duration;
                Ok(())
            }
            None => Err(RunnerError::Internal(format!(
                "cannot extend visibility of unknown delivery token {}",
                token
            ))),
        }
    }
}

/// Derive a fresh queue name so concurrent runs never share a channel.
pub fn fresh_queue_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Run an operation, retrying transport faults with jittered exponential
/// backoff up to `max_attempts`. Non-retryable errors surface immediately.
pub async fn with_retries<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let backoff = BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(BACKOFF_CAP);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retryable transport fault, backing off"
                );
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
