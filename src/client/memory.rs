//! In-process queue implementing [`QueueClient`] for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::QueueClient;
use crate::errors::{QueueClientError, QueueClientErrorKind};
use crate::message::{ReceiptHandle, ReceivedMessage};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_POLL_TICK: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: Vec<u8>,
    receive_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<StoredMessage>,
    receive_errors: VecDeque<QueueClientError>,
    delete_errors: VecDeque<QueueClientError>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    next_id: u64,
}

/// A local queue with visibility timeouts, long polling and receipt handles.
///
/// Errors can be scripted per queue to exercise retry and escalation paths.
#[derive(Debug, Default)]
pub struct InMemoryQueueClient {
    state: Mutex<State>,
    arrivals: Notify,
    receive_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue (idempotent) and returns its URL.
    pub fn create_queue(&self, name: &str) -> String {
        let url = format!("https://sqs.local/000000000000/{}", name);
        self.lock().queues.entry(url.clone()).or_default();
        url
    }

    /// Enqueues a message and returns its id.
    pub fn send_message(
        &self,
        queue_url: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<String, QueueClientError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("msg-{}", state.next_id);
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| non_existent_queue(queue_url))?;
        queue.messages.push(StoredMessage {
            id: id.clone(),
            body: body.into(),
            receive_count: 0,
            invisible_until: None,
            receipt: None,
        });
        drop(state);
        self.arrivals.notify_waiters();
        Ok(id)
    }

    /// Makes the next receive call on `queue_url` fail with `error`.
    pub fn fail_next_receive(&self, queue_url: &str, error: QueueClientError) {
        if let Some(queue) = self.lock().queues.get_mut(queue_url) {
            queue.receive_errors.push_back(error);
        }
    }

    /// Makes the next delete call on `queue_url` fail with `error`.
    pub fn fail_next_delete(&self, queue_url: &str, error: QueueClientError) {
        if let Some(queue) = self.lock().queues.get_mut(queue_url) {
            queue.delete_errors.push_back(error);
        }
    }

    /// Messages still stored in the queue, visible or not.
    pub fn message_count(&self, queue_url: &str) -> usize {
        self.lock()
            .queues
            .get(queue_url)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Messages currently hidden by a visibility timeout.
    pub fn in_flight_count(&self, queue_url: &str) -> usize {
        let now = Instant::now();
        self.lock().queues.get(queue_url).map_or(0, |queue| {
            queue.messages.iter().filter(|m| !m.is_visible(now)).count()
        })
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The state is never left half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueClientError> {
        let mut state = self.lock();
        let next_receipt = state.next_id;
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| non_existent_queue(queue_url))?;
        if let Some(error) = queue.receive_errors.pop_front() {
            return Err(error);
        }

        let now = Instant::now();
        let mut received = Vec::new();
        for (offset, message) in queue
            .messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(max_messages)
            .enumerate()
        {
            let receipt = format!("{}-rh-{}-{}", message.id, next_receipt, offset);
            message.receive_count += 1;
            message.invisible_until = Some(now + visibility);
            message.receipt = Some(receipt.clone());

            let mut attributes = HashMap::new();
            attributes.insert(
                "ApproximateReceiveCount".to_string(),
                message.receive_count.to_string(),
            );
            let mut received_message =
                ReceivedMessage::new(&message.id, message.body.clone(), ReceiptHandle::new(receipt));
            received_message.receive_count = message.receive_count;
            received_message.attributes = attributes;
            received.push(received_message);
        }
        if !received.is_empty() {
            state.next_id += 1;
        }
        Ok(received)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout_seconds: Option<i32>,
    ) -> Result<Vec<ReceivedMessage>, QueueClientError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let max_messages = max_messages.clamp(1, 10) as usize;
        let visibility = visibility_timeout_seconds
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT);
        let deadline = Instant::now() + Duration::from_secs(wait_time_seconds.max(0) as u64);

        loop {
            let arrived = self.arrivals.notified();
            let received = self.try_receive(queue_url, max_messages, visibility)?;
            let now = Instant::now();
            if !received.is_empty() {
                return Ok(received);
            }
            if now >= deadline {
                // A real receive always suspends; keep short polls from starving the runtime.
                tokio::task::yield_now().await;
                return Ok(received);
            }
            // Expiring visibility timeouts do not notify, so wake up periodically.
            let _ = tokio::time::timeout((deadline - now).min(LONG_POLL_TICK), arrived).await;
        }
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), QueueClientError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| non_existent_queue(queue_url))?;
        if let Some(error) = queue.delete_errors.pop_front() {
            return Err(error);
        }

        let now = Instant::now();
        let position = queue.messages.iter().position(|m| {
            m.receipt.as_deref() == Some(receipt_handle.as_str()) && !m.is_visible(now)
        });
        match position {
            Some(index) => {
                queue.messages.remove(index);
                Ok(())
            }
            None => Err(QueueClientError::new(
                QueueClientErrorKind::InvalidReceiptHandle,
                "the receipt handle has expired or does not exist",
            )),
        }
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueClientError> {
        let now = Instant::now();
        let state = self.lock();
        let queue = state
            .queues
            .get(queue_url)
            .ok_or_else(|| non_existent_queue(queue_url))?;

        let visible = queue.messages.iter().filter(|m| m.is_visible(now)).count();
        let mut attributes = HashMap::new();
        attributes.insert(
            "ApproximateNumberOfMessages".to_string(),
            visible.to_string(),
        );
        attributes.insert(
            "ApproximateNumberOfMessagesNotVisible".to_string(),
            (queue.messages.len() - visible).to_string(),
        );
        attributes.insert(
            "VisibilityTimeout".to_string(),
            DEFAULT_VISIBILITY_TIMEOUT.as_secs().to_string(),
        );
        Ok(attributes)
    }
}

fn non_existent_queue(queue_url: &str) -> QueueClientError {
    QueueClientError::not_found(format!(
        "AWS.SimpleQueueService.NonExistentQueue: {}",
        queue_url
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_hides_message_until_visibility_expires() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue("orders");
        client.send_message(&url, "a").unwrap();

        let first = client.receive_batch(&url, 10, 0, Some(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert_eq!(client.in_flight_count(&url), 1);

        let hidden = client.receive_batch(&url, 10, 0, Some(1)).await.unwrap();
        assert!(hidden.is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let again = client.receive_batch(&url, 10, 0, Some(1)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_delete_requires_current_receipt_handle() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue("orders");
        client.send_message(&url, "a").unwrap();

        let messages = client.receive_batch(&url, 1, 0, Some(30)).await.unwrap();
        let handle = messages[0].receipt_handle.clone();
        client.delete_message(&url, &handle).await.unwrap();
        assert_eq!(client.message_count(&url), 0);

        let err = client.delete_message(&url, &handle).await.unwrap_err();
        assert_eq!(err.kind(), QueueClientErrorKind::InvalidReceiptHandle);
    }

    #[tokio::test]
    async fn test_long_poll_returns_when_message_arrives() {
        let client = std::sync::Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("events");

        let sender = client.clone();
        let sender_url = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.send_message(&sender_url, "late").unwrap();
        });

        let started = Instant::now();
        let messages = client.receive_batch(&url, 10, 5, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_scripted_errors_and_unknown_queue() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue("scripted");
        client.fail_next_receive(&url, QueueClientError::throttling("slow down"));

        let err = client.receive_batch(&url, 10, 0, None).await.unwrap_err();
        assert_eq!(err.kind(), QueueClientErrorKind::Throttling);
        assert!(client.receive_batch(&url, 10, 0, None).await.unwrap().is_empty());

        let missing = client
            .receive_batch("https://sqs.local/000000000000/missing", 10, 0, None)
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), QueueClientErrorKind::NotFound);
        assert_eq!(client.receive_calls(), 3);
    }

    #[tokio::test]
    async fn test_batch_size_is_respected() {
        let client = InMemoryQueueClient::new();
        let url = client.create_queue("batch");
        for i in 0..7 {
            client.send_message(&url, format!("m{}", i)).unwrap();
        }

        let batch = client.receive_batch(&url, 5, 0, None).await.unwrap();
        assert_eq!(batch.len(), 5);
        let attributes = client.get_queue_attributes(&url).await.unwrap();
        assert_eq!(attributes["ApproximateNumberOfMessages"], "2");
        assert_eq!(attributes["ApproximateNumberOfMessagesNotVisible"], "5");
    }
}
