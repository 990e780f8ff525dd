//! Message types passed between the queue client, the container and the
//! output/error channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::client::QueueClient;
use crate::errors::{QueueClientError, QueueClientErrorKind};

/// Opaque credential required to delete one received message instance.
///
/// A handle is only valid for the visibility window it was issued in. Its
/// `Debug` output is redacted so handles never reach logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        ReceiptHandle(handle.into())
    }

    /// Raw handle value, for queue client implementations.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReceiptHandle(<redacted>)")
    }
}

/// A message as returned by a receive call.
///
/// Owned by the worker that received it until it is deleted or dropped.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: Vec<u8>,
    pub receipt_handle: ReceiptHandle,
    pub receive_count: u32,
    pub attributes: HashMap<String, String>,
    visible_until: Option<Instant>,
}

impl ReceivedMessage {
    pub fn new(id: impl Into<String>, body: impl Into<Vec<u8>>, receipt_handle: ReceiptHandle) -> Self {
        ReceivedMessage {
            id: id.into(),
            body: body.into(),
            receipt_handle,
            receive_count: 1,
            attributes: HashMap::new(),
            visible_until: None,
        }
    }

    /// Records when the message becomes visible to other receivers again.
    /// Past that instant the receipt handle must not be used.
    pub fn set_visibility_deadline(&mut self, deadline: Instant) {
        self.visible_until = Some(deadline);
    }

    pub fn visibility_deadline(&self) -> Option<Instant> {
        self.visible_until
    }

    /// Whether the visibility timeout has elapsed. Always false when no
    /// deadline was recorded.
    pub fn is_handle_expired(&self) -> bool {
        handle_expired(self.visible_until)
    }

    /// Metadata safe to expose outside the container.
    pub fn metadata(&self, queue_url: &str) -> MessageMetadata {
        MessageMetadata {
            message_id: self.id.clone(),
            queue_url: queue_url.to_string(),
            receive_count: self.receive_count,
            attributes: self.attributes.clone(),
        }
    }
}

/// Descriptive fields of a received message. Never carries the receipt handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub message_id: String,
    pub queue_url: String,
    pub receive_count: u32,
    pub attributes: HashMap<String, String>,
}

/// Payload plus metadata, as handed to message handlers and the output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub metadata: MessageMetadata,
    pub payload: Vec<u8>,
    /// Present when the container leaves deletion to the consumer.
    pub acknowledgment: Option<Acknowledgment>,
}

impl InboundMessage {
    /// The payload as UTF-8, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Deletes one received message on behalf of a consumer.
///
/// Handed out under [`DeletionPolicy::Never`](crate::container::deletion::DeletionPolicy::Never),
/// where the container itself never deletes. The receipt handle stays inside.
#[derive(Clone)]
pub struct Acknowledgment {
    client: Arc<dyn QueueClient>,
    queue_url: String,
    receipt_handle: ReceiptHandle,
    visible_until: Option<Instant>,
}

impl Acknowledgment {
    /// Creates an acknowledgment for `message` received from `queue_url`.
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue_url: impl Into<String>,
        message: &ReceivedMessage,
    ) -> Self {
        Acknowledgment {
            client,
            queue_url: queue_url.into(),
            receipt_handle: message.receipt_handle.clone(),
            visible_until: message.visible_until,
        }
    }

    /// Deletes the message from its queue.
    ///
    /// # Returns
    ///
    /// An [`InvalidReceiptHandle`](QueueClientErrorKind::InvalidReceiptHandle)
    /// error without contacting the queue when the visibility timeout has
    /// already elapsed; otherwise the result of the delete call.
    pub async fn acknowledge(&self) -> Result<(), QueueClientError> {
        if handle_expired(self.visible_until) {
            return Err(QueueClientError::new(
                QueueClientErrorKind::InvalidReceiptHandle,
                "the visibility timeout elapsed before the message was acknowledged",
            ));
        }
        self.client
            .delete_message(&self.queue_url, &self.receipt_handle)
            .await
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

impl fmt::Debug for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgment")
            .field("queue_url", &self.queue_url)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Acknowledgment {
    fn eq(&self, other: &Self) -> bool {
        self.queue_url == other.queue_url && self.receipt_handle == other.receipt_handle
    }
}

impl Eq for Acknowledgment {}

fn handle_expired(visible_until: Option<Instant>) -> bool {
    visible_until.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Failure descriptor sent to the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Queue the failure belongs to: a URL, or the unresolved logical name.
    pub queue: String,
    /// Present when the failure concerns a specific message.
    pub message: Option<MessageMetadata>,
    pub cause: String,
    pub is_retryable: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::memory::InMemoryQueueClient;

    #[test]
    fn test_receipt_handle_debug_is_redacted() {
        let message = ReceivedMessage::new("m-1", "hello", ReceiptHandle::new("secret-handle"));
        let rendered = format!("{:?}", message);
        assert!(!rendered.contains("secret-handle"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_metadata_copies_message_fields() {
        let mut message = ReceivedMessage::new("m-2", "body", ReceiptHandle::new("rh"));
        message.receive_count = 3;
        message
            .attributes
            .insert("SentTimestamp".to_string(), "1700000000".to_string());

        let metadata = message.metadata("https://queue/test");
        assert_eq!(metadata.message_id, "m-2");
        assert_eq!(metadata.queue_url, "https://queue/test");
        assert_eq!(metadata.receive_count, 3);
        assert_eq!(metadata.attributes.len(), 1);
    }

    #[test]
    fn test_handle_expiry_follows_deadline() {
        let mut message = ReceivedMessage::new("m-3", "body", ReceiptHandle::new("rh"));
        assert!(!message.is_handle_expired());

        message.set_visibility_deadline(Instant::now() + Duration::from_secs(60));
        assert!(!message.is_handle_expired());

        message.set_visibility_deadline(Instant::now() - Duration::from_millis(1));
        assert!(message.is_handle_expired());
    }

    #[tokio::test]
    async fn test_acknowledgment_deletes_without_exposing_handle() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("ack");
        client.send_message(&url, "payload").unwrap();
        let message = client
            .receive_batch(&url, 1, 0, Some(30))
            .await
            .unwrap()
            .remove(0);

        let ack = Acknowledgment::new(client.clone(), &url, &message);
        assert!(!format!("{:?}", ack).contains("-rh-"));
        ack.acknowledge().await.unwrap();
        assert_eq!(client.message_count(&url), 0);
    }

    #[tokio::test]
    async fn test_expired_acknowledgment_is_refused() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("late-ack");
        client.send_message(&url, "payload").unwrap();
        let mut message = client
            .receive_batch(&url, 1, 0, Some(30))
            .await
            .unwrap()
            .remove(0);
        message.set_visibility_deadline(Instant::now() - Duration::from_millis(1));

        let err = Acknowledgment::new(client.clone(), &url, &message)
            .acknowledge()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), QueueClientErrorKind::InvalidReceiptHandle);
        assert_eq!(client.delete_calls(), 0);
        assert_eq!(client.message_count(&url), 1);
    }
}
