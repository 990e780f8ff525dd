use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::QueueClient;
use crate::errors::HandlerError;
use crate::message::{Acknowledgment, ReceivedMessage};

/// When a processed message is deleted from its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Delete regardless of the handler outcome.
    Always,
    /// Never delete. Consumers receive an [`Acknowledgment`] to delete the
    /// message themselves.
    Never,
    /// Delete only after successful handling.
    OnSuccess,
    /// Delete after any outcome so failed messages are not redelivered.
    NoRedelivery,
}

/// Result of handing a message to its handler.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failure(HandlerError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// What to do with a message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionAction {
    DeleteNow,
    Skip,
}

impl DeletionPolicy {
    pub fn decide(self, outcome: &Outcome) -> DeletionAction {
        match (self, outcome.is_success()) {
            (DeletionPolicy::Always | DeletionPolicy::NoRedelivery, _) => DeletionAction::DeleteNow,
            (DeletionPolicy::Never, _) => DeletionAction::Skip,
            (DeletionPolicy::OnSuccess, true) => DeletionAction::DeleteNow,
            (DeletionPolicy::OnSuccess, false) => DeletionAction::Skip,
        }
    }
}

/// Applies the deletion policy of one queue.
///
/// Failed deletes are logged and otherwise ignored: the message becomes
/// visible again once its visibility timeout expires. Handlers are expected
/// to be idempotent.
pub struct DeletionPolicyManager {
    policy: DeletionPolicy,
    client: Arc<dyn QueueClient>,
    queue_url: String,
}

impl DeletionPolicyManager {
    pub fn new(policy: DeletionPolicy, client: Arc<dyn QueueClient>, queue_url: impl Into<String>) -> Self {
        DeletionPolicyManager {
            policy,
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn policy(&self) -> DeletionPolicy {
        self.policy
    }

    /// The acknowledgment handed to consumers, only under [`DeletionPolicy::Never`].
    pub fn acknowledgment(&self, message: &ReceivedMessage) -> Option<Acknowledgment> {
        (self.policy == DeletionPolicy::Never)
            .then(|| Acknowledgment::new(self.client.clone(), &self.queue_url, message))
    }

    /// Decides and, for [`DeletionAction::DeleteNow`], issues the delete.
    ///
    /// # Returns
    ///
    /// The action actually taken. A message whose visibility timeout has
    /// elapsed is skipped, since its receipt handle is no longer valid and
    /// the message may already be held by another receiver.
    pub async fn apply(&self, message: &ReceivedMessage, outcome: &Outcome) -> DeletionAction {
        let action = self.policy.decide(outcome);
        if action == DeletionAction::Skip {
            debug!(
                queue_url = %self.queue_url,
                message_id = %message.id,
                policy = ?self.policy,
                "Leaving message in queue"
            );
            return action;
        }

        if message.is_handle_expired() {
            warn!(
                queue_url = %self.queue_url,
                message_id = %message.id,
                policy = ?self.policy,
                "Visibility timeout elapsed before the message was settled; not deleting, it will be redelivered"
            );
            return DeletionAction::Skip;
        }

        match self
            .client
            .delete_message(&self.queue_url, &message.receipt_handle)
            .await
        {
            Ok(()) => debug!(
                queue_url = %self.queue_url,
                message_id = %message.id,
                "Deleted message"
            ),
            Err(e) => warn!(
                queue_url = %self.queue_url,
                message_id = %message.id,
                error = %e,
                "Failed to delete message; it may be redelivered"
            ),
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::client::memory::InMemoryQueueClient;
    use crate::errors::QueueClientError;

    fn failure() -> Outcome {
        Outcome::Failure(HandlerError::new("boom"))
    }

    #[test]
    fn test_decision_table() {
        use DeletionAction::*;
        use DeletionPolicy::*;

        let table = [
            (Always, DeleteNow, DeleteNow),
            (Never, Skip, Skip),
            (OnSuccess, DeleteNow, Skip),
            (NoRedelivery, DeleteNow, DeleteNow),
        ];
        for (policy, on_success, on_failure) in table {
            assert_eq!(policy.decide(&Outcome::Success), on_success, "{:?}", policy);
            assert_eq!(policy.decide(&failure()), on_failure, "{:?}", policy);
        }
    }

    #[test]
    fn test_policy_deserializes_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: DeletionPolicy,
        }
        let parsed: Wrapper = toml::from_str(r#"policy = "on_success""#).unwrap();
        assert_eq!(parsed.policy, DeletionPolicy::OnSuccess);
    }

    #[tokio::test]
    async fn test_apply_deletes_and_skips() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("deletion");
        client.send_message(&url, "one").unwrap();
        client.send_message(&url, "two").unwrap();
        let messages = client.receive_batch(&url, 2, 0, Some(30)).await.unwrap();

        let on_success = DeletionPolicyManager::new(DeletionPolicy::OnSuccess, client.clone(), &url);
        assert_eq!(on_success.apply(&messages[0], &failure()).await, DeletionAction::Skip);
        assert_eq!(client.message_count(&url), 2);

        assert_eq!(
            on_success.apply(&messages[1], &Outcome::Success).await,
            DeletionAction::DeleteNow
        );
        assert_eq!(client.message_count(&url), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_is_not_fatal() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("deletion-failure");
        client.send_message(&url, "one").unwrap();
        let messages = client.receive_batch(&url, 1, 0, Some(30)).await.unwrap();
        client.fail_next_delete(&url, QueueClientError::network("connection reset"));

        let manager = DeletionPolicyManager::new(DeletionPolicy::Always, client.clone(), &url);
        assert_eq!(
            manager.apply(&messages[0], &Outcome::Success).await,
            DeletionAction::DeleteNow
        );
        assert_eq!(client.message_count(&url), 1);
        assert_eq!(client.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_handle_is_never_used() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("deletion-expired");
        client.send_message(&url, "one").unwrap();
        let mut messages = client.receive_batch(&url, 1, 0, Some(30)).await.unwrap();
        messages[0].set_visibility_deadline(Instant::now() - Duration::from_millis(1));

        let manager = DeletionPolicyManager::new(DeletionPolicy::Always, client.clone(), &url);
        assert_eq!(
            manager.apply(&messages[0], &Outcome::Success).await,
            DeletionAction::Skip
        );
        assert_eq!(client.delete_calls(), 0);
        assert_eq!(client.message_count(&url), 1);
    }

    #[tokio::test]
    async fn test_acknowledgment_only_under_never() {
        let client = Arc::new(InMemoryQueueClient::new());
        let url = client.create_queue("deletion-ack");
        client.send_message(&url, "one").unwrap();
        let messages = client.receive_batch(&url, 1, 0, Some(30)).await.unwrap();

        let on_success = DeletionPolicyManager::new(DeletionPolicy::OnSuccess, client.clone(), &url);
        assert!(on_success.acknowledgment(&messages[0]).is_none());

        let never = DeletionPolicyManager::new(DeletionPolicy::Never, client.clone(), &url);
        let ack = never.acknowledgment(&messages[0]).unwrap();
        assert_eq!(never.apply(&messages[0], &Outcome::Success).await, DeletionAction::Skip);
        assert_eq!(client.message_count(&url), 1);

        ack.acknowledge().await.unwrap();
        assert_eq!(client.message_count(&url), 0);
    }
}
