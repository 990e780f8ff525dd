use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::channel::MessageChannel;
use crate::container::deletion::{DeletionAction, DeletionPolicyManager, Outcome};
use crate::container::handler::MessageHandler;
use crate::errors::HandlerError;
use crate::message::{ErrorMessage, InboundMessage, ReceivedMessage};

/// Delivers received messages of one queue to the handler and settles them.
pub struct MessageDispatcher {
    queue_url: String,
    handler: Arc<dyn MessageHandler>,
    error_channel: Arc<dyn MessageChannel<ErrorMessage>>,
    deletion: DeletionPolicyManager,
    send_timeout: Option<Duration>,
}

impl MessageDispatcher {
    pub fn new(
        queue_url: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        error_channel: Arc<dyn MessageChannel<ErrorMessage>>,
        deletion: DeletionPolicyManager,
        send_timeout: Option<Duration>,
    ) -> Self {
        MessageDispatcher {
            queue_url: queue_url.into(),
            handler,
            error_channel,
            deletion,
            send_timeout,
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Runs the handler for `message`, applies the deletion policy and
    /// reports a failure on the error channel.
    ///
    /// A panicking handler counts as a failure. A reported failure is marked
    /// retryable only if the handler error is and the message was left in
    /// the queue for redelivery.
    ///
    /// # Arguments
    ///
    /// * `message` - A message received from this dispatcher's queue
    ///
    /// # Returns
    ///
    /// The handler outcome.
    pub async fn dispatch(&self, message: ReceivedMessage) -> Outcome {
        let metadata = message.metadata(&self.queue_url);
        let inbound = InboundMessage {
            metadata: metadata.clone(),
            payload: message.body.clone(),
            acknowledgment: self.deletion.acknowledgment(&message),
        };

        debug!(
            queue_url = %self.queue_url,
            message_id = %message.id,
            receive_count = message.receive_count,
            "Dispatching message"
        );

        let outcome = match AssertUnwindSafe(self.handler.handle(inbound))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(e)) => Outcome::Failure(e),
            Err(panic) => Outcome::Failure(HandlerError::new(format!(
                "message handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let action = self.deletion.apply(&message, &outcome).await;

        if let Outcome::Failure(e) = &outcome {
            error!(
                queue_url = %self.queue_url,
                message_id = %message.id,
                error = %e,
                "Failed to handle message"
            );
            self.report(ErrorMessage {
                queue: self.queue_url.clone(),
                message: Some(metadata),
                cause: e.to_string(),
                is_retryable: e.is_retryable() && action == DeletionAction::Skip,
            })
            .await;
        }

        outcome
    }

    /// Sends a failure descriptor to the error channel. Send failures are only logged.
    pub async fn report(&self, error: ErrorMessage) {
        send_error(self.error_channel.as_ref(), error, self.send_timeout).await;
    }
}

pub(crate) async fn send_error(
    channel: &dyn MessageChannel<ErrorMessage>,
    error: ErrorMessage,
    timeout: Option<Duration>,
) {
    let queue = error.queue.clone();
    if let Err(e) = channel.send(error, timeout).await {
        warn!(queue = %queue, error = %e, "Failed to send to error channel");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}
