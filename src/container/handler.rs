use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::MessageChannel;
use crate::errors::HandlerError;
use crate::message::InboundMessage;

/// Consumer logic invoked for every received message.
///
/// Returning an error marks the message as failed; the container then
/// reports it on the error channel and applies the deletion policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

/// Async closures are handlers.
///
/// ```rust
/// use rs_sqs_listener::container::handler::MessageHandler;
/// use rs_sqs_listener::errors::HandlerError;
/// use rs_sqs_listener::message::InboundMessage;
///
/// fn assert_handler<H: MessageHandler>(_: H) {}
///
/// assert_handler(|message: InboundMessage| async move {
///     println!("Processing message: {:?}", message.payload_str());
///     Ok::<(), HandlerError>(())
/// });
/// ```
#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Forwards each message to an output channel.
pub struct ChannelHandler {
    output_channel: Arc<dyn MessageChannel<InboundMessage>>,
    send_timeout: Option<Duration>,
}

impl ChannelHandler {
    pub fn new(
        output_channel: Arc<dyn MessageChannel<InboundMessage>>,
        send_timeout: Option<Duration>,
    ) -> Self {
        ChannelHandler {
            output_channel,
            send_timeout,
        }
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        self.output_channel
            .send(message, self.send_timeout)
            .await
            .map_err(HandlerError::from)
    }
}
