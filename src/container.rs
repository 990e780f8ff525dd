use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use crate::channel::{MessageChannel, NullChannel};
use crate::client::QueueClient;
use crate::errors::ListenerError;
use crate::lifecycle::SmartLifecycle;
use crate::message::{ErrorMessage, InboundMessage};
use crate::resolver::{DestinationResolver, PassthroughResolver};

use self::config::{ContainerDescriptor, ListenerContainerConfig, QueueDescriptor};
use self::deletion::DeletionPolicyManager;
use self::dispatcher::{MessageDispatcher, send_error};
use self::handler::{ChannelHandler, MessageHandler};
use self::worker::PollingWorkerPool;

mod backoff;
pub mod config;
pub mod deletion;
pub mod dispatcher;
pub mod handler;
pub mod worker;

/// Lifecycle state of a [`ListenerContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

enum Consumer {
    Output(Arc<dyn MessageChannel<InboundMessage>>),
    Handler(Arc<dyn MessageHandler>),
}

/// Polls a set of queues and hands their messages to an output channel or handler.
///
/// Each queue gets its own polling workers; failures are contained per
/// queue and reported on the error channel. Lifecycle transitions are
/// serialized.
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use rs_sqs_listener::client::{create_sqs_client_from_env, SqsQueueClient};
/// use rs_sqs_listener::container::ListenerContainer;
/// use rs_sqs_listener::container::config::QueueDescriptor;
/// use rs_sqs_listener::errors::HandlerError;
/// use rs_sqs_listener::message::InboundMessage;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = SqsQueueClient::new(create_sqs_client_from_env().await);
///     let container = ListenerContainer::builder(Arc::new(client))
///         .queue(QueueDescriptor::new("https://sqs.region.amazonaws.com/account/queue-name"))
///         .handler(|message: InboundMessage| async move {
///             println!("Processing message: {:?}", message.payload_str());
///             Ok::<(), HandlerError>(())
///         })
///         .build()?;
///
///     container.start().await?;
///     tokio::signal::ctrl_c().await?;
///     container.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct ListenerContainer {
    client: Arc<dyn QueueClient>,
    resolver: Arc<dyn DestinationResolver>,
    consumer: Consumer,
    error_channel: Arc<dyn MessageChannel<ErrorMessage>>,
    settings: RwLock<ContainerDescriptor>,
    state: watch::Sender<ContainerLifecycleState>,
    pool: Mutex<Option<PollingWorkerPool>>,
}

impl ListenerContainer {
    /// Starts building a container that polls through `client`.
    ///
    /// # Arguments
    ///
    /// * `client` - The queue client used for receiving, deleting and probing
    ///
    /// # Returns
    ///
    /// A builder with default settings, a passthrough destination resolver
    /// and a null error channel.
    pub fn builder(client: Arc<dyn QueueClient>) -> ListenerContainerBuilder {
        ListenerContainerBuilder::new(client)
    }

    /// Replaces the configuration. Only allowed while stopped.
    ///
    /// # Arguments
    ///
    /// * `config` - Container-wide settings
    /// * `queues` - The queues to poll; must not be empty
    ///
    /// # Returns
    ///
    /// `IllegalState` unless the container is stopped and idle, or
    /// `Configuration` when validation fails. The previous configuration is
    /// kept on error.
    pub fn configure(
        &self,
        config: ListenerContainerConfig,
        queues: Vec<QueueDescriptor>,
    ) -> Result<(), ListenerError> {
        let _transition = self.pool.try_lock().map_err(|_| {
            ListenerError::IllegalState("cannot configure during a lifecycle transition".into())
        })?;
        if self.state() != ContainerLifecycleState::Stopped {
            return Err(ListenerError::IllegalState(
                "the container must be stopped to be reconfigured".into(),
            ));
        }

        config::validate(&config, &queues)?;
        *self.settings_mut() = ContainerDescriptor {
            container: config,
            queues,
        };
        Ok(())
    }

    /// Resolves every queue and spawns its workers.
    ///
    /// A queue whose destination cannot be resolved is reported on the error
    /// channel and skipped; the others start normally. Calling `start` on a
    /// running container does nothing.
    pub async fn start(&self) -> Result<(), ListenerError> {
        if self.state() == ContainerLifecycleState::Stopping {
            return Err(ListenerError::IllegalState(
                "cannot start while the container is stopping".into(),
            ));
        }

        let mut pool_slot = self.pool.lock().await;
        match self.state() {
            ContainerLifecycleState::Running => return Ok(()),
            ContainerLifecycleState::Stopping => {
                return Err(ListenerError::IllegalState(
                    "cannot start while the container is stopping".into(),
                ));
            }
            _ => {}
        }
        self.set_state(ContainerLifecycleState::Starting);

        let settings = self.config_snapshot();
        let config = &settings.container;
        let handler: Arc<dyn MessageHandler> = match &self.consumer {
            Consumer::Output(channel) => {
                Arc::new(ChannelHandler::new(channel.clone(), config.send_timeout()))
            }
            Consumer::Handler(handler) => handler.clone(),
        };

        let mut pool = PollingWorkerPool::new();
        for descriptor in &settings.queues {
            let queue_url = match self.resolver.resolve_destination(&descriptor.queue).await {
                Ok(url) => url,
                Err(e) => {
                    error!(
                        queue = %descriptor.queue,
                        error = %e,
                        "Failed to resolve queue destination, queue will not be polled"
                    );
                    send_error(
                        self.error_channel.as_ref(),
                        ErrorMessage {
                            queue: descriptor.queue.clone(),
                            message: None,
                            cause: e.to_string(),
                            is_retryable: false,
                        },
                        config.send_timeout(),
                    )
                    .await;
                    continue;
                }
            };

            let deletion = DeletionPolicyManager::new(
                config.deletion_policy,
                self.client.clone(),
                queue_url.clone(),
            );
            let dispatcher = Arc::new(MessageDispatcher::new(
                queue_url,
                handler.clone(),
                self.error_channel.clone(),
                deletion,
                config.send_timeout(),
            ));
            pool.spawn_queue(self.client.clone(), dispatcher, descriptor, config);
        }

        *pool_slot = Some(pool);
        self.set_state(ContainerLifecycleState::Running);
        info!(
            queues = settings.queues.len(),
            phase = config.phase,
            "Listener container started"
        );
        Ok(())
    }

    /// Stops polling and waits up to `timeout` for in-flight messages.
    ///
    /// Messages still being handled at the deadline are abandoned without
    /// deletion and become visible again after their visibility timeout.
    /// Stopping a stopped container does nothing.
    ///
    /// # Arguments
    ///
    /// * `timeout` - How long in-flight messages may take to finish
    pub async fn stop(&self, timeout: Duration) -> Result<(), ListenerError> {
        let mut pool_slot = self.pool.lock().await;
        if self.state() == ContainerLifecycleState::Stopped {
            return Ok(());
        }
        // No receive call may start once Stopping is observable.
        if let Some(pool) = pool_slot.as_ref() {
            pool.stop_polling();
        }
        self.set_state(ContainerLifecycleState::Stopping);

        if let Some(pool) = pool_slot.take() {
            let aborted = pool.shutdown(timeout).await;
            if aborted > 0 {
                warn!(aborted, "Some queue workers were aborted during shutdown");
            }
        }

        self.set_state(ContainerLifecycleState::Stopped);
        info!("Listener container stopped");
        Ok(())
    }

    /// Stops with the configured queue stop timeout.
    pub async fn shutdown(&self) -> Result<(), ListenerError> {
        let timeout = self.settings().container.queue_stop_timeout();
        self.stop(timeout).await
    }

    /// True only in the `Running` state; a starting or stopping container
    /// is not running.
    pub fn is_running(&self) -> bool {
        self.state() == ContainerLifecycleState::Running
    }

    pub fn state(&self) -> ContainerLifecycleState {
        *self.state.borrow()
    }

    /// Receiver notified on every lifecycle transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ContainerLifecycleState> {
        self.state.subscribe()
    }

    /// Ordering key for lifecycle registries. Lower phases start first and
    /// stop last.
    pub fn phase(&self) -> i32 {
        self.settings().container.phase
    }

    /// Whether a [`LifecycleRegistry`](crate::lifecycle::LifecycleRegistry)
    /// starts this container.
    pub fn is_auto_startup(&self) -> bool {
        self.settings().container.auto_startup
    }

    /// The configuration currently in effect.
    pub fn config_snapshot(&self) -> ContainerDescriptor {
        self.settings().clone()
    }

    /// URLs of queues whose workers are polling.
    pub async fn active_queues(&self) -> Vec<String> {
        self.pool
            .lock()
            .await
            .as_ref()
            .map(PollingWorkerPool::active_queues)
            .unwrap_or_default()
    }

    fn set_state(&self, state: ContainerLifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Listener container state changed");
        }
    }

    fn settings(&self) -> std::sync::RwLockReadGuard<'_, ContainerDescriptor> {
        self.settings.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settings_mut(&self) -> std::sync::RwLockWriteGuard<'_, ContainerDescriptor> {
        self.settings.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SmartLifecycle for ListenerContainer {
    async fn start(&self) -> Result<(), ListenerError> {
        ListenerContainer::start(self).await
    }

    async fn stop(&self, timeout: Duration) -> Result<(), ListenerError> {
        ListenerContainer::stop(self, timeout).await
    }

    fn is_running(&self) -> bool {
        ListenerContainer::is_running(self)
    }

    fn phase(&self) -> i32 {
        ListenerContainer::phase(self)
    }

    fn is_auto_startup(&self) -> bool {
        ListenerContainer::is_auto_startup(self)
    }
}

/// Explicit construction of a [`ListenerContainer`].
pub struct ListenerContainerBuilder {
    client: Arc<dyn QueueClient>,
    config: ListenerContainerConfig,
    queues: Vec<QueueDescriptor>,
    resolver: Arc<dyn DestinationResolver>,
    consumer: Option<Consumer>,
    error_channel: Arc<dyn MessageChannel<ErrorMessage>>,
}

impl ListenerContainerBuilder {
    fn new(client: Arc<dyn QueueClient>) -> Self {
        ListenerContainerBuilder {
            client,
            config: ListenerContainerConfig::default(),
            queues: Vec::new(),
            resolver: Arc::new(PassthroughResolver),
            consumer: None,
            error_channel: Arc::new(NullChannel::new()),
        }
    }

    /// Container-wide settings. Defaults to [`ListenerContainerConfig::default`].
    pub fn config(mut self, config: ListenerContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds one queue to poll.
    pub fn queue(mut self, queue: QueueDescriptor) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn queues(mut self, queues: impl IntoIterator<Item = QueueDescriptor>) -> Self {
        self.queues.extend(queues);
        self
    }

    /// Takes both container settings and queues from a descriptor.
    pub fn descriptor(self, descriptor: ContainerDescriptor) -> Self {
        self.config(descriptor.container).queues(descriptor.queues)
    }

    /// Maps queue names to URLs at start. Defaults to [`PassthroughResolver`].
    pub fn destination_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sends every received message to `channel`. Replaces any handler.
    pub fn output_channel(mut self, channel: Arc<dyn MessageChannel<InboundMessage>>) -> Self {
        self.consumer = Some(Consumer::Output(channel));
        self
    }

    /// Runs `handler` for every received message. Replaces any output channel.
    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.consumer = Some(Consumer::Handler(Arc::new(handler)));
        self
    }

    /// Receives handler failures, unresolvable destinations and queues that
    /// were given up on. Defaults to a channel that discards everything.
    pub fn error_channel(mut self, channel: Arc<dyn MessageChannel<ErrorMessage>>) -> Self {
        self.error_channel = channel;
        self
    }

    /// Validates the configuration and creates a stopped container.
    pub fn build(self) -> Result<ListenerContainer, ListenerError> {
        config::validate(&self.config, &self.queues)?;
        let consumer = self.consumer.ok_or_else(|| {
            ListenerError::configuration("an output channel or message handler is required")
        })?;

        let (state, _) = watch::channel(ContainerLifecycleState::Stopped);
        Ok(ListenerContainer {
            client: self.client,
            resolver: self.resolver,
            consumer,
            error_channel: self.error_channel,
            settings: RwLock::new(ContainerDescriptor {
                container: self.config,
                queues: self.queues,
            }),
            state,
            pool: Mutex::new(None),
        })
    }
}
