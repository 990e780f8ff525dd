use std::time::Duration;

use serde::Deserialize;

use crate::container::deletion::DeletionPolicy;
use crate::errors::ListenerError;

/// Upper bound the queue service places on a single receive call.
pub const MAX_NUMBER_OF_MESSAGES_LIMIT: i32 = 10;

/// A queue polled by the listener container.
///
/// `queue` is either a URL or a logical name; it is passed through the
/// container's destination resolver at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueDescriptor {
    pub queue: String,

    /// The maximum number of messages to receive in a single request.
    pub max_number_of_messages: i32,

    /// How long received messages stay hidden. `None` uses the queue's setting.
    pub visibility_timeout_seconds: Option<i32>,

    /// The wait time for long polling, in seconds.
    pub wait_time_seconds: i32,
}

impl QueueDescriptor {
    /// Creates a descriptor with default receive settings.
    ///
    /// # Arguments
    ///
    /// * `queue` - A queue URL, or a name for the destination resolver
    pub fn new(queue: impl Into<String>) -> Self {
        QueueDescriptor {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// Sets the receive batch size (1 to 10). Checked when the container is
    /// built or configured.
    pub fn max_number_of_messages(mut self, max: i32) -> Self {
        self.max_number_of_messages = max;
        self
    }

    /// Overrides the queue's visibility timeout for messages received by
    /// the container. Handlers must finish within it for the message to be
    /// deleted.
    pub fn visibility_timeout_seconds(mut self, seconds: i32) -> Self {
        self.visibility_timeout_seconds = Some(seconds);
        self
    }

    /// Sets how long a receive call waits for messages on an empty queue.
    pub fn wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ListenerError> {
        if self.queue.trim().is_empty() {
            return Err(ListenerError::configuration("queue name must not be empty"));
        }
        if !(1..=MAX_NUMBER_OF_MESSAGES_LIMIT).contains(&self.max_number_of_messages) {
            return Err(ListenerError::configuration(format!(
                "maxNumberOfMessages for '{}' must be between 1 and {}, got {}",
                self.queue, MAX_NUMBER_OF_MESSAGES_LIMIT, self.max_number_of_messages
            )));
        }
        if self.wait_time_seconds < 0 {
            return Err(ListenerError::configuration(format!(
                "waitTimeSeconds for '{}' must not be negative",
                self.queue
            )));
        }
        if matches!(self.visibility_timeout_seconds, Some(secs) if secs < 0) {
            return Err(ListenerError::configuration(format!(
                "visibilityTimeoutSeconds for '{}' must not be negative",
                self.queue
            )));
        }
        Ok(())
    }
}

impl Default for QueueDescriptor {
    fn default() -> Self {
        QueueDescriptor {
            queue: String::new(),
            max_number_of_messages: MAX_NUMBER_OF_MESSAGES_LIMIT,
            visibility_timeout_seconds: None,
            wait_time_seconds: 20,
        }
    }
}

/// Retry behaviour for failed receive calls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub max_delay_millis: u64,
    pub jitter: bool,
    /// Consecutive transient failures tolerated before one is reported to the
    /// error channel. `None` never reports them.
    pub max_transient_retries: Option<u32>,
    /// Consecutive permanent failures after which a worker gives up on its queue.
    pub permanent_error_threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay_millis: 100,
            max_delay_millis: 30_000,
            jitter: true,
            max_transient_retries: None,
            permanent_error_threshold: 3,
        }
    }
}

/// Container-wide settings. Fixed once the container is configured; changing
/// them requires a stop, `configure`, start cycle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerContainerConfig {
    /// In-flight (received but not yet deleted or released) messages per queue.
    pub max_concurrent_messages: usize,

    /// Polling workers spawned for each queue.
    pub workers_per_queue: usize,

    pub queue_stop_timeout_millis: u64,

    pub auto_startup: bool,

    pub phase: i32,

    pub deletion_policy: DeletionPolicy,

    /// Output channel send timeout. `None` waits indefinitely.
    pub send_timeout_millis: Option<u64>,

    pub backoff: BackoffConfig,
}

impl ListenerContainerConfig {
    /// The drain timeout used by [`ListenerContainer::shutdown`](crate::container::ListenerContainer::shutdown).
    pub fn queue_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_stop_timeout_millis)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_millis.map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> Result<(), ListenerError> {
        if self.max_concurrent_messages == 0 {
            return Err(ListenerError::configuration(
                "maxConcurrentMessages must be at least 1",
            ));
        }
        if self.workers_per_queue == 0 {
            return Err(ListenerError::configuration(
                "workersPerQueue must be at least 1",
            ));
        }
        if self.backoff.initial_delay_millis > self.backoff.max_delay_millis {
            return Err(ListenerError::configuration(
                "backoff initial delay must not exceed the maximum delay",
            ));
        }
        if self.backoff.permanent_error_threshold == 0 {
            return Err(ListenerError::configuration(
                "permanentErrorThreshold must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for ListenerContainerConfig {
    fn default() -> Self {
        ListenerContainerConfig {
            max_concurrent_messages: 10,
            workers_per_queue: 1,
            queue_stop_timeout_millis: 20_000,
            auto_startup: true,
            phase: 0,
            deletion_policy: DeletionPolicy::NoRedelivery,
            send_timeout_millis: None,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Declarative description of a container and its queues, usually loaded from TOML.
///
/// ```toml
/// [container]
/// max_concurrent_messages = 4
/// deletion_policy = "never"
///
/// [[queues]]
/// queue = "orders"
/// max_number_of_messages = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContainerDescriptor {
    pub container: ListenerContainerConfig,
    pub queues: Vec<QueueDescriptor>,
}

impl ContainerDescriptor {
    /// Parses and validates a TOML descriptor.
    pub fn from_toml_str(content: &str) -> Result<Self, ListenerError> {
        let descriptor: ContainerDescriptor = toml::from_str(content)?;
        validate(&descriptor.container, &descriptor.queues)?;
        Ok(descriptor)
    }
}

pub(crate) fn validate(
    config: &ListenerContainerConfig,
    queues: &[QueueDescriptor],
) -> Result<(), ListenerError> {
    if queues.is_empty() {
        return Err(ListenerError::configuration(
            "at least one queue must be configured",
        ));
    }
    config.validate()?;
    for queue in queues {
        queue.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let queue = QueueDescriptor::new("orders");
        assert_eq!(queue.max_number_of_messages, 10);
        assert_eq!(queue.wait_time_seconds, 20);

        let config = ListenerContainerConfig::default();
        assert!(config.auto_startup);
        assert_eq!(config.queue_stop_timeout(), Duration::from_secs(20));
        assert_eq!(config.deletion_policy, DeletionPolicy::NoRedelivery);
        assert_eq!(config.send_timeout(), None);
    }

    #[test]
    fn test_max_number_of_messages_bounds() {
        let config = ListenerContainerConfig::default();
        for bad in [0, 11, -1] {
            let queues = vec![QueueDescriptor::new("q").max_number_of_messages(bad)];
            assert!(matches!(
                validate(&config, &queues),
                Err(ListenerError::Configuration(_))
            ));
        }
        for good in [1, 5, 10] {
            let queues = vec![QueueDescriptor::new("q").max_number_of_messages(good)];
            assert!(validate(&config, &queues).is_ok());
        }
    }

    #[test]
    fn test_empty_queue_set_is_rejected() {
        let err = validate(&ListenerContainerConfig::default(), &[]).unwrap_err();
        assert!(err.to_string().contains("at least one queue"));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = ListenerContainerConfig {
            max_concurrent_messages: 0,
            ..Default::default()
        };
        assert!(validate(&config, &[QueueDescriptor::new("q")]).is_err());
    }

    #[test]
    fn test_descriptor_from_toml() {
        let descriptor = ContainerDescriptor::from_toml_str(
            r#"
            [container]
            max_concurrent_messages = 4
            queue_stop_timeout_millis = 11000
            auto_startup = false
            phase = 100
            deletion_policy = "never"
            send_timeout_millis = 2000

            [container.backoff]
            max_delay_millis = 5000

            [[queues]]
            queue = "foo"
            max_number_of_messages = 5
            visibility_timeout_seconds = 200
            wait_time_seconds = 40
            "#,
        )
        .unwrap();

        let config = &descriptor.container;
        assert_eq!(config.max_concurrent_messages, 4);
        assert_eq!(config.queue_stop_timeout(), Duration::from_millis(11_000));
        assert!(!config.auto_startup);
        assert_eq!(config.phase, 100);
        assert_eq!(config.deletion_policy, DeletionPolicy::Never);
        assert_eq!(config.send_timeout(), Some(Duration::from_millis(2000)));
        assert_eq!(config.backoff.max_delay_millis, 5000);
        assert_eq!(config.backoff.initial_delay_millis, 100);

        assert_eq!(
            descriptor.queues,
            vec![
                QueueDescriptor::new("foo")
                    .max_number_of_messages(5)
                    .visibility_timeout_seconds(200)
                    .wait_time_seconds(40)
            ]
        );
    }

    #[test]
    fn test_descriptor_validation_errors_surface() {
        let err = ContainerDescriptor::from_toml_str(
            r#"
            [[queues]]
            queue = "foo"
            max_number_of_messages = 12
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ListenerError::Configuration(_)));

        let err = ContainerDescriptor::from_toml_str("queues = 5").unwrap_err();
        assert!(matches!(err, ListenerError::Toml(_)));
    }
}
