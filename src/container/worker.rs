use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{OnceCell, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::QueueClient;
use crate::container::backoff::ExponentialBackoff;
use crate::container::config::{BackoffConfig, ListenerContainerConfig, QueueDescriptor};
use crate::container::dispatcher::MessageDispatcher;
use crate::errors::QueueClientError;
use crate::message::ErrorMessage;

/// Polling tasks for every started queue.
///
/// Workers of the same queue share one semaphore sized to the container's
/// concurrency limit; a permit is held from receive until the message is
/// settled, so in-flight messages per queue never exceed the limit. They
/// also share a single reachability probe and give up together: a queue
/// that keeps failing permanently is reported once.
pub struct PollingWorkerPool {
    cancel: CancellationToken,
    workers: Vec<QueueWorker>,
}

struct QueueWorker {
    queue_url: String,
    handle: JoinHandle<()>,
}

impl PollingWorkerPool {
    pub fn new() -> Self {
        PollingWorkerPool {
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Spawns `workers_per_queue` polling tasks for one queue.
    ///
    /// # Arguments
    ///
    /// * `client` - The queue client the workers poll with
    /// * `dispatcher` - Delivers and settles the queue's messages
    /// * `descriptor` - Receive parameters of the queue
    /// * `config` - Container settings: concurrency, worker count and backoff
    pub fn spawn_queue(
        &mut self,
        client: Arc<dyn QueueClient>,
        dispatcher: Arc<MessageDispatcher>,
        descriptor: &QueueDescriptor,
        config: &ListenerContainerConfig,
    ) {
        let queue_url = dispatcher.queue_url().to_string();

        info!(
            queue_url = %queue_url,
            workers = config.workers_per_queue,
            max_concurrent_messages = config.max_concurrent_messages,
            max_number_of_messages = descriptor.max_number_of_messages,
            wait_time_seconds = descriptor.wait_time_seconds,
            visibility_timeout_seconds = ?descriptor.visibility_timeout_seconds,
            "Spawning queue workers"
        );

        let queue = Arc::new(QueueContext {
            client,
            dispatcher,
            descriptor: descriptor.clone(),
            queue_url: queue_url.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_messages)),
            backoff: config.backoff.clone(),
            cancel: self.cancel.child_token(),
            escalated: AtomicBool::new(false),
            visibility: OnceCell::new(),
        });

        for worker_index in 0..config.workers_per_queue {
            let worker = QueueWorkerTask {
                queue: queue.clone(),
                worker_index,
            };
            self.workers.push(QueueWorker {
                queue_url: queue_url.clone(),
                handle: tokio::spawn(worker.run()),
            });
        }
    }

    /// Queue URLs with at least one worker still polling.
    pub fn active_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .workers
            .iter()
            .filter(|w| !w.handle.is_finished())
            .map(|w| w.queue_url.clone())
            .collect();
        queues.dedup();
        queues
    }

    /// Signals every worker to stop issuing receive calls, without waiting.
    pub fn stop_polling(&self) {
        self.cancel.cancel();
    }

    /// Signals every worker to stop polling and waits up to `timeout` for
    /// in-flight dispatches to finish. Workers still busy at the deadline are
    /// aborted and their messages stay in the queue.
    ///
    /// Returns the number of aborted workers.
    pub async fn shutdown(mut self, timeout: Duration) -> usize {
        self.cancel.cancel();
        let deadline = Instant::now() + timeout;
        let mut aborted = 0;

        for worker in self.workers.drain(..) {
            let mut handle = worker.handle;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    queue_url = %worker.queue_url,
                    error = %e,
                    "Queue worker ended abnormally"
                ),
                Err(_) => {
                    warn!(
                        queue_url = %worker.queue_url,
                        timeout_millis = timeout.as_millis() as u64,
                        "Queue worker did not drain in time, aborting; unsettled messages will be redelivered"
                    );
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

impl Default for PollingWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollingWorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
        for worker in &self.workers {
            worker.handle.abort();
        }
    }
}

/// What a worker does after a failed queue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    Retry(Duration),
    ReportAndRetry(Duration),
    Escalate,
}

/// Counts consecutive failures of one worker and picks the reaction.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    backoff: ExponentialBackoff,
    max_transient_retries: Option<u32>,
    permanent_error_threshold: u32,
    transient: u32,
    permanent: u32,
}

impl FailureTracker {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        FailureTracker {
            backoff: ExponentialBackoff::new(config),
            max_transient_retries: config.max_transient_retries,
            permanent_error_threshold: config.permanent_error_threshold,
            transient: 0,
            permanent: 0,
        }
    }

    pub(crate) fn record(&mut self, error: &QueueClientError) -> FailureAction {
        if !error.is_retryable() {
            self.permanent += 1;
            if self.permanent >= self.permanent_error_threshold {
                return FailureAction::Escalate;
            }
            return FailureAction::Retry(self.backoff.delay(self.permanent));
        }

        self.transient += 1;
        let delay = self.backoff.delay(self.transient);
        match self.max_transient_retries {
            Some(budget) if self.transient > budget => {
                self.transient = 0;
                FailureAction::ReportAndRetry(delay)
            }
            _ => FailureAction::Retry(delay),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.transient = 0;
        self.permanent = 0;
    }

    fn consecutive(&self) -> u32 {
        self.transient + self.permanent
    }
}

/// The queue was given up on, or the worker was stopped, before polling began.
#[derive(Debug)]
struct QueueUnavailable;

/// State shared by the workers of one queue.
struct QueueContext {
    client: Arc<dyn QueueClient>,
    dispatcher: Arc<MessageDispatcher>,
    descriptor: QueueDescriptor,
    queue_url: String,
    permits: Arc<Semaphore>,
    backoff: BackoffConfig,
    cancel: CancellationToken,
    escalated: AtomicBool,
    /// Visibility timeout reported by the probe, once it has succeeded.
    visibility: OnceCell<Option<Duration>>,
}

impl QueueContext {
    /// How long a received message stays hidden: the per-receive override,
    /// else the queue's own setting.
    fn effective_visibility(&self, probed: Option<Duration>) -> Option<Duration> {
        self.descriptor
            .visibility_timeout_seconds
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
            .or(probed)
    }

    /// Reports a permanent failure and stops every worker of the queue.
    /// Only the first caller reports.
    async fn escalate(&self, e: &QueueClientError, operation: &'static str) {
        if self.escalated.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(
            queue_url = %self.queue_url,
            operation,
            error = %e,
            "Repeated permanent queue errors, giving up on this queue"
        );
        self.dispatcher
            .report(ErrorMessage {
                queue: self.queue_url.clone(),
                message: None,
                cause: e.to_string(),
                is_retryable: false,
            })
            .await;
        self.cancel.cancel();
    }
}

struct QueueWorkerTask {
    queue: Arc<QueueContext>,
    worker_index: usize,
}

impl QueueWorkerTask {
    async fn run(self) {
        let queue = self.queue.as_ref();
        let mut failures = FailureTracker::new(&queue.backoff);
        let mut inflight: JoinSet<()> = JoinSet::new();

        // One worker probes; the others wait for its result.
        let visibility = match queue
            .visibility
            .get_or_try_init(|| self.probe_queue(&mut failures))
            .await
        {
            Ok(probed) => queue.effective_visibility(*probed),
            Err(QueueUnavailable) => {
                debug!(
                    queue_url = %queue.queue_url,
                    worker = self.worker_index,
                    "Queue worker stopped before polling"
                );
                return;
            }
        };

        loop {
            while let Some(result) = inflight.try_join_next() {
                if let Err(e) = result {
                    warn!(queue_url = %queue.queue_url, error = %e, "Dispatch task failed");
                }
            }

            // Do not receive more messages than there are permits for.
            let first = tokio::select! {
                biased;
                _ = queue.cancel.cancelled() => break,
                permit = queue.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits = vec![first];
            while permits.len() < queue.descriptor.max_number_of_messages as usize {
                match queue.permits.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let received = tokio::select! {
                biased;
                _ = queue.cancel.cancelled() => break,
                result = queue.client.receive_batch(
                    &queue.queue_url,
                    permits.len() as i32,
                    queue.descriptor.wait_time_seconds,
                    queue.descriptor.visibility_timeout_seconds,
                ) => result,
            };
            let received_at = Instant::now();

            match received {
                Ok(messages) => {
                    if failures.consecutive() > 0 {
                        info!(
                            queue_url = %queue.queue_url,
                            previous_errors = failures.consecutive(),
                            "Polling recovered after consecutive errors"
                        );
                    }
                    failures.reset();
                    if messages.is_empty() {
                        continue;
                    }

                    debug!(
                        queue_url = %queue.queue_url,
                        message_count = messages.len(),
                        "Received messages"
                    );
                    if messages.len() > permits.len() {
                        warn!(
                            queue_url = %queue.queue_url,
                            requested = permits.len(),
                            received = messages.len(),
                            "Received more messages than requested; surplus left for redelivery"
                        );
                    }

                    for (mut message, permit) in messages.into_iter().zip(permits) {
                        if let Some(visibility) = visibility {
                            message.set_visibility_deadline(received_at + visibility);
                        }
                        let dispatcher = queue.dispatcher.clone();
                        inflight.spawn(async move {
                            let _permit = permit;
                            dispatcher.dispatch(message).await;
                        });
                    }
                }
                Err(e) => {
                    drop(permits);
                    if !self.handle_failure(&mut failures, e, "receive").await {
                        break;
                    }
                }
            }
        }

        if !inflight.is_empty() {
            info!(
                queue_url = %queue.queue_url,
                count = inflight.len(),
                "Draining in-flight messages"
            );
        }
        while let Some(result) = inflight.join_next().await {
            if let Err(e) = result {
                warn!(queue_url = %queue.queue_url, error = %e, "Dispatch task failed during drain");
            }
        }
        info!(queue_url = %queue.queue_url, worker = self.worker_index, "Queue worker stopped");
    }

    /// Checks the queue is reachable before polling.
    ///
    /// # Returns
    ///
    /// The queue's `VisibilityTimeout` attribute, when it reports one.
    async fn probe_queue(
        &self,
        failures: &mut FailureTracker,
    ) -> Result<Option<Duration>, QueueUnavailable> {
        let queue = self.queue.as_ref();
        loop {
            let result = tokio::select! {
                biased;
                _ = queue.cancel.cancelled() => return Err(QueueUnavailable),
                result = queue.client.get_queue_attributes(&queue.queue_url) => result,
            };
            match result {
                Ok(attributes) => {
                    let visibility = attributes
                        .get("VisibilityTimeout")
                        .and_then(|secs| secs.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    info!(
                        queue_url = %queue.queue_url,
                        visibility_timeout = ?visibility,
                        "Queue is reachable, starting to poll"
                    );
                    failures.reset();
                    return Ok(visibility);
                }
                Err(e) => {
                    if !self.handle_failure(failures, e, "probe").await {
                        return Err(QueueUnavailable);
                    }
                }
            }
        }
    }

    /// Logs, reports and backs off after a failed queue call. Returns false
    /// when the worker should exit.
    async fn handle_failure(
        &self,
        failures: &mut FailureTracker,
        e: QueueClientError,
        operation: &'static str,
    ) -> bool {
        let queue = self.queue.as_ref();
        let delay = match failures.record(&e) {
            FailureAction::Retry(delay) => {
                warn!(
                    queue_url = %queue.queue_url,
                    operation,
                    error = %e,
                    backoff_millis = delay.as_millis() as u64,
                    "Queue call failed, backing off"
                );
                delay
            }
            FailureAction::ReportAndRetry(delay) => {
                error!(
                    queue_url = %queue.queue_url,
                    operation,
                    error = %e,
                    "Transient queue errors exhausted the retry budget"
                );
                queue
                    .dispatcher
                    .report(ErrorMessage {
                        queue: queue.queue_url.clone(),
                        message: None,
                        cause: e.to_string(),
                        is_retryable: true,
                    })
                    .await;
                delay
            }
            FailureAction::Escalate => {
                queue.escalate(&e, operation).await;
                return false;
            }
        };

        tokio::select! {
            _ = queue.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_transient_retries: Option<u32>) -> FailureTracker {
        FailureTracker::new(&BackoffConfig {
            initial_delay_millis: 10,
            max_delay_millis: 40,
            jitter: false,
            max_transient_retries,
            permanent_error_threshold: 3,
        })
    }

    #[test]
    fn test_transient_errors_back_off_without_escalating() {
        let mut failures = tracker(None);
        let delays: Vec<_> = (0..5)
            .map(|_| failures.record(&QueueClientError::throttling("slow down")))
            .collect();
        assert_eq!(
            delays,
            vec![
                FailureAction::Retry(Duration::from_millis(10)),
                FailureAction::Retry(Duration::from_millis(20)),
                FailureAction::Retry(Duration::from_millis(40)),
                FailureAction::Retry(Duration::from_millis(40)),
                FailureAction::Retry(Duration::from_millis(40)),
            ]
        );
    }

    #[test]
    fn test_transient_budget_reports_and_resets() {
        let mut failures = tracker(Some(2));
        let network = QueueClientError::network("reset");
        assert!(matches!(failures.record(&network), FailureAction::Retry(_)));
        assert!(matches!(failures.record(&network), FailureAction::Retry(_)));
        assert!(matches!(failures.record(&network), FailureAction::ReportAndRetry(_)));
        assert!(matches!(failures.record(&network), FailureAction::Retry(_)));
    }

    #[test]
    fn test_permanent_errors_escalate_at_threshold() {
        let mut failures = tracker(None);
        let auth = QueueClientError::auth("denied");
        assert!(matches!(failures.record(&auth), FailureAction::Retry(_)));
        assert!(matches!(failures.record(&auth), FailureAction::Retry(_)));
        assert_eq!(failures.record(&auth), FailureAction::Escalate);
    }

    #[test]
    fn test_success_resets_counters() {
        let mut failures = tracker(None);
        let not_found = QueueClientError::not_found("gone");
        failures.record(&not_found);
        failures.record(&not_found);
        failures.reset();
        assert!(matches!(failures.record(&not_found), FailureAction::Retry(_)));
    }
}
