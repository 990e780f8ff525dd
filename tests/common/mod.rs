#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use rs_sqs_listener::container::config::{BackoffConfig, ListenerContainerConfig};
use rs_sqs_listener::message::ErrorMessage;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Container settings with short backoff so failure paths run quickly.
pub fn fast_config() -> ListenerContainerConfig {
    ListenerContainerConfig {
        queue_stop_timeout_millis: 2_000,
        backoff: BackoffConfig {
            initial_delay_millis: 1,
            max_delay_millis: 5,
            jitter: false,
            max_transient_retries: None,
            permanent_error_threshold: 3,
        },
        ..Default::default()
    }
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {:?}", timeout);
}

pub fn drain_errors(rx: &mut mpsc::Receiver<ErrorMessage>) -> Vec<ErrorMessage> {
    let mut errors = Vec::new();
    while let Ok(error) = rx.try_recv() {
        errors.push(error);
    }
    errors
}
