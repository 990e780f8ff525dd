//! Mapping of logical queue names to queue URLs.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::client::SqsQueueClient;
use crate::errors::ListenerError;

/// Resolves the queue configured on a [`QueueDescriptor`](crate::container::config::QueueDescriptor)
/// to the URL the workers poll.
///
/// Failures must be reported as [`ListenerError::DestinationResolution`].
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve_destination(&self, name: &str) -> Result<String, ListenerError>;
}

/// Uses the configured value as the queue URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolver;

#[async_trait]
impl DestinationResolver for PassthroughResolver {
    async fn resolve_destination(&self, name: &str) -> Result<String, ListenerError> {
        if name.trim().is_empty() {
            return Err(ListenerError::destination_resolution(name, "empty queue name"));
        }
        Ok(name.to_string())
    }
}

/// Resolves names from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticDestinationResolver {
    destinations: HashMap<String, String>,
}

impl StaticDestinationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.destinations.insert(name.into(), url.into());
        self
    }
}

#[async_trait]
impl DestinationResolver for StaticDestinationResolver {
    async fn resolve_destination(&self, name: &str) -> Result<String, ListenerError> {
        self.destinations
            .get(name)
            .cloned()
            .ok_or_else(|| ListenerError::destination_resolution(name, "no such destination"))
    }
}

/// Passes URLs through and looks up bare queue names with `GetQueueUrl`.
#[derive(Debug, Clone)]
pub struct SqsDestinationResolver {
    client: SqsQueueClient,
}

impl SqsDestinationResolver {
    pub fn new(client: SqsQueueClient) -> Self {
        SqsDestinationResolver { client }
    }
}

#[async_trait]
impl DestinationResolver for SqsDestinationResolver {
    async fn resolve_destination(&self, name: &str) -> Result<String, ListenerError> {
        if is_queue_url(name) {
            return Ok(name.to_string());
        }
        self.client
            .get_queue_url(name)
            .await
            .map_err(|e| ListenerError::destination_resolution(name, e))
    }
}

fn is_queue_url(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("http://")
}
