//! Minimal send contract for the output and error channels.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::ChannelSendError;

/// Destination for messages produced by the listener container.
#[async_trait]
pub trait MessageChannel<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Sends a message, waiting at most `timeout` for capacity.
    ///
    /// `None` waits indefinitely.
    async fn send(&self, message: T, timeout: Option<Duration>) -> Result<(), ChannelSendError>;
}

/// Channel that accepts and discards every message.
#[derive(Debug)]
pub struct NullChannel<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> NullChannel<T> {
    pub fn new() -> Self {
        NullChannel {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NullChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> MessageChannel<T> for NullChannel<T>
where
    T: Send + 'static,
{
    async fn send(&self, _message: T, _timeout: Option<Duration>) -> Result<(), ChannelSendError> {
        Ok(())
    }
}

/// Bounded in-process channel backed by `tokio::sync::mpsc`.
#[derive(Debug, Clone)]
pub struct QueueChannel<T> {
    sender: mpsc::Sender<T>,
}

impl<T> QueueChannel<T> {
    /// Creates the channel and its receiving half.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (QueueChannel { sender }, receiver)
    }
}

#[async_trait]
impl<T> MessageChannel<T> for QueueChannel<T>
where
    T: Send + 'static,
{
    async fn send(&self, message: T, timeout: Option<Duration>) -> Result<(), ChannelSendError> {
        match timeout {
            Some(timeout) => self
                .sender
                .send_timeout(message, timeout)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => ChannelSendError::Timeout(timeout),
                    mpsc::error::SendTimeoutError::Closed(_) => ChannelSendError::Closed,
                }),
            None => self
                .sender
                .send(message)
                .await
                .map_err(|_| ChannelSendError::Closed),
        }
    }
}
