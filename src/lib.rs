//! # SQS Listener Container
//!
//! A queue-polling message listener container: it continuously receives
//! messages from AWS SQS (or any [`client::QueueClient`]), dispatches them to
//! consumer logic with bounded concurrency, and settles each message
//! according to a deletion policy.
//!
//! ## Features
//!
//! - Long polling with one or more tokio workers per queue
//! - Per-queue in-flight limit enforced with a semaphore
//! - Deletion policies: `Always`, `Never`, `OnSuccess`, `NoRedelivery`
//! - Output and error channels; handler failures never stop a worker
//! - Exponential backoff with jitter for transient client errors
//! - Graceful stop with a drain timeout
//! - Destination resolution of logical queue names
//! - Declarative TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rs_sqs_listener::channel::QueueChannel;
//! use rs_sqs_listener::client::{create_sqs_client_from_env, SqsQueueClient};
//! use rs_sqs_listener::container::ListenerContainer;
//! use rs_sqs_listener::container::config::QueueDescriptor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SqsQueueClient::new(create_sqs_client_from_env().await);
//!     let (output, mut messages) = QueueChannel::bounded(64);
//!
//!     let container = ListenerContainer::builder(Arc::new(client))
//!         .queue(QueueDescriptor::new("https://sqs.region.amazonaws.com/account/queue-name"))
//!         .output_channel(Arc::new(output))
//!         .build()?;
//!     container.start().await?;
//!
//!     while let Some(message) = messages.recv().await {
//!         println!("Processing message: {:?}", message.payload_str());
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod container;
pub mod errors;
pub mod lifecycle;
pub mod message;
pub mod resolver;
