use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_sqs::config::SharedCredentialsProvider;
use aws_sdk_sqs::config::http::HttpResponse;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use tracing::warn;

use crate::errors::{QueueClientError, QueueClientErrorKind};
use crate::message::{ReceiptHandle, ReceivedMessage};

pub mod memory;

/// Queue operations consumed by the listener container.
///
/// Every call may fail with a [`QueueClientError`] whose kind decides
/// whether the polling worker retries it or gives up.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receives up to `max_messages` messages, blocking for at most
    /// `wait_time_seconds` when the queue is empty.
    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout_seconds: Option<i32>,
    ) -> Result<Vec<ReceivedMessage>, QueueClientError>;

    /// Deletes a received message using its receipt handle.
    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), QueueClientError>;

    /// Returns the queue's attributes keyed by attribute name.
    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueClientError>;
}

/// [`QueueClient`] backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    sqs_client: aws_sdk_sqs::Client,
}

impl SqsQueueClient {
    pub fn new(sqs_client: aws_sdk_sqs::Client) -> Self {
        SqsQueueClient { sqs_client }
    }

    /// The wrapped SDK client.
    pub fn inner(&self) -> &aws_sdk_sqs::Client {
        &self.sqs_client
    }

    /// Looks up a queue URL by queue name.
    pub async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueClientError> {
        let output = self
            .sqs_client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(map_sdk_error)?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| QueueClientError::not_found(format!("no URL returned for {}", queue_name)))
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout_seconds: Option<i32>,
    ) -> Result<Vec<ReceivedMessage>, QueueClientError> {
        let output = self
            .sqs_client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .set_visibility_timeout(visibility_timeout_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let mut received = Vec::with_capacity(output.messages().len());
        for message in output.messages() {
            let Some(receipt_handle) = message.receipt_handle() else {
                warn!(queue_url = %queue_url, "Received a message with no receipt handle");
                continue;
            };

            let attributes: HashMap<String, String> = message
                .attributes()
                .map(|attrs| {
                    attrs
                        .iter()
                        .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                        .collect()
                })
                .unwrap_or_default();

            let receive_count = attributes
                .get(MessageSystemAttributeName::ApproximateReceiveCount.as_str())
                .and_then(|count| count.parse::<u32>().ok())
                .unwrap_or(1);

            let mut received_message = ReceivedMessage::new(
                message.message_id().unwrap_or_default(),
                message.body().unwrap_or_default().as_bytes(),
                ReceiptHandle::new(receipt_handle),
            );
            received_message.receive_count = receive_count;
            received_message.attributes = attributes;
            received.push(received_message);
        }

        Ok(received)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), QueueClientError> {
        self.sqs_client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle.as_str())
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
    ) -> Result<HashMap<String, String>, QueueClientError> {
        let output = self
            .sqs_client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(output
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Maps an SQS service error code to a client error kind.
pub fn classify_error_code(code: Option<&str>) -> QueueClientErrorKind {
    match code {
        Some(
            "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" | "NonExistentQueue",
        ) => QueueClientErrorKind::NotFound,
        Some(
            "AccessDenied"
            | "AccessDeniedException"
            | "InvalidClientTokenId"
            | "UnrecognizedClientException"
            | "SignatureDoesNotMatch"
            | "InvalidSecurity"
            | "ExpiredToken"
            | "MissingAuthenticationToken",
        ) => QueueClientErrorKind::Auth,
        Some("ThrottlingException" | "RequestThrottled" | "OverLimit" | "KmsThrottled") => {
            QueueClientErrorKind::Throttling
        }
        Some("ReceiptHandleIsInvalid") => QueueClientErrorKind::InvalidReceiptHandle,
        Some(
            "InvalidParameterValue"
            | "InvalidParameterValueException"
            | "InvalidParameterCombination"
            | "MissingParameter"
            | "InvalidAddress"
            | "InvalidAttributeName"
            | "InvalidAttributeValue"
            | "InvalidAction"
            | "InvalidQueryParameter"
            | "MalformedQueryString"
            | "ValidationError"
            | "UnsupportedOperation"
            | "AWS.SimpleQueueService.UnsupportedOperation",
        ) => QueueClientErrorKind::InvalidRequest,
        Some("ServiceUnavailable" | "InternalError" | "InternalFailure") => {
            QueueClientErrorKind::Network
        }
        _ => QueueClientErrorKind::Other,
    }
}

/// Converts an SDK failure into a [`QueueClientError`].
///
/// Service errors with an unrecognised code are classified by HTTP status:
/// a 4xx response blames the request, so resending it cannot help.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> QueueClientError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::ServiceError(ctx) => match classify_error_code(ctx.err().code()) {
            QueueClientErrorKind::Other if ctx.raw().status().is_client_error() => {
                QueueClientErrorKind::InvalidRequest
            }
            kind => kind,
        },
        SdkError::ConstructionFailure(_) => QueueClientErrorKind::InvalidRequest,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            QueueClientErrorKind::Network
        }
        _ => QueueClientErrorKind::Other,
    };
    QueueClientError::new(kind, DisplayErrorContext(&err).to_string())
}

/// Creates an AWS SQS client using credentials and configuration from the environment.
///
/// This function loads AWS configuration from environment variables such as:
/// - `AWS_ACCESS_KEY_ID`
/// - `AWS_SECRET_ACCESS_KEY`
/// - `AWS_REGION`
/// - `AWS_PROFILE`
///
/// # Example
///
/// ```rust,no_run
/// use rs_sqs_listener::client::{create_sqs_client_from_env, SqsQueueClient};
///
/// #[tokio::main]
/// async fn main() {
///     let client = SqsQueueClient::new(create_sqs_client_from_env().await);
///     // Hand the client to a listener container...
/// }
/// ```
pub async fn create_sqs_client_from_env() -> aws_sdk_sqs::Client {
    let config = aws_config::load_from_env().await;
    aws_sdk_sqs::Client::new(&config)
}

/// Creates an AWS SQS client with explicitly provided credentials and region.
///
/// # Arguments
///
/// * `access_key_id` - The AWS access key ID
/// * `secret_access_key` - The AWS secret access key
/// * `region` - The AWS region (e.g., "us-east-1", "eu-west-1")
pub fn create_sqs_client_with_credentials(
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
) -> aws_sdk_sqs::Client {
    let credentials =
        aws_sdk_sqs::config::Credentials::new(access_key_id, secret_access_key, None, None, "aws");

    let config = aws_sdk_sqs::config::Builder::new()
        .region(Region::new(region.to_string()))
        .credentials_provider(SharedCredentialsProvider::new(credentials))
        .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
        .build();

    aws_sdk_sqs::Client::from_conf(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::operation::receive_message::ReceiveMessageError;

    #[test]
    fn test_classify_error_code() {
        assert_eq!(
            classify_error_code(Some("AWS.SimpleQueueService.NonExistentQueue")),
            QueueClientErrorKind::NotFound
        );
        assert_eq!(
            classify_error_code(Some("InvalidClientTokenId")),
            QueueClientErrorKind::Auth
        );
        assert_eq!(
            classify_error_code(Some("RequestThrottled")),
            QueueClientErrorKind::Throttling
        );
        assert_eq!(
            classify_error_code(Some("ReceiptHandleIsInvalid")),
            QueueClientErrorKind::InvalidReceiptHandle
        );
        assert_eq!(classify_error_code(None), QueueClientErrorKind::Other);
    }

    #[test]
    fn test_client_fault_codes_are_not_retried() {
        for code in [
            "InvalidParameterValue",
            "InvalidAddress",
            "InvalidAttributeName",
            "UnsupportedOperation",
            "AWS.SimpleQueueService.UnsupportedOperation",
        ] {
            let kind = classify_error_code(Some(code));
            assert_eq!(kind, QueueClientErrorKind::InvalidRequest, "{}", code);
            assert!(!QueueClientError::new(kind, code).is_retryable(), "{}", code);
        }
        assert!(QueueClientError::new(classify_error_code(Some("InternalError")), "").is_retryable());
    }

    #[test]
    fn test_construction_failure_is_not_retried() {
        let err = map_sdk_error::<ReceiveMessageError>(SdkError::construction_failure(
            "queue_url was not specified",
        ));
        assert_eq!(err.kind(), QueueClientErrorKind::InvalidRequest);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_with_credentials_builds() {
        let client = create_sqs_client_with_credentials("AKIDEXAMPLE", "secret", "eu-west-1");
        let queue_client = SqsQueueClient::new(client);
        assert_eq!(
            queue_client.inner().config().region().map(|r| r.to_string()),
            Some("eu-west-1".to_string())
        );
    }
}
