//! Batched message queue between `JobSender` and workers.
//!
//! Grounded on `migration_lib/service.py::SQSService`; `aws-sdk-sqs` is
//! pulled in for the same reason `tyrchen-ruststack` depends on it — an
//! AWS-native queue client matching the original's `send_message_batch` /
//! `receive_message` / `get_queue_attributes` calls.

use crate::types::QUEUE_BATCH_SIZE;
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Backend(String),

    #[error("invalid queue message payload: {0}")]
    InvalidPayload(String),
}

/// One message as received from the queue: the raw JSON body plus the
/// receipt handle needed to acknowledge/delete it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: serde_json::Value,
    pub receipt_handle: String,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Batches up to `QUEUE_BATCH_SIZE` records per transmission. Callers
    /// serialize their own record type to `serde_json::Value` first, so the
    /// trait stays object-safe (this is held as `Arc<dyn Queue>` elsewhere).
    async fn send_batch(&self, records: &[serde_json::Value]) -> Result<(), QueueError>;

    async fn receive(&self, max: i32) -> Result<Vec<QueueMessage>, QueueError>;

    /// True iff both "visible" and "in-flight" counts are zero; a single
    /// visible message also counts as empty, to accommodate a newly
    /// created bucket's SQS test ping.
    async fn is_empty(&self) -> bool;

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

pub struct SqsQueue {
    client: Client,
    queue_url: String,
    queue_name: String,
}

impl SqsQueue {
    pub async fn connect(queue_name: impl Into<String>) -> Result<Self, QueueError> {
        let queue_name = queue_name.into();
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        let client = Client::new(&sdk_config);

        let queue_url = client
            .get_queue_url()
            .queue_name(&queue_name)
            .send()
            .await
            .map_err(|e| QueueError::Backend(format!("get_queue_url({queue_name}): {e}")))?
            .queue_url
            .ok_or_else(|| QueueError::Backend(format!("no queue URL for {queue_name}")))?;

        Ok(Self {
            client,
            queue_url,
            queue_name,
        })
    }
}

#[async_trait]
impl Queue for SqsQueue {
    #[instrument(skip(self, records))]
    async fn send_batch(&self, records: &[serde_json::Value]) -> Result<(), QueueError> {
        info!("sending {} jobs to queue {}", records.len(), self.queue_name);

        for chunk in records.chunks(QUEUE_BATCH_SIZE) {
            let mut batch = self.client.send_message_batch().queue_url(&self.queue_url);
            for (idx, record) in chunk.iter().enumerate() {
                let body = serde_json::to_string(record)
                    .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
                batch = batch.entries(
                    aws_sdk_sqs::types::SendMessageBatchRequestEntry::builder()
                        .id(idx.to_string())
                        .message_body(body)
                        .build()
                        .map_err(|e| QueueError::Backend(e.to_string()))?,
                );
            }

            if let Err(e) = batch.send().await {
                error!("failed to send sqs message batch: {e}");
                return Err(QueueError::Backend(e.to_string()));
            }
        }

        debug!("completed sending jobs to queue {}", self.queue_name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn receive(&self, max: i32) -> Result<Vec<QueueMessage>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .send()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let mut out = Vec::new();
        for message in response.messages.unwrap_or_default() {
            let (Some(body), Some(receipt_handle)) = (message.body, message.receipt_handle) else {
                continue;
            };
            let parsed: serde_json::Value =
                serde_json::from_str(&body).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
            out.push(QueueMessage {
                body: parsed,
                receipt_handle,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn is_empty(&self) -> bool {
        let response = match self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("failed to get queue attributes: {e}");
                // Can't determine status, so conservatively consider it not empty.
                return false;
            }
        };

        let attrs = response.attributes.unwrap_or_default();
        let visible = attrs
            .get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .cloned()
            .unwrap_or_default();
        let not_visible = attrs
            .get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .cloned()
            .unwrap_or_default();

        // A newly created bucket's event trigger sends one test message; a
        // single visible message still counts as "empty" to accommodate it.
        not_visible == "0" && (visible == "0" || visible == "1")
    }

    #[instrument(skip(self))]
    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_error_message_carries_detail() {
        let err = QueueError::InvalidPayload("unexpected shape".to_string());
        assert!(err.to_string().contains("unexpected shape"));
    }
}
