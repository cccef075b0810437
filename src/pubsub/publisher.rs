//! Publishing messages to topics.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::codec::MessageCodec;
use crate::error::{Error, Result, ValidationError};
use crate::metrics::METRICS;
use crate::pubsub::proto::{PublishRequest, PublishResponse, PubsubMessage};
use crate::pubsub::retry::{retry, RetryPolicy};
use crate::pubsub::service::PubSubService;
use crate::types::{PublishedMessage, Topic};

/// Anything that can publish batches of messages to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish `messages` to `topic`.
    ///
    /// The returned IDs are positionally aligned with `messages`. An empty
    /// batch is rejected without contacting the service.
    async fn publish<C: MessageCodec>(
        &self,
        topic: &Topic<C>,
        messages: &[C::Outgoing],
    ) -> Result<Vec<PublishedMessage>>;
}

/// Publisher backed by the shared [`PubSubService`].
#[derive(Clone)]
pub struct Publisher {
    service: Arc<PubSubService>,
    auto_create_topics: bool,
    retry: RetryPolicy,
}

impl Publisher {
    /// Create a publisher that creates missing topics on demand.
    pub fn new(service: Arc<PubSubService>) -> Self {
        let retry = service.retry_policy().clone();
        Self {
            service,
            auto_create_topics: true,
            retry,
        }
    }

    /// Enable or disable creating missing topics.
    pub fn with_auto_create_topics(mut self, enabled: bool) -> Self {
        self.auto_create_topics = enabled;
        self
    }

    /// Override the retry policy for publish calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let rpc = self.service.rpc();
        retry(&self.retry, "publish", move || rpc.publish(request.clone())).await
    }
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn publish<C: MessageCodec>(
        &self,
        topic: &Topic<C>,
        messages: &[C::Outgoing],
    ) -> Result<Vec<PublishedMessage>> {
        if messages.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }

        let encoded = messages
            .iter()
            .map(|message| {
                C::encode(message).map(|e| PubsubMessage {
                    data: e.data,
                    attributes: e.attributes,
                    ..Default::default()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let request = PublishRequest {
            topic: topic.id(self.service.project_id()),
            messages: encoded,
        };

        let response = match self.send(&request).await {
            Err(e) if e.is_not_found() && self.auto_create_topics => {
                info!(topic = %topic.name(), "Topic not found, creating it and retrying publish");
                self.service.create_topic_if_needed(topic).await?;
                self.send(&request).await?
            }
            other => other?,
        };

        if response.message_ids.len() != messages.len() {
            return Err(Error::Internal(format!(
                "publish to {} returned {} IDs for {} messages",
                request.topic,
                response.message_ids.len(),
                messages.len()
            )));
        }

        METRICS
            .messages_published_total
            .with_label_values(&[topic.name()])
            .inc_by(messages.len() as u64);
        debug!(topic = %topic.name(), count = messages.len(), "Published messages");

        Ok(response
            .message_ids
            .into_iter()
            .map(|id| PublishedMessage { id })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use crate::config::RuntimeConfig;
    use crate::server::shutdown::ShutdownSignal;
    use crate::testing::InMemoryPubSub;

    fn publisher(rpc: Arc<InMemoryPubSub>) -> Publisher {
        let service =
            PubSubService::with_rpc(RuntimeConfig::new("test-project"), rpc, ShutdownSignal::new());
        Publisher::new(service)
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected_locally() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();

        let result = publisher(rpc.clone()).publish(&topic, &[]).await;
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::EmptyBatch))
        ));
        assert_eq!(rpc.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_ids_align_with_input() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();
        let messages: Vec<String> = (0..5).map(|i| format!("order-{}", i)).collect();

        let published = publisher(rpc.clone()).publish(&topic, &messages).await.unwrap();
        assert_eq!(published.len(), messages.len());

        for (id, body) in published.iter().zip(&messages) {
            assert_eq!(rpc.published_body(&id.id).unwrap(), body.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_missing_topic_is_created_once() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();

        publisher(rpc.clone())
            .publish(&topic, &["Hello".to_string()])
            .await
            .unwrap();
        assert!(rpc.has_topic("projects/test-project/topics/orders"));
        assert_eq!(rpc.publish_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_topic_without_auto_create() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();

        let result = publisher(rpc.clone())
            .with_auto_create_topics(false)
            .publish(&topic, &["Hello".to_string()])
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert!(!rpc.has_topic("projects/test-project/topics/orders"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();
        let publisher = publisher(rpc.clone());
        PubSubService::with_rpc(RuntimeConfig::new("test-project"), rpc.clone(), ShutdownSignal::new())
            .create_topic_if_needed(&topic)
            .await
            .unwrap();

        rpc.fail_next_publish(Error::Rpc(tonic::Status::unavailable("blip")));
        let published = publisher.publish(&topic, &["Hello".to_string()]).await.unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(rpc.publish_calls(), 2);
    }
}
