//! Topic and subscription descriptors plus the message shapes shared by the
//! publisher and both consumer runtimes.

pub mod validation;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::MessageCodec;
use crate::error::Result;
use crate::pubsub::proto;

pub use validation::{validate_subscription_id, validate_topic_id};

/// Default ack deadline for new subscriptions.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Default subscription expiration (31 days).
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(31 * 24 * 60 * 60);

/// Default message retention (6 days).
pub const DEFAULT_MESSAGE_RETENTION: Duration = Duration::from_secs(6 * 24 * 60 * 60);

/// Message attributes.
pub type Attributes = HashMap<String, String>;

/// Fully-qualified topic name: `projects/{project}/topics/{topic}`.
pub fn topic_name(project: &str, topic: &str) -> String {
    format!("projects/{}/topics/{}", project, topic)
}

/// Fully-qualified subscription name: `projects/{project}/subscriptions/{subscription}`.
pub fn subscription_name(project: &str, subscription: &str) -> String {
    format!("projects/{}/subscriptions/{}", project, subscription)
}

/// A named topic whose messages are represented by the codec `C`.
///
/// The codec is a type-level association only; a topic carries no codec state.
pub struct Topic<C> {
    name: String,
    labels: Attributes,
    _codec: PhantomData<fn() -> C>,
}

impl<C: MessageCodec> Topic<C> {
    /// Create a topic descriptor, validating the topic ID.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_topic_id(&name)?;
        Ok(Self {
            name,
            labels: Attributes::new(),
            _codec: PhantomData,
        })
    }

    /// Attach labels used when the topic is created.
    pub fn with_labels(mut self, labels: Attributes) -> Self {
        self.labels = labels;
        self
    }
}

impl<C> Topic<C> {
    /// Short topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Labels applied at creation time.
    pub fn labels(&self) -> &Attributes {
        &self.labels
    }

    /// Fully-qualified topic identifier: `projects/{project}/topics/{name}`.
    pub fn id(&self, project: &str) -> String {
        topic_name(project, &self.name)
    }

    pub(crate) fn to_proto(&self, project: &str) -> proto::Topic {
        proto::Topic {
            name: self.id(project),
            labels: self.labels.clone(),
            ..Default::default()
        }
    }
}

impl<C> Clone for Topic<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            labels: self.labels.clone(),
            _codec: PhantomData,
        }
    }
}

impl<C> fmt::Debug for Topic<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .finish()
    }
}

/// When an inactive subscription is garbage-collected by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationPolicy {
    /// The subscription never expires.
    Never,
    /// The subscription expires after this much inactivity.
    After(Duration),
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        ExpirationPolicy::After(DEFAULT_EXPIRATION)
    }
}

/// Dead letter policy for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterPolicy {
    /// Short name of the dead letter topic.
    pub dead_letter_topic: String,
    /// Max delivery attempts before a message is forwarded.
    pub max_delivery_attempts: i32,
}

/// A named subscription bound to exactly one topic.
pub struct Subscription<C> {
    name: String,
    topic: Topic<C>,
    labels: Attributes,
    retain_acknowledged_messages: bool,
    acknowledge_deadline: Duration,
    expiration_policy: ExpirationPolicy,
    message_retention_duration: Duration,
    dead_letter_policy: Option<DeadLetterPolicy>,
}

impl<C: MessageCodec> Subscription<C> {
    /// Create a subscription descriptor on `topic`, validating the subscription ID.
    pub fn new(name: impl Into<String>, topic: &Topic<C>) -> Result<Self> {
        let name = name.into();
        validate_subscription_id(&name)?;
        Ok(Self {
            name,
            topic: topic.clone(),
            labels: Attributes::new(),
            retain_acknowledged_messages: false,
            acknowledge_deadline: DEFAULT_ACK_DEADLINE,
            expiration_policy: ExpirationPolicy::default(),
            message_retention_duration: DEFAULT_MESSAGE_RETENTION,
            dead_letter_policy: None,
        })
    }

    /// Attach labels used when the subscription is created.
    pub fn with_labels(mut self, labels: Attributes) -> Self {
        self.labels = labels;
        self
    }

    /// Keep acknowledged messages for the retention window.
    pub fn with_retain_acknowledged_messages(mut self, retain: bool) -> Self {
        self.retain_acknowledged_messages = retain;
        self
    }

    /// Override the ack deadline (default 10s).
    pub fn with_acknowledge_deadline(mut self, deadline: Duration) -> Self {
        self.acknowledge_deadline = deadline;
        self
    }

    /// Override the expiration policy (default 31 days).
    pub fn with_expiration_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.expiration_policy = policy;
        self
    }

    /// Override message retention (default 6 days).
    pub fn with_message_retention_duration(mut self, retention: Duration) -> Self {
        self.message_retention_duration = retention;
        self
    }

    /// Forward messages to `policy.dead_letter_topic` after repeated failures.
    pub fn with_dead_letter_policy(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter_policy = Some(policy);
        self
    }
}

impl<C> Subscription<C> {
    /// Short subscription name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The topic this subscription is bound to.
    pub fn topic(&self) -> &Topic<C> {
        &self.topic
    }

    /// Labels applied at creation time.
    pub fn labels(&self) -> &Attributes {
        &self.labels
    }

    /// Whether acknowledged messages are retained.
    pub fn retain_acknowledged_messages(&self) -> bool {
        self.retain_acknowledged_messages
    }

    /// Ack deadline for pulled messages.
    pub fn acknowledge_deadline(&self) -> Duration {
        self.acknowledge_deadline
    }

    /// Expiration policy.
    pub fn expiration_policy(&self) -> ExpirationPolicy {
        self.expiration_policy
    }

    /// Message retention duration.
    pub fn message_retention_duration(&self) -> Duration {
        self.message_retention_duration
    }

    /// Dead letter policy, if any.
    pub fn dead_letter_policy(&self) -> Option<&DeadLetterPolicy> {
        self.dead_letter_policy.as_ref()
    }

    /// Fully-qualified subscription identifier.
    pub fn id(&self, project: &str) -> String {
        subscription_name(project, &self.name)
    }

    pub(crate) fn to_proto(&self, project: &str) -> proto::Subscription {
        // An empty ExpirationPolicy (no ttl) means "never expire".
        let ttl = match self.expiration_policy {
            ExpirationPolicy::Never => None,
            ExpirationPolicy::After(ttl) => Some(duration_to_proto(ttl)),
        };

        proto::Subscription {
            name: self.id(project),
            topic: self.topic.id(project),
            ack_deadline_seconds: self.acknowledge_deadline.as_secs() as i32,
            retain_acked_messages: self.retain_acknowledged_messages,
            message_retention_duration: Some(duration_to_proto(self.message_retention_duration)),
            labels: self.labels.clone(),
            expiration_policy: Some(proto::ExpirationPolicy { ttl }),
            dead_letter_policy: self.dead_letter_policy.as_ref().map(|dlp| {
                proto::DeadLetterPolicy {
                    dead_letter_topic: topic_name(project, &dlp.dead_letter_topic),
                    max_delivery_attempts: dlp.max_delivery_attempts,
                }
            }),
        }
    }
}

impl<C> Clone for Subscription<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            topic: self.topic.clone(),
            labels: self.labels.clone(),
            retain_acknowledged_messages: self.retain_acknowledged_messages,
            acknowledge_deadline: self.acknowledge_deadline,
            expiration_policy: self.expiration_policy,
            message_retention_duration: self.message_retention_duration,
            dead_letter_policy: self.dead_letter_policy.clone(),
        }
    }
}

impl<C> fmt::Debug for Subscription<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("topic", &self.topic.name)
            .field("acknowledge_deadline", &self.acknowledge_deadline)
            .field("expiration_policy", &self.expiration_policy)
            .field("dead_letter_policy", &self.dead_letter_policy)
            .finish()
    }
}

/// Result of a successful publish, one per accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedMessage {
    /// Server-assigned message ID.
    pub id: String,
}

/// A delivered message with its metadata and a body of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    /// Stable message ID (identical across redeliveries).
    pub id: String,
    /// When the service accepted the message.
    pub published_at: DateTime<Utc>,
    /// Message attributes.
    pub attributes: Attributes,
    /// Message body.
    pub body: T,
}

impl<T> Received<T> {
    /// Replace the body, keeping the metadata.
    pub fn with_body<U>(self, body: U) -> Received<U> {
        Received {
            id: self.id,
            published_at: self.published_at,
            attributes: self.attributes,
            body,
        }
    }
}

/// An undecoded delivery: raw payload bytes.
pub type RawMessage = Received<Vec<u8>>;

impl RawMessage {
    /// Build from a pulled protobuf message.
    pub(crate) fn from_proto(message: proto::PubsubMessage) -> Self {
        let published_at = message
            .publish_time
            .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32))
            .unwrap_or_default();

        Received {
            id: message.message_id,
            published_at,
            attributes: message.attributes,
            body: message.data,
        }
    }
}

pub(crate) fn duration_to_proto(duration: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;

    #[test]
    fn test_topic_id_formatting() {
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();
        assert_eq!(topic.id("acme"), "projects/acme/topics/orders");
        assert!(Topic::<TextCodec>::new("1bad").is_err());
    }

    #[test]
    fn test_subscription_defaults() {
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();
        let sub = Subscription::new("orders-worker", &topic).unwrap();

        assert_eq!(sub.topic().name(), "orders");
        assert_eq!(sub.acknowledge_deadline(), Duration::from_secs(10));
        assert_eq!(sub.expiration_policy(), ExpirationPolicy::After(DEFAULT_EXPIRATION));
        assert_eq!(sub.message_retention_duration(), DEFAULT_MESSAGE_RETENTION);
        assert!(!sub.retain_acknowledged_messages());
        assert!(sub.dead_letter_policy().is_none());
    }

    #[test]
    fn test_subscription_to_proto() {
        let topic: Topic<TextCodec> = Topic::new("orders").unwrap();
        let sub = Subscription::new("orders-worker", &topic)
            .unwrap()
            .with_acknowledge_deadline(Duration::from_secs(30))
            .with_expiration_policy(ExpirationPolicy::Never)
            .with_dead_letter_policy(DeadLetterPolicy {
                dead_letter_topic: "orders-dlq".to_string(),
                max_delivery_attempts: 5,
            });

        let proto = sub.to_proto("acme");
        assert_eq!(proto.name, "projects/acme/subscriptions/orders-worker");
        assert_eq!(proto.topic, "projects/acme/topics/orders");
        assert_eq!(proto.ack_deadline_seconds, 30);
        assert_eq!(proto.expiration_policy.unwrap().ttl, None);
        assert_eq!(
            proto.message_retention_duration.unwrap().seconds,
            6 * 24 * 60 * 60
        );
        let dlp = proto.dead_letter_policy.unwrap();
        assert_eq!(dlp.dead_letter_topic, "projects/acme/topics/orders-dlq");
        assert_eq!(dlp.max_delivery_attempts, 5);
    }

    #[test]
    fn test_raw_message_from_proto() {
        let raw = RawMessage::from_proto(proto::PubsubMessage {
            data: b"Hello".to_vec(),
            message_id: "42".to_string(),
            publish_time: Some(prost_types::Timestamp {
                seconds: 1_689_948_007,
                nanos: 0,
            }),
            ..Default::default()
        });

        assert_eq!(raw.id, "42");
        assert_eq!(raw.body, b"Hello");
        assert_eq!(raw.published_at.timestamp(), 1_689_948_007);
    }
}
