//! In-process test doubles.
//!
//! - [`MemoryPublisher`] records published messages and hands out sequential IDs.
//! - [`InMemoryPubSub`] implements the RPC surface against local state, so the
//!   publisher and both consumer runtimes can be exercised without a server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{EncodedMessage, MessageCodec};
use crate::error::{Error, Result, ValidationError};
use crate::pubsub::proto::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, PubsubMessage,
    PullRequest, PullResponse, ReceivedMessage, Subscription, Topic as ProtoTopic,
};
use crate::pubsub::publisher::MessagePublisher;
use crate::pubsub::rpc::PubSubRpc;
use crate::types::{PublishedMessage, Topic};

/// A message captured by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    /// Short topic name.
    pub topic: String,
    /// Assigned ID.
    pub id: String,
    /// Encoded payload and attributes.
    pub message: EncodedMessage,
}

/// Publisher double: assigns IDs "1", "2", ... per instance, across all topics.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    next_id: AtomicU64,
    published: Mutex<Vec<RecordedMessage>>,
}

impl MemoryPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<RecordedMessage> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    /// Messages published to one topic.
    pub fn published_to(&self, topic: &str) -> Vec<RecordedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
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
            .map(C::encode)
            .collect::<Result<Vec<_>>>()?;

        let mut published = self
            .published
            .lock()
            .map_err(|_| Error::Internal("publisher lock poisoned".to_string()))?;

        Ok(encoded
            .into_iter()
            .map(|message| {
                let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
                published.push(RecordedMessage {
                    topic: topic.name().to_string(),
                    id: id.clone(),
                    message,
                });
                PublishedMessage { id }
            })
            .collect())
    }
}

/// Longest an empty pull waits for new messages before returning nothing.
const EMPTY_PULL_WAIT: Duration = Duration::from_millis(50);

#[derive(Default)]
struct State {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionData>,
    /// Every published message, by ID.
    messages: HashMap<String, PubsubMessage>,
    next_message_id: u64,
    closed: bool,
    hooks: Hooks,
}

struct SubscriptionData {
    topic: String,
    available: VecDeque<Delivery>,
    /// ack_id -> delivery
    in_flight: HashMap<String, Delivery>,
}

#[derive(Clone)]
struct Delivery {
    message_id: String,
    attempt: i32,
}

#[derive(Default)]
struct Hooks {
    publish_failures: VecDeque<Error>,
    pull_failures: VecDeque<Error>,
    create_topic_failures: VecDeque<Error>,
    ack_failures: VecDeque<Error>,
    publish_calls: usize,
    pull_calls: usize,
    create_subscription_calls: usize,
    delete_subscription_calls: usize,
    acked: Vec<String>,
    nacked: Vec<String>,
}

/// In-memory implementation of the Pub/Sub RPC surface.
///
/// Topics fan out to their subscriptions; pulled messages stay in flight
/// until acknowledged or released with a zero deadline. Lease expiry is not
/// modeled.
#[derive(Default)]
pub struct InMemoryPubSub {
    state: Mutex<State>,
    arrivals: Notify,
}

impl InMemoryPubSub {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("in-memory state poisoned".to_string()))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T
    where
        T: Default,
    {
        self.lock().map(|mut state| f(&mut state)).unwrap_or_default()
    }

    /// Whether a topic exists, by fully-qualified name.
    pub fn has_topic(&self, name: &str) -> bool {
        self.with_state(|s| s.topics.contains(name))
    }

    /// Whether a subscription exists, by fully-qualified name.
    pub fn has_subscription(&self, name: &str) -> bool {
        self.with_state(|s| s.subscriptions.contains_key(name))
    }

    /// Payload of a published message.
    pub fn published_body(&self, message_id: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.messages.get(message_id).map(|m| m.data.clone()))
    }

    /// Messages waiting for delivery on a subscription.
    pub fn backlog(&self, subscription: &str) -> usize {
        self.with_state(|s| {
            s.subscriptions
                .get(subscription)
                .map(|sub| sub.available.len())
                .unwrap_or_default()
        })
    }

    /// Deliveries pulled but neither acknowledged nor released.
    pub fn in_flight(&self, subscription: &str) -> usize {
        self.with_state(|s| {
            s.subscriptions
                .get(subscription)
                .map(|sub| sub.in_flight.len())
                .unwrap_or_default()
        })
    }

    /// Message IDs acknowledged so far.
    pub fn acked_message_ids(&self) -> Vec<String> {
        self.with_state(|s| s.hooks.acked.clone())
    }

    /// Message IDs released (deadline set to zero) so far.
    pub fn nacked_message_ids(&self) -> Vec<String> {
        self.with_state(|s| s.hooks.nacked.clone())
    }

    /// Number of publish calls, including failed ones.
    pub fn publish_calls(&self) -> usize {
        self.with_state(|s| s.hooks.publish_calls)
    }

    /// Number of pull calls, including failed ones.
    pub fn pull_calls(&self) -> usize {
        self.with_state(|s| s.hooks.pull_calls)
    }

    /// Number of create-subscription calls.
    pub fn create_subscription_calls(&self) -> usize {
        self.with_state(|s| s.hooks.create_subscription_calls)
    }

    /// Number of delete-subscription calls.
    pub fn delete_subscription_calls(&self) -> usize {
        self.with_state(|s| s.hooks.delete_subscription_calls)
    }

    /// Whether [`PubSubRpc::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    /// Fail the next publish call with `error`.
    pub fn fail_next_publish(&self, error: Error) {
        self.with_state(|s| s.hooks.publish_failures.push_back(error));
    }

    /// Fail the next pull call with `error`. Calls queue up.
    pub fn fail_next_pull(&self, error: Error) {
        self.with_state(|s| s.hooks.pull_failures.push_back(error));
    }

    /// Fail the next create-topic call with `error`, without creating it.
    pub fn fail_next_create_topic(&self, error: Error) {
        self.with_state(|s| s.hooks.create_topic_failures.push_back(error));
    }

    /// Fail the next acknowledge call with `error`.
    pub fn fail_next_acknowledge(&self, error: Error) {
        self.with_state(|s| s.hooks.ack_failures.push_back(error));
    }

    fn take_delivery(state: &mut State, subscription: &str, ack_id: &str) -> Option<Delivery> {
        state
            .subscriptions
            .get_mut(subscription)
            .and_then(|sub| sub.in_flight.remove(ack_id))
    }

    fn try_pull(&self, request: &PullRequest) -> Result<Vec<ReceivedMessage>> {
        let mut state = self.lock()?;
        let State {
            subscriptions,
            messages,
            ..
        } = &mut *state;

        let sub = subscriptions
            .get_mut(&request.subscription)
            .ok_or_else(|| tonic::Status::not_found("Subscription does not exist"))?;

        let max = request.max_messages.max(1) as usize;
        let mut received = Vec::new();
        while received.len() < max {
            let Some(delivery) = sub.available.pop_front() else {
                break;
            };
            let ack_id = Uuid::new_v4().to_string();
            received.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message: messages.get(&delivery.message_id).cloned(),
                delivery_attempt: delivery.attempt,
            });
            sub.in_flight.insert(ack_id, delivery);
        }
        Ok(received)
    }
}

#[async_trait]
impl PubSubRpc for InMemoryPubSub {
    async fn create_topic(&self, topic: ProtoTopic) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::ChannelClosed);
        }
        if let Some(error) = state.hooks.create_topic_failures.pop_front() {
            return Err(error);
        }
        if !state.topics.insert(topic.name) {
            return Err(tonic::Status::already_exists("Topic already exists").into());
        }
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        let message_ids = {
            let mut state = self.lock()?;
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            state.hooks.publish_calls += 1;
            if let Some(error) = state.hooks.publish_failures.pop_front() {
                return Err(error);
            }
            if !state.topics.contains(&request.topic) {
                return Err(tonic::Status::not_found("Topic not found").into());
            }

            let mut ids = Vec::with_capacity(request.messages.len());
            for mut message in request.messages {
                state.next_message_id += 1;
                let id = state.next_message_id.to_string();
                message.message_id = id.clone();
                message.publish_time = Some(prost_types::Timestamp {
                    seconds: Utc::now().timestamp(),
                    nanos: 0,
                });

                for sub in state.subscriptions.values_mut() {
                    if sub.topic == request.topic {
                        sub.available.push_back(Delivery {
                            message_id: id.clone(),
                            attempt: 1,
                        });
                    }
                }
                state.messages.insert(id.clone(), message);
                ids.push(id);
            }
            ids
        };

        debug!(topic = %request.topic, count = message_ids.len(), "Stored published messages");
        self.arrivals.notify_waiters();
        Ok(PublishResponse { message_ids })
    }

    async fn create_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::ChannelClosed);
        }
        state.hooks.create_subscription_calls += 1;
        if state.subscriptions.contains_key(&subscription.name) {
            return Err(tonic::Status::already_exists("Subscription already exists").into());
        }
        if !state.topics.contains(&subscription.topic) {
            return Err(tonic::Status::not_found("Topic not found").into());
        }
        state.subscriptions.insert(
            subscription.name,
            SubscriptionData {
                topic: subscription.topic,
                available: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_subscription(&self, subscription: String) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::ChannelClosed);
        }
        state.hooks.delete_subscription_calls += 1;
        state
            .subscriptions
            .remove(&subscription)
            .map(|_| ())
            .ok_or_else(|| tonic::Status::not_found("Subscription does not exist").into())
    }

    async fn pull(&self, request: PullRequest, timeout: Duration) -> Result<PullResponse> {
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            state.hooks.pull_calls += 1;
            if let Some(error) = state.hooks.pull_failures.pop_front() {
                return Err(error);
            }
        }

        let arrived = self.arrivals.notified();
        let received = self.try_pull(&request)?;
        if !received.is_empty() {
            return Ok(PullResponse {
                received_messages: received,
            });
        }

        let _ = tokio::time::timeout(timeout.min(EMPTY_PULL_WAIT), arrived).await;
        Ok(PullResponse {
            received_messages: self.try_pull(&request)?,
        })
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::ChannelClosed);
        }
        if let Some(error) = state.hooks.ack_failures.pop_front() {
            return Err(error);
        }
        for ack_id in &request.ack_ids {
            if let Some(delivery) = Self::take_delivery(&mut state, &request.subscription, ack_id) {
                state.hooks.acked.push(delivery.message_id);
            }
        }
        Ok(())
    }

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(Error::ChannelClosed);
        }
        if request.ack_deadline_seconds != 0 {
            return Ok(());
        }
        for ack_id in &request.ack_ids {
            if let Some(mut delivery) = Self::take_delivery(&mut state, &request.subscription, ack_id)
            {
                state.hooks.nacked.push(delivery.message_id.clone());
                delivery.attempt += 1;
                if let Some(sub) = state.subscriptions.get_mut(&request.subscription) {
                    sub.available.push_back(delivery);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.with_state(|s| s.closed = true);
    }
}
