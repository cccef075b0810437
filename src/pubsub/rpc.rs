//! The remote Pub/Sub RPC surface and its gRPC implementation.
//!
//! Everything above this module talks to [`PubSubRpc`]; the tonic-backed
//! [`GrpcRpc`] is the production implementation and
//! [`InMemoryPubSub`](crate::testing::InMemoryPubSub) the in-process one.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pubsub::proto::publisher_client::PublisherClient;
use crate::pubsub::proto::subscriber_client::SubscriberClient;
use crate::pubsub::proto::{
    AcknowledgeRequest, DeleteSubscriptionRequest, ModifyAckDeadlineRequest, PublishRequest,
    PublishResponse, PullRequest, PullResponse, Subscription, Topic,
};

/// Remote operations consumed by the runtime.
#[async_trait]
pub trait PubSubRpc: Send + Sync {
    /// Create a topic.
    async fn create_topic(&self, topic: Topic) -> Result<()>;

    /// Publish messages; returns IDs aligned with the request order.
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse>;

    /// Create a subscription.
    async fn create_subscription(&self, subscription: Subscription) -> Result<()>;

    /// Delete a subscription by fully-qualified name.
    async fn delete_subscription(&self, subscription: String) -> Result<()>;

    /// Pull up to `max_messages`; the call may take up to `timeout`.
    async fn pull(&self, request: PullRequest, timeout: Duration) -> Result<PullResponse>;

    /// Acknowledge deliveries.
    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<()>;

    /// Change the lease on deliveries; a deadline of zero releases them.
    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<()>;

    /// Periodic connection upkeep, driven by the service's run loop.
    async fn maintain(&self) {}

    /// Tear the connection down. Later calls fail with [`Error::ChannelClosed`].
    async fn close(&self);
}

/// Supplies bearer tokens for authenticated targets.
///
/// Token acquisition and refresh live outside the runtime.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token.
    async fn token(&self) -> Result<String>;

    /// Release resources; called after the connection is torn down.
    async fn shutdown(&self) {}
}

/// A fixed token, e.g. from `gcloud auth print-access-token`.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// gRPC implementation over a single lazily-connected tonic channel.
///
/// The channel buffers calls while (re)connecting, so every call waits for
/// the channel to become ready rather than failing fast.
pub struct GrpcRpc {
    endpoint: Endpoint,
    channel: RwLock<Option<Channel>>,
    last_used: Mutex<Instant>,
    in_flight: AtomicUsize,
    idle_timeout: Duration,
    call_timeout: Duration,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl GrpcRpc {
    /// Build the channel for `config.target`. Fails only if the endpoint or
    /// TLS configuration cannot be constructed.
    pub fn new(config: &RuntimeConfig, tokens: Option<Arc<dyn TokenProvider>>) -> Result<Self> {
        let connection = &config.connection;
        let mut endpoint = Endpoint::from_shared(config.target.uri())?
            .connect_timeout(connection.call_timeout)
            .http2_keep_alive_interval(connection.keepalive_interval)
            .keep_alive_timeout(connection.keepalive_timeout)
            .keep_alive_while_idle(true)
            .tcp_nodelay(true);

        if !config.target.is_emulator() {
            endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }

        info!(
            target_uri = %config.target.uri(),
            emulator = config.target.is_emulator(),
            "Creating Pub/Sub channel"
        );

        let channel = endpoint.connect_lazy();

        Ok(Self {
            endpoint,
            channel: RwLock::new(Some(channel)),
            last_used: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            idle_timeout: connection.idle_timeout,
            call_timeout: connection.call_timeout,
            tokens: if config.target.is_emulator() { None } else { tokens },
        })
    }

    fn channel(&self) -> Result<Channel> {
        let guard = self
            .channel
            .read()
            .map_err(|_| Error::Internal("channel lock poisoned".to_string()))?;
        let channel = guard.as_ref().cloned().ok_or(Error::ChannelClosed)?;
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
        Ok(channel)
    }

    async fn request<T>(&self, message: T, timeout: Duration) -> Result<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(timeout);

        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await?;
            let value = MetadataValue::try_from(format!("Bearer {}", token))
                .map_err(|e| Error::Internal(format!("invalid access token: {}", e)))?;
            request.metadata_mut().insert("authorization", value);
        }

        Ok(request)
    }

    /// Run one call with a client-side deadline and in-flight accounting.
    async fn call<T, Fut>(&self, timeout: Duration, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = tokio::time::timeout(timeout, fut).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(Error::Rpc(status)),
            Err(_) => Err(Error::Rpc(tonic::Status::deadline_exceeded(format!(
                "call did not complete within {:?}",
                timeout
            )))),
        }
    }

    fn publisher(&self) -> Result<PublisherClient<Channel>> {
        Ok(PublisherClient::new(self.channel()?))
    }

    fn subscriber(&self) -> Result<SubscriberClient<Channel>> {
        Ok(SubscriberClient::new(self.channel()?))
    }
}

#[async_trait]
impl PubSubRpc for GrpcRpc {
    async fn create_topic(&self, topic: Topic) -> Result<()> {
        let mut client = self.publisher()?;
        let request = self.request(topic, self.call_timeout).await?;
        self.call(self.call_timeout, client.create_topic(request))
            .await
            .map(|_| ())
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse> {
        let mut client = self.publisher()?;
        let request = self.request(request, self.call_timeout).await?;
        self.call(self.call_timeout, client.publish(request)).await
    }

    async fn create_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut client = self.subscriber()?;
        let request = self.request(subscription, self.call_timeout).await?;
        self.call(self.call_timeout, client.create_subscription(request))
            .await
            .map(|_| ())
    }

    async fn delete_subscription(&self, subscription: String) -> Result<()> {
        let mut client = self.subscriber()?;
        let request = self
            .request(DeleteSubscriptionRequest { subscription }, self.call_timeout)
            .await?;
        self.call(self.call_timeout, client.delete_subscription(request))
            .await
    }

    async fn pull(&self, request: PullRequest, timeout: Duration) -> Result<PullResponse> {
        let mut client = self.subscriber()?;
        let request = self.request(request, timeout).await?;
        self.call(timeout, client.pull(request)).await
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<()> {
        let mut client = self.subscriber()?;
        let request = self.request(request, self.call_timeout).await?;
        self.call(self.call_timeout, client.acknowledge(request)).await
    }

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<()> {
        let mut client = self.subscriber()?;
        let request = self.request(request, self.call_timeout).await?;
        self.call(self.call_timeout, client.modify_ack_deadline(request))
            .await
    }

    async fn maintain(&self) {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return;
        }
        let idle_for = match self.last_used.lock() {
            Ok(last_used) => last_used.elapsed(),
            Err(_) => return,
        };
        if idle_for < self.idle_timeout {
            return;
        }

        if let Ok(mut guard) = self.channel.write() {
            if guard.is_some() {
                debug!(idle_secs = idle_for.as_secs(), "Recycling idle Pub/Sub channel");
                *guard = Some(self.endpoint.connect_lazy());
                if let Ok(mut last_used) = self.last_used.lock() {
                    *last_used = Instant::now();
                }
            }
        }
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.channel.write() {
            if guard.take().is_some() {
                info!("Pub/Sub channel closed");
            }
        }
    }
}
