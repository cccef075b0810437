//! Push consumer runtime.
//!
//! [`PushServer`] accepts one JSON-wrapped delivery per HTTP request, routes
//! it by its `subscription` field to a registered handler and answers with a
//! status code. When the target cannot push (the local emulator), every
//! registered handler is driven by a [`PullSubscriber`] instead and no socket
//! is bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{Error, Result};
use crate::metrics::{self, METRICS};
use crate::pubsub::handler::{delivery_span, invoke, Handler, HandlerContext, Outcome};
use crate::pubsub::subscriber::{PullOptions, PullSubscriber};
use crate::pubsub::service::PubSubService;
use crate::server::shutdown::ShutdownSignal;
use crate::types::{Attributes, RawMessage, Received};

/// Timestamp layouts the push service is known to emit.
const PUBLISH_TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ"];

/// How deliveries reach registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Serve HTTP push requests.
    Native,
    /// Drive each handler with an internal pull consumer.
    PullFallback,
}

/// JSON body of a push request.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    /// The delivered message.
    pub message: PushMessage,
    /// Fully-qualified subscription the message was delivered on.
    pub subscription: String,
}

/// Message part of a [`PushEnvelope`].
///
/// The service sends both camelCase and snake_case spellings of some keys.
#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    /// Message ID.
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
    #[serde(rename = "message_id", default)]
    message_id_snake: Option<String>,
    /// Base64-encoded payload.
    #[serde(default)]
    pub data: String,
    /// Publish timestamp.
    #[serde(rename = "publishTime", default)]
    pub publish_time: Option<String>,
    #[serde(rename = "publish_time", default)]
    publish_time_snake: Option<String>,
    /// Attributes; may be absent or null.
    #[serde(default)]
    pub attributes: Option<Attributes>,
    /// Delivery attempt, present when a dead letter policy is configured.
    #[serde(rename = "deliveryAttempt", default)]
    pub delivery_attempt: Option<i32>,
}

impl PushMessage {
    /// Convert into a raw delivery.
    pub fn into_raw(self) -> Result<RawMessage> {
        let id = self
            .message_id
            .or(self.message_id_snake)
            .ok_or_else(|| Error::Decode("push message has no messageId".to_string()))?;
        let body = base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| Error::Decode(format!("message {}: invalid base64 data: {}", id, e)))?;
        let publish_time = self
            .publish_time
            .or(self.publish_time_snake)
            .ok_or_else(|| Error::Decode(format!("message {}: missing publishTime", id)))?;

        Ok(Received {
            id,
            published_at: parse_publish_time(&publish_time)?,
            attributes: self.attributes.unwrap_or_default(),
            body,
        })
    }
}

/// Parse a push `publishTime`, trying each known layout.
pub fn parse_publish_time(value: &str) -> Result<DateTime<Utc>> {
    PUBLISH_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
        .ok_or_else(|| Error::Decode(format!("unrecognized publish time {:?}", value)))
}

/// Type-erased registered handler.
#[async_trait]
trait PushDispatch: Send + Sync {
    async fn dispatch(&self, raw: RawMessage, delivery_attempt: Option<i32>) -> Outcome;
}

struct Registered<H> {
    handler: Arc<H>,
    shutdown: ShutdownSignal,
}

#[async_trait]
impl<H: Handler> PushDispatch for Registered<H> {
    async fn dispatch(&self, raw: RawMessage, delivery_attempt: Option<i32>) -> Outcome {
        let name = self.handler.subscription().name();
        let span = delivery_span(name, &raw.id, delivery_attempt);
        let context = HandlerContext::new(
            name,
            &raw.id,
            delivery_attempt,
            span.clone(),
            self.shutdown.clone(),
        );

        METRICS.messages_received_total.with_label_values(&[name]).inc();
        let outcome = invoke(self.handler.as_ref(), raw, context)
            .instrument(span)
            .await;
        if outcome.is_success() {
            METRICS.messages_acked_total.with_label_values(&[name]).inc();
        } else {
            METRICS.messages_nacked_total.with_label_values(&[name]).inc();
        }
        outcome
    }
}

type Registry = Arc<RwLock<HashMap<String, Arc<dyn PushDispatch>>>>;

struct FallbackConsumer {
    subscription: String,
    shutdown: ShutdownSignal,
    task: JoinHandle<Result<()>>,
}

/// HTTP push endpoint with a pull fallback.
pub struct PushServer {
    service: Arc<PubSubService>,
    mode: PushMode,
    registry: Registry,
    consumers: Mutex<Vec<FallbackConsumer>>,
    pull_options: PullOptions,
}

impl PushServer {
    /// Create a server whose mode follows the service configuration.
    pub fn new(service: Arc<PubSubService>) -> Self {
        let mode = if service.config().push_supported() {
            PushMode::Native
        } else {
            PushMode::PullFallback
        };
        Self {
            service,
            mode,
            registry: Arc::new(RwLock::new(HashMap::new())),
            consumers: Mutex::new(Vec::new()),
            pull_options: PullOptions::default(),
        }
    }

    /// Force a mode.
    pub fn with_mode(mut self, mode: PushMode) -> Self {
        self.mode = mode;
        self
    }

    /// Settings for fallback pull consumers.
    pub fn with_pull_options(mut self, options: PullOptions) -> Self {
        self.pull_options = options;
        self
    }

    /// Active mode.
    pub fn mode(&self) -> PushMode {
        self.mode
    }

    /// Register `handler` for its subscription, replacing any earlier one.
    ///
    /// In fallback mode this starts a pull consumer for the subscription.
    pub async fn register<H: Handler>(&self, handler: H) -> Result<()> {
        let handler = Arc::new(handler);
        let subscription = handler.subscription().id(self.service.project_id());

        match self.mode {
            PushMode::Native => {
                let entry: Arc<dyn PushDispatch> = Arc::new(Registered {
                    handler,
                    shutdown: self.service.shutdown_signal().clone(),
                });
                if self
                    .registry
                    .write()
                    .await
                    .insert(subscription.clone(), entry)
                    .is_some()
                {
                    warn!(subscription = %subscription, "Replacing push handler");
                }
                info!(subscription = %subscription, "Registered push handler");
            }
            PushMode::PullFallback => {
                let shutdown = self.service.shutdown_signal().child();
                let consumer = PullSubscriber::from_arc(Arc::clone(&self.service), handler)
                    .with_options(self.pull_options.clone())
                    .with_shutdown(shutdown.clone());
                let task = tokio::spawn(consumer.run());

                let mut consumers = self
                    .consumers
                    .lock()
                    .map_err(|_| Error::Internal("consumer list poisoned".to_string()))?;
                for previous in consumers.iter().filter(|c| c.subscription == subscription) {
                    warn!(subscription = %subscription, "Replacing pull consumer");
                    previous.shutdown.shutdown();
                }
                consumers.push(FallbackConsumer {
                    subscription: subscription.clone(),
                    shutdown,
                    task,
                });
                info!(subscription = %subscription, "Push unsupported, started pull consumer");
            }
        }
        Ok(())
    }

    /// HTTP routes: `POST` on any path delivers, `GET /metrics` scrapes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/", post(handle_push))
            .route("/{*path}", post(handle_push))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.registry))
    }

    /// Run until the service's shutdown signal fires.
    pub async fn run(&self) -> Result<()> {
        match self.mode {
            PushMode::Native => {
                let push = &self.service.config().push;
                let addr = format!("{}:{}", push.bind_address, push.port);
                let listener = TcpListener::bind(&addr).await?;
                info!("Push endpoint listening on {}", addr);
                self.serve(listener).await
            }
            PushMode::PullFallback => self.run_fallback().await,
        }
    }

    /// Serve push requests on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let shutdown = self.service.shutdown_signal().clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.wait_owned())
            .await?;
        info!("Push endpoint shut down");
        Ok(())
    }

    async fn run_fallback(&self) -> Result<()> {
        self.service.shutdown_signal().wait().await;

        let consumers: Vec<FallbackConsumer> = self
            .consumers
            .lock()
            .map(|mut consumers| consumers.drain(..).collect())
            .unwrap_or_default();
        for consumer in &consumers {
            consumer.shutdown.shutdown();
        }

        let mut failure = None;
        for consumer in consumers {
            match consumer.task.await {
                Ok(Ok(())) | Ok(Err(Error::Cancelled)) => {}
                Ok(Err(e)) => {
                    error!(subscription = %consumer.subscription, error = %e, "Pull consumer failed");
                    failure.get_or_insert(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(subscription = %consumer.subscription, "Pull consumer task failed: {}", e);
                    failure.get_or_insert(Error::Internal(e.to_string()));
                }
            }
        }

        debug!("Fallback pull consumers stopped");
        failure.map_or(Ok(()), Err)
    }
}

async fn metrics_handler() -> Response {
    match metrics::get_metrics().gather() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics").into_response()
        }
    }
}

async fn handle_push(State(registry): State<Registry>, body: Bytes) -> StatusCode {
    let status = deliver(&registry, &body).await;
    METRICS
        .push_requests_total
        .with_label_values(&[status.as_str()])
        .inc();
    status
}

async fn deliver(registry: &Registry, body: &[u8]) -> StatusCode {
    let envelope: PushEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Rejecting malformed push request: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let delivery_attempt = envelope.message.delivery_attempt;
    let raw = match envelope.message.into_raw() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                subscription = %envelope.subscription,
                error = %e,
                "Rejecting undecodable push message"
            );
            return StatusCode::BAD_REQUEST;
        }
    };

    let Some(dispatcher) = registry.read().await.get(&envelope.subscription).cloned() else {
        warn!(subscription = %envelope.subscription, "No handler registered for subscription");
        return StatusCode::NOT_FOUND;
    };

    // A dropped connection must not cancel the handler mid-flight.
    let outcome =
        tokio::spawn(async move { dispatcher.dispatch(raw, delivery_attempt).await }).await;

    match outcome {
        Ok(Outcome::Handled) => StatusCode::OK,
        Ok(Outcome::DecodeFailed(_)) => StatusCode::BAD_REQUEST,
        Ok(Outcome::Failed(_)) | Ok(Outcome::Panicked(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        Err(e) => {
            error!(subscription = %envelope.subscription, "Push dispatch task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use crate::config::RuntimeConfig;
    use crate::pubsub::handler::handler_fn;
    use crate::testing::InMemoryPubSub;
    use crate::types::{Subscription, Topic};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const SUB: &str = "projects/test-project/subscriptions/greetings-push";

    fn service(rpc: Arc<InMemoryPubSub>) -> Arc<PubSubService> {
        PubSubService::with_rpc(RuntimeConfig::new("test-project"), rpc, ShutdownSignal::new())
    }

    fn subscription() -> Subscription<TextCodec> {
        let topic = Topic::new("greetings").unwrap();
        Subscription::new("greetings-push", &topic).unwrap()
    }

    fn envelope(subscription: &str, data: &str) -> String {
        json!({
            "message": {
                "messageId": "123",
                "data": data,
                "publishTime": "2023-07-21T14:00:07Z",
                "attributes": {"origin": "test"}
            },
            "subscription": subscription
        })
        .to_string()
    }

    async fn post(router: Router, path: &str, body: String) -> StatusCode {
        router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn test_decode_push_message() {
        let envelope: PushEnvelope = serde_json::from_str(&envelope(SUB, "SGVq")).unwrap();
        let raw = envelope.message.into_raw().unwrap();

        assert_eq!(raw.id, "123");
        assert_eq!(raw.body, b"Hej");
        assert_eq!(raw.published_at.timestamp(), 1_689_948_007);
        assert_eq!(raw.attributes.get("origin").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_both_key_spellings_are_accepted() {
        let body = json!({
            "message": {
                "messageId": "9",
                "message_id": "9",
                "data": "",
                "publishTime": "2023-07-21T14:00:07.123Z",
                "publish_time": "2023-07-21T14:00:07.123Z",
                "attributes": null
            },
            "subscription": SUB
        });
        let envelope: PushEnvelope = serde_json::from_value(body).unwrap();
        let raw = envelope.message.into_raw().unwrap();
        assert_eq!(raw.id, "9");
        assert!(raw.body.is_empty());
        assert_eq!(raw.published_at.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_publish_time_formats() {
        assert_eq!(
            parse_publish_time("2023-07-21T14:00:07Z").unwrap().timestamp(),
            1_689_948_007
        );
        let precise = parse_publish_time("2023-07-21T14:00:07.250000Z").unwrap();
        assert_eq!(precise.timestamp(), 1_689_948_007);
        assert_eq!(precise.timestamp_subsec_millis(), 250);
        assert!(parse_publish_time("21/07/2023 14:00").is_err());
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_404() {
        let server = PushServer::new(service(Arc::new(InMemoryPubSub::new())));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        server
            .register(handler_fn(subscription(), move |_: Received<String>, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
            .await
            .unwrap();

        let status = post(
            server.router(),
            "/",
            envelope("projects/test-project/subscriptions/other", "SGVq"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = PushServer::new(service(Arc::new(InMemoryPubSub::new())));
        assert_eq!(server.mode(), PushMode::Native);

        server
            .register(handler_fn(subscription(), |message: Received<String>, _| async move {
                match message.body.as_str() {
                    "Hej" => Ok(()),
                    _ => Err(anyhow::anyhow!("unexpected body")),
                }
            }))
            .await
            .unwrap();

        assert_eq!(post(server.router(), "/", envelope(SUB, "SGVq")).await, StatusCode::OK);
        assert_eq!(
            post(server.router(), "/any/path", envelope(SUB, "SGVq")).await,
            StatusCode::OK
        );
        // "Nej"
        assert_eq!(
            post(server.router(), "/", envelope(SUB, "TmVq")).await,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        // Invalid UTF-8 fails in the codec.
        assert_eq!(
            post(server.router(), "/", envelope(SUB, "//4=")).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post(server.router(), "/", "{not json".to_string()).await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_reregistering_replaces_handler() {
        let server = PushServer::new(service(Arc::new(InMemoryPubSub::new())));
        server
            .register(handler_fn(subscription(), |_: Received<String>, _| async move {
                Err(anyhow::anyhow!("old handler"))
            }))
            .await
            .unwrap();
        server
            .register(handler_fn(subscription(), |_: Received<String>, _| async move { Ok(()) }))
            .await
            .unwrap();

        assert_eq!(post(server.router(), "/", envelope(SUB, "SGVq")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let server = PushServer::new(service(Arc::new(InMemoryPubSub::new())));
        let response = server
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_fallback_mode_pulls_and_stops() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let config = RuntimeConfig::new("test-project")
            .with_emulator("localhost:8085")
            .unwrap();
        let service = PubSubService::with_rpc(config, rpc.clone(), ShutdownSignal::new());
        let server = PushServer::new(service.clone());
        assert_eq!(server.mode(), PushMode::PullFallback);

        server
            .register(handler_fn(subscription(), |_: Received<String>, _| async move { Ok(()) }))
            .await
            .unwrap();

        for _ in 0..200 {
            if rpc.has_subscription(SUB) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(rpc.has_subscription(SUB));

        service.shutdown_signal().shutdown();
        server.run().await.unwrap();
        assert!(rpc.is_closed());
    }
}
