//! Handler contract shared by the pull and push runtimes.
//!
//! A [`Handler`] names the subscription it services and processes one decoded
//! message at a time. Handlers are treated as untrusted: errors, cancellation
//! and panics all count as a failed delivery and never reach the runtime.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, field, info_span, warn, Span};

use crate::codec::MessageCodec;
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::server::shutdown::ShutdownSignal;
use crate::types::{RawMessage, Subscription};

/// User-supplied processing logic for one subscription.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Codec used to decode deliveries.
    type Codec: MessageCodec;

    /// The subscription this handler services.
    fn subscription(&self) -> &Subscription<Self::Codec>;

    /// Process one message. `Ok` acknowledges the delivery; anything else
    /// releases it for redelivery.
    async fn handle(
        &self,
        message: <Self::Codec as MessageCodec>::Incoming,
        context: HandlerContext,
    ) -> anyhow::Result<()>;
}

/// Per-delivery context handed to a [`Handler`].
#[derive(Debug, Clone)]
pub struct HandlerContext {
    subscription: String,
    message_id: String,
    delivery_attempt: Option<i32>,
    span: Span,
    shutdown: ShutdownSignal,
}

impl HandlerContext {
    pub(crate) fn new(
        subscription: &str,
        message_id: &str,
        delivery_attempt: Option<i32>,
        span: Span,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            subscription: subscription.to_string(),
            message_id: message_id.to_string(),
            delivery_attempt,
            span,
            shutdown,
        }
    }

    /// Short name of the subscription the message arrived on.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Stable message ID.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Delivery attempt counter, when the service reports one.
    pub fn delivery_attempt(&self) -> Option<i32> {
        self.delivery_attempt
    }

    /// Span covering this delivery; child spans and events attach to it.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether the consumer has been asked to stop.
    ///
    /// The delivery is still driven to an ack or release either way.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Completes once the consumer has been asked to stop.
    pub async fn shutting_down(&self) {
        self.shutdown.wait().await
    }

    /// Fail with [`Error::Cancelled`] if the consumer is stopping.
    ///
    /// Handlers that honor cancellation between steps can use
    /// `context.ensure_active()?`; the delivery is then released.
    pub fn ensure_active(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A [`Handler`] built from a subscription and an async closure.
pub struct FnHandler<C, F> {
    subscription: Subscription<C>,
    f: F,
    _codec: PhantomData<fn() -> C>,
}

/// Build a handler from a closure.
pub fn handler_fn<C, F, Fut>(subscription: Subscription<C>, f: F) -> FnHandler<C, F>
where
    C: MessageCodec,
    F: Fn(C::Incoming, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        subscription,
        f,
        _codec: PhantomData,
    }
}

#[async_trait]
impl<C, F, Fut> Handler for FnHandler<C, F>
where
    C: MessageCodec,
    F: Fn(C::Incoming, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    type Codec = C;

    fn subscription(&self) -> &Subscription<C> {
        &self.subscription
    }

    async fn handle(&self, message: C::Incoming, context: HandlerContext) -> anyhow::Result<()> {
        (self.f)(message, context).await
    }
}

/// How a single delivery ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The handler returned `Ok`.
    Handled,
    /// The payload could not be decoded; the handler was not called.
    DecodeFailed(Error),
    /// The handler returned an error.
    Failed(anyhow::Error),
    /// The handler panicked.
    Panicked(String),
}

impl Outcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, Outcome::Handled)
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Handled => "handled",
            Outcome::DecodeFailed(_) => "decode_error",
            Outcome::Failed(_) => "handler_error",
            Outcome::Panicked(_) => "panic",
        }
    }
}

/// Span wrapping one delivery, including its ack or release.
pub(crate) fn delivery_span(
    subscription: &str,
    message_id: &str,
    delivery_attempt: Option<i32>,
) -> Span {
    let span = info_span!(
        "pubsub.handle",
        subscription = %subscription,
        message_id = %message_id,
        delivery_attempt = field::Empty,
        outcome = field::Empty,
    );
    if let Some(attempt) = delivery_attempt {
        span.record("delivery_attempt", attempt);
    }
    span
}

/// Decode `raw` and run the handler on it, containing every failure.
///
/// Must be called inside the span carried by `context`.
pub(crate) async fn invoke<H: Handler>(
    handler: &H,
    raw: RawMessage,
    context: HandlerContext,
) -> Outcome {
    let span = context.span.clone();
    let subscription = context.subscription.clone();

    let outcome = match <H::Codec as MessageCodec>::decode(raw) {
        Err(e) => {
            warn!(error = %e, "Failed to decode message");
            Outcome::DecodeFailed(e)
        }
        Ok(message) => {
            let timer = METRICS
                .handler_duration_seconds
                .with_label_values(&[subscription.as_str()])
                .start_timer();
            let result = AssertUnwindSafe(handler.handle(message, context))
                .catch_unwind()
                .await;
            timer.observe_duration();

            match result {
                Ok(Ok(())) => Outcome::Handled,
                Ok(Err(e)) => {
                    error!(error = ?e, "Handler failed");
                    Outcome::Failed(e)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "Handler panicked");
                    Outcome::Panicked(message)
                }
            }
        }
    };

    span.record("outcome", outcome.label());
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use crate::types::{Attributes, Received, Topic};
    use chrono::Utc;

    fn subscription() -> Subscription<TextCodec> {
        let topic = Topic::new("greetings").unwrap();
        Subscription::new("greetings-worker", &topic).unwrap()
    }

    fn raw(body: &[u8]) -> RawMessage {
        Received {
            id: "7".to_string(),
            published_at: Utc::now(),
            attributes: Attributes::new(),
            body: body.to_vec(),
        }
    }

    fn context(shutdown: ShutdownSignal) -> HandlerContext {
        let span = delivery_span("greetings-worker", "7", Some(1));
        HandlerContext::new("greetings-worker", "7", Some(1), span, shutdown)
    }

    #[tokio::test]
    async fn test_successful_handler() {
        let handler = handler_fn(subscription(), |message: Received<String>, ctx| async move {
            assert_eq!(message.body, "Hello");
            assert_eq!(ctx.message_id(), "7");
            assert_eq!(ctx.delivery_attempt(), Some(1));
            Ok(())
        });

        let outcome = invoke(&handler, raw(b"Hello"), context(ShutdownSignal::new())).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_decode_failure_skips_handler() {
        let handler = handler_fn(subscription(), |_: Received<String>, _| async move {
            if true {
                panic!("handler must not run");
            }
            Ok(())
        });

        let outcome = invoke(&handler, raw(&[0xFF]), context(ShutdownSignal::new())).await;
        assert!(matches!(outcome, Outcome::DecodeFailed(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let failing = handler_fn(subscription(), |_: Received<String>, _| async move {
            Err(anyhow::anyhow!("boom"))
        });
        let outcome = invoke(&failing, raw(b"x"), context(ShutdownSignal::new())).await;
        assert!(matches!(outcome, Outcome::Failed(_)));

        let panicking = handler_fn(subscription(), |_: Received<String>, _| async move {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        match invoke(&panicking, raw(b"x"), context(ShutdownSignal::new())).await {
            Outcome::Panicked(message) => assert_eq!(message, "kaboom"),
            other => panic!("Expected panic outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_is_a_failure() {
        let shutdown = ShutdownSignal::new();
        shutdown.shutdown();

        let handler = handler_fn(subscription(), |_: Received<String>, ctx| async move {
            ctx.ensure_active()?;
            Ok::<_, anyhow::Error>(())
        });
        let outcome = invoke(&handler, raw(b"x"), context(shutdown)).await;
        assert!(!outcome.is_success());
    }
}
