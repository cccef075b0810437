//! Pull consumer runtime.
//!
//! [`PullSubscriber`] polls one subscription until its shutdown signal fires.
//! Each non-empty batch runs as a shutdown blocker on the service: it drives
//! every message to an ack or a release even while the consumer is stopping,
//! and the shared connection stays open until it has. The poll loop holds a
//! blocker of its own for its orderly exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::Result;
use crate::metrics::METRICS;
use crate::pubsub::handler::{delivery_span, invoke, Handler, HandlerContext};
use crate::pubsub::proto::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PullRequest, ReceivedMessage,
};
use crate::pubsub::retry::{retry, PullFailure};
use crate::pubsub::service::PubSubService;
use crate::server::shutdown::ShutdownSignal;
use crate::types::RawMessage;

/// Messages requested per pull.
pub const DEFAULT_MAX_MESSAGES: i32 = 1000;

/// Client-side deadline of a single pull call.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Pull loop settings.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Upper bound on messages per pull response.
    pub max_messages: i32,
    /// Deadline of a single pull call.
    pub pull_timeout: Duration,
    /// Delete the subscription once the loop has stopped.
    pub delete_on_shutdown: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            delete_on_shutdown: false,
        }
    }
}

/// Drives one handler from a pull subscription.
pub struct PullSubscriber<H: Handler> {
    service: Arc<PubSubService>,
    handler: Arc<H>,
    options: PullOptions,
    shutdown: ShutdownSignal,
}

impl<H: Handler> PullSubscriber<H> {
    /// Consumer stopped by the service's shutdown signal.
    pub fn new(service: Arc<PubSubService>, handler: H) -> Self {
        Self::from_arc(service, Arc::new(handler))
    }

    /// Like [`new`](Self::new), for a handler that is already shared.
    pub fn from_arc(service: Arc<PubSubService>, handler: Arc<H>) -> Self {
        let shutdown = service.shutdown_signal().clone();
        Self {
            service,
            handler,
            options: PullOptions::default(),
            shutdown,
        }
    }

    /// Override the pull settings.
    pub fn with_options(mut self, options: PullOptions) -> Self {
        self.options = options;
        self
    }

    /// Stop on `shutdown` instead of the service's signal.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Poll until shut down.
    ///
    /// Pull failures never end the loop. Returns once the loop has stopped,
    /// the optional subscription deletion has finished and, if the whole
    /// service is shutting down, the shared connection has been torn down.
    pub async fn run(self) -> Result<()> {
        let subscription = self.handler.subscription().clone();
        let subscription_id = subscription.id(self.service.project_id());

        let (release, released) = oneshot::channel::<()>();
        self.service.register_shutdown_blocker(async move {
            let _ = released.await;
        });

        info!(subscription = %subscription_id, "Starting pull consumer");

        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            let request = PullRequest {
                subscription: subscription_id.clone(),
                max_messages: self.options.max_messages,
                ..Default::default()
            };

            let result = tokio::select! {
                _ = self.shutdown.wait() => break,
                result = self.service.rpc().pull(request, self.options.pull_timeout) => result,
            };

            match result {
                Ok(response) => {
                    failures = 0;
                    if response.received_messages.is_empty() {
                        continue;
                    }
                    self.dispatch(&subscription_id, response.received_messages);
                }
                Err(e) => {
                    if self.shutdown.is_shutdown() {
                        break;
                    }

                    let class = PullFailure::classify(&e);
                    let delay = class.delay(failures);
                    failures = failures.saturating_add(1);

                    METRICS
                        .pull_errors_total
                        .with_label_values(&[subscription.name(), class.as_str()])
                        .inc();
                    if class.is_unexpected() {
                        error!(
                            subscription = %subscription_id,
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Pull failed"
                        );
                    } else {
                        warn!(
                            subscription = %subscription_id,
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Pull failed, retrying"
                        );
                    }

                    if e.is_not_found() {
                        info!(subscription = %subscription_id, "Subscription missing, creating it");
                        if let Err(e) = self
                            .service
                            .create_subscription_if_needed(&subscription)
                            .await
                        {
                            error!(
                                subscription = %subscription_id,
                                error = %e,
                                "Failed to create subscription"
                            );
                        }
                    }

                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(subscription = %subscription_id, "Pull consumer stopping");

        if self.options.delete_on_shutdown {
            let service = Arc::clone(&self.service);
            let doomed = subscription.clone();
            let deletion = tokio::spawn(async move { service.delete_subscription(&doomed).await });
            match deletion.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    subscription = %subscription_id,
                    error = %e,
                    "Failed to delete subscription"
                ),
                Err(e) => error!(
                    subscription = %subscription_id,
                    "Subscription deletion task failed: {}", e
                ),
            }
        }

        let _ = release.send(());

        if self.service.shutdown_signal().is_shutdown() {
            self.service.run().await?;
        }

        info!(subscription = %subscription_id, "Pull consumer stopped");
        Ok(())
    }

    /// Handle a batch on a task that outlives the poll loop and holds the
    /// connection open until every message is acked or released.
    fn dispatch(&self, subscription_id: &str, messages: Vec<ReceivedMessage>) {
        let handler = Arc::clone(&self.handler);
        let service = Arc::clone(&self.service);
        let shutdown = self.shutdown.clone();
        let subscription_id = subscription_id.to_string();
        let batch_size = messages.len();

        debug!(subscription = %subscription_id, batch_size, "Dispatching batch");

        self.service.register_shutdown_blocker(async move {
            let mut tasks = JoinSet::new();
            for received in messages {
                tasks.spawn(handle_message(
                    Arc::clone(&handler),
                    Arc::clone(&service),
                    subscription_id.clone(),
                    shutdown.clone(),
                    received,
                ));
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(subscription = %subscription_id, "Message task failed: {}", e);
                }
            }
            debug!(subscription = %subscription_id, batch_size, "Batch handled");
        });
    }
}

async fn handle_message<H: Handler>(
    handler: Arc<H>,
    service: Arc<PubSubService>,
    subscription_id: String,
    shutdown: ShutdownSignal,
    received: ReceivedMessage,
) {
    let name = handler.subscription().name().to_string();
    let ReceivedMessage {
        ack_id,
        message,
        delivery_attempt,
    } = received;

    let Some(message) = message else {
        warn!(subscription = %subscription_id, "Delivery without a message, releasing it");
        release(&service, &subscription_id, &name, ack_id).await;
        return;
    };

    let raw = RawMessage::from_proto(message);
    let attempt = (delivery_attempt > 0).then_some(delivery_attempt);
    let span = delivery_span(&name, &raw.id, attempt);
    let context = HandlerContext::new(&name, &raw.id, attempt, span.clone(), shutdown);

    METRICS
        .messages_received_total
        .with_label_values(&[name.as_str()])
        .inc();

    async move {
        if invoke(handler.as_ref(), raw, context).await.is_success() {
            acknowledge(&service, &subscription_id, &name, ack_id).await;
        } else {
            release(&service, &subscription_id, &name, ack_id).await;
        }
    }
    .instrument(span)
    .await
}

async fn acknowledge(service: &PubSubService, subscription_id: &str, name: &str, ack_id: String) {
    let rpc = service.rpc();
    let request = AcknowledgeRequest {
        subscription: subscription_id.to_string(),
        ack_ids: vec![ack_id],
    };

    match retry(service.retry_policy(), "acknowledge", || rpc.acknowledge(request.clone())).await {
        Ok(()) => METRICS.messages_acked_total.with_label_values(&[name]).inc(),
        Err(e) => {
            METRICS
                .ack_errors_total
                .with_label_values(&[name, "acknowledge"])
                .inc();
            error!(error = %e, "Failed to acknowledge message");
        }
    }
}

/// Make the delivery immediately eligible for redelivery.
async fn release(service: &PubSubService, subscription_id: &str, name: &str, ack_id: String) {
    let rpc = service.rpc();
    let request = ModifyAckDeadlineRequest {
        subscription: subscription_id.to_string(),
        ack_ids: vec![ack_id],
        ack_deadline_seconds: 0,
    };

    match retry(service.retry_policy(), "release", || {
        rpc.modify_ack_deadline(request.clone())
    })
    .await
    {
        Ok(()) => METRICS.messages_nacked_total.with_label_values(&[name]).inc(),
        Err(e) => {
            METRICS
                .ack_errors_total
                .with_label_values(&[name, "release"])
                .inc();
            error!(error = %e, "Failed to release message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use crate::config::RuntimeConfig;
    use crate::error::Error;
    use crate::pubsub::handler::handler_fn;
    use crate::pubsub::publisher::{MessagePublisher, Publisher};
    use crate::testing::InMemoryPubSub;
    use crate::types::{Received, Subscription, Topic};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const SUB: &str = "projects/test-project/subscriptions/greetings-worker";

    fn service(rpc: Arc<InMemoryPubSub>) -> Arc<PubSubService> {
        PubSubService::with_rpc(RuntimeConfig::new("test-project"), rpc, ShutdownSignal::new())
    }

    fn descriptors() -> (Topic<TextCodec>, Subscription<TextCodec>) {
        let topic = Topic::new("greetings").unwrap();
        let sub = Subscription::new("greetings-worker", &topic).unwrap();
        (topic, sub)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_success_acks_and_failure_releases() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (topic, sub) = descriptors();
        service.create_subscription_if_needed(&sub).await.unwrap();

        let handler = handler_fn(sub, |message: Received<String>, _| async move {
            if message.body == "bad" {
                anyhow::bail!("rejected");
            }
            Ok(())
        });
        let consumer = tokio::spawn(PullSubscriber::new(service.clone(), handler).run());

        let published = Publisher::new(service.clone())
            .publish(&topic, &["good".to_string(), "bad".to_string()])
            .await
            .unwrap();

        wait_until(|| !rpc.acked_message_ids().is_empty() && !rpc.nacked_message_ids().is_empty())
            .await;
        assert_eq!(rpc.acked_message_ids(), vec![published[0].id.clone()]);
        assert!(rpc.nacked_message_ids().contains(&published[1].id));
        assert!(!rpc.acked_message_ids().contains(&published[1].id));

        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();
        assert!(rpc.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_subscription_is_created() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (_, sub) = descriptors();

        let handler = handler_fn(sub, |_: Received<String>, _| async move { Ok(()) });
        let consumer = tokio::spawn(PullSubscriber::new(service.clone(), handler).run());

        wait_until(|| rpc.has_subscription(SUB)).await;
        assert!(rpc.has_topic("projects/test-project/topics/greetings"));

        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_failures_do_not_stop_the_loop() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (_, sub) = descriptors();
        service.create_subscription_if_needed(&sub).await.unwrap();

        rpc.fail_next_pull(Error::Rpc(tonic::Status::unavailable("down")));
        rpc.fail_next_pull(Error::Rpc(tonic::Status::unavailable("down")));
        rpc.fail_next_pull(Error::Rpc(tonic::Status::internal("weird")));

        let handler = handler_fn(sub, |_: Received<String>, _| async move { Ok(()) });
        let consumer = tokio::spawn(PullSubscriber::new(service.clone(), handler).run());

        wait_until(|| rpc.pull_calls() >= 5).await;
        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deletes_subscription_before_returning() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (_, sub) = descriptors();
        service.create_subscription_if_needed(&sub).await.unwrap();

        let handler = handler_fn(sub, |_: Received<String>, _| async move { Ok(()) });
        let consumer = tokio::spawn(
            PullSubscriber::new(service.clone(), handler)
                .with_options(PullOptions {
                    delete_on_shutdown: true,
                    ..Default::default()
                })
                .run(),
        );

        wait_until(|| rpc.pull_calls() >= 1).await;
        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();

        assert!(!rpc.has_subscription(SUB));
        assert_eq!(rpc.delete_subscription_calls(), 1);

        // No poll is issued once the consumer has returned.
        let polls = rpc.pull_calls();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rpc.pull_calls(), polls);
    }

    #[tokio::test]
    async fn test_child_shutdown_leaves_service_running() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (_, sub) = descriptors();
        service.create_subscription_if_needed(&sub).await.unwrap();

        let stop = service.shutdown_signal().child();
        let handler = handler_fn(sub, |_: Received<String>, _| async move { Ok(()) });
        let consumer = tokio::spawn(
            PullSubscriber::new(service.clone(), handler)
                .with_shutdown(stop.clone())
                .run(),
        );

        stop.shutdown();
        consumer.await.unwrap().unwrap();
        assert!(!rpc.is_closed());
    }

    #[tokio::test]
    async fn test_batch_in_flight_at_shutdown_is_acked_before_close() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (topic, sub) = descriptors();
        service.create_subscription_if_needed(&sub).await.unwrap();

        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let handler = handler_fn(sub, move |_: Received<String>, _| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        });
        let consumer = tokio::spawn(PullSubscriber::new(service.clone(), handler).run());

        let published = Publisher::new(service.clone())
            .publish(&topic, &["slow".to_string()])
            .await
            .unwrap();

        wait_until(|| started.load(Ordering::SeqCst)).await;
        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();

        assert_eq!(rpc.acked_message_ids(), vec![published[0].id.clone()]);
        assert!(rpc.nacked_message_ids().is_empty());
        assert_eq!(rpc.in_flight(SUB), 0);
        assert_eq!(rpc.backlog(SUB), 0);
        assert!(rpc.is_closed());
    }

    #[tokio::test]
    async fn test_ack_failure_does_not_stop_the_loop() {
        let rpc = Arc::new(InMemoryPubSub::new());
        let service = service(rpc.clone());
        let (topic, sub) = descriptors();
        service.create_subscription_if_needed(&sub).await.unwrap();

        let ack_errors = || {
            METRICS
                .ack_errors_total
                .with_label_values(&["greetings-worker", "acknowledge"])
                .get()
        };
        let errors_before = ack_errors();
        rpc.fail_next_acknowledge(Error::Rpc(tonic::Status::permission_denied("no")));

        let handler = handler_fn(sub, |_: Received<String>, _| async move { Ok(()) });
        let consumer = tokio::spawn(PullSubscriber::new(service.clone(), handler).run());
        let publisher = Publisher::new(service.clone());

        let first = publisher.publish(&topic, &["one".to_string()]).await.unwrap();
        wait_until(|| ack_errors() > errors_before).await;
        let polls = rpc.pull_calls();

        let second = publisher.publish(&topic, &["two".to_string()]).await.unwrap();
        wait_until(|| !rpc.acked_message_ids().is_empty()).await;

        assert_eq!(rpc.acked_message_ids(), vec![second[0].id.clone()]);
        assert!(!rpc.acked_message_ids().contains(&first[0].id));
        // The first lease is left to expire on the server.
        assert_eq!(rpc.in_flight(SUB), 1);
        assert!(rpc.pull_calls() > polls);

        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();
    }

    /// Pull surface that fails or answers empty in a fixed order and records
    /// when each pull started.
    struct ScriptedPulls {
        script: Mutex<VecDeque<Option<Error>>>,
        started: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedPulls {
        fn new(script: Vec<Option<Error>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                started: Mutex::new(Vec::new()),
            }
        }

        fn started(&self) -> Vec<tokio::time::Instant> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl crate::pubsub::rpc::PubSubRpc for ScriptedPulls {
        async fn create_topic(&self, _: crate::pubsub::proto::Topic) -> Result<()> {
            Ok(())
        }

        async fn publish(
            &self,
            _: crate::pubsub::proto::PublishRequest,
        ) -> Result<crate::pubsub::proto::PublishResponse> {
            Ok(Default::default())
        }

        async fn create_subscription(&self, _: crate::pubsub::proto::Subscription) -> Result<()> {
            Ok(())
        }

        async fn delete_subscription(&self, _: String) -> Result<()> {
            Ok(())
        }

        async fn pull(
            &self,
            _: PullRequest,
            _: Duration,
        ) -> Result<crate::pubsub::proto::PullResponse> {
            self.started.lock().unwrap().push(tokio::time::Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Some(error)) => Err(error),
                Some(None) => Ok(Default::default()),
                None => std::future::pending().await,
            }
        }

        async fn acknowledge(&self, _: AcknowledgeRequest) -> Result<()> {
            Ok(())
        }

        async fn modify_ack_deadline(&self, _: ModifyAckDeadlineRequest) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_backoff_grows_and_resets_after_success() {
        let unavailable = || Some(Error::Rpc(tonic::Status::unavailable("down")));
        let rpc = Arc::new(ScriptedPulls::new(vec![
            unavailable(),
            unavailable(),
            None,
            unavailable(),
        ]));
        let service = PubSubService::with_rpc(
            RuntimeConfig::new("test-project"),
            rpc.clone(),
            ShutdownSignal::new(),
        );
        let (_, sub) = descriptors();

        let handler = handler_fn(sub, |_: Received<String>, _| async move { Ok(()) });
        let consumer = tokio::spawn(PullSubscriber::new(service.clone(), handler).run());

        wait_until(|| rpc.started().len() >= 5).await;
        let started = rpc.started();
        let gaps: Vec<Duration> = started.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::ZERO,
                Duration::from_millis(200),
            ]
        );

        service.shutdown_signal().shutdown();
        consumer.await.unwrap().unwrap();
    }
}
