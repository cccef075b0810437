// Integration tests for the connection manager lifecycle and retry schedules
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pubsub_runtime::error::Error;
use pubsub_runtime::pubsub::retry::{PullFailure, MAX_PULL_BACKOFF};
use pubsub_runtime::pubsub::Backoff;
use pubsub_runtime::testing::InMemoryPubSub;
use pubsub_runtime::{PubSubService, RuntimeConfig, ShutdownSignal, Subscription, TextCodec, Topic};

fn service(rpc: Arc<InMemoryPubSub>) -> Arc<PubSubService> {
    PubSubService::with_rpc(RuntimeConfig::new("lifecycle"), rpc, ShutdownSignal::new())
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    let rpc = Arc::new(InMemoryPubSub::new());
    let service = service(rpc.clone());
    let topic: Topic<TextCodec> = Topic::new("events").unwrap();
    let subscription = Subscription::new("events-audit", &topic).unwrap();

    for _ in 0..3 {
        service.create_topic_if_needed(&topic).await.unwrap();
        service
            .create_subscription_if_needed(&subscription)
            .await
            .unwrap();
    }
    assert!(rpc.has_topic("projects/lifecycle/topics/events"));
    assert!(rpc.has_subscription("projects/lifecycle/subscriptions/events-audit"));

    service.delete_subscription(&subscription).await.unwrap();
    service.delete_subscription(&subscription).await.unwrap();
    assert!(!rpc.has_subscription("projects/lifecycle/subscriptions/events-audit"));
}

#[tokio::test]
async fn test_teardown_waits_for_blockers() {
    let rpc = Arc::new(InMemoryPubSub::new());
    let service = service(rpc.clone());

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    service.register_shutdown_blocker(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!rpc.is_closed());

    service.shutdown_signal().shutdown();
    service.run().await.unwrap();
    runner.await.unwrap().unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert!(rpc.is_closed());
}

#[tokio::test]
async fn test_calls_fail_after_teardown() {
    let rpc = Arc::new(InMemoryPubSub::new());
    let service = service(rpc.clone());
    let topic: Topic<TextCodec> = Topic::new("late").unwrap();

    service.shutdown_signal().shutdown();
    service.run().await.unwrap();

    let result = service.create_topic_if_needed(&topic).await;
    assert!(matches!(result, Err(Error::ChannelClosed)));
    assert!(rpc.is_closed());
}

#[test]
fn test_backoff_schedule() {
    let backoff = Backoff::default();
    assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
    assert_eq!(backoff.base_delay(1), Duration::from_millis(160));

    let mut previous = Duration::ZERO;
    for attempt in 0..20 {
        let delay = backoff.base_delay(attempt);
        assert!(delay >= previous);
        assert!(delay <= Duration::from_secs(1));
        previous = delay;
    }
    assert_eq!(previous, Duration::from_secs(1));

    for attempt in 0..10 {
        let jittered = backoff.delay(attempt);
        let base = backoff.base_delay(attempt);
        assert!(jittered >= base.mul_f64(0.8) && jittered <= base.mul_f64(1.2));
    }
}

#[test]
fn test_pull_backoff_is_linear_and_capped() {
    let failure = PullFailure::classify(&Error::Rpc(tonic::Status::unavailable("down")));
    assert_eq!(failure, PullFailure::Unavailable);
    assert_eq!(failure.delay(0), Duration::from_millis(200));
    assert_eq!(failure.delay(2), Duration::from_millis(600));
    assert_eq!(failure.delay(10_000), MAX_PULL_BACKOFF);

    // A success resets the streak, so the next failure starts from the base delay.
    assert_eq!(failure.delay(0), failure.base_delay());

    assert_eq!(
        PullFailure::classify(&Error::ChannelClosed),
        PullFailure::ChannelClosed
    );
    assert!(PullFailure::classify(&Error::Rpc(tonic::Status::internal("?"))).is_unexpected());
}
