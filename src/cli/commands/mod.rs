// Commands module
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use crate::cli::{output::*, Commands};
use crate::codec::{BytesCodec, EncodedMessage};
use crate::config::RuntimeConfig;
use crate::pubsub::{
    handler_fn, HandlerContext, MessagePublisher, PubSubService, Publisher, PullOptions,
    PullSubscriber, PushMode, PushServer,
};
use crate::server::shutdown::{shutdown_on_signal, ShutdownSignal};
use crate::types::{RawMessage, Subscription, Topic};

/// Published message IDs, as printed by `publish`
#[derive(Debug, Serialize)]
struct PublishOutput {
    topic: String,
    message_ids: Vec<String>,
}

/// Execute a CLI command
pub async fn execute_command(config: RuntimeConfig, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Publish {
            topic,
            data,
            attributes,
        } => execute_publish(config, topic, data, attributes).await,
        Commands::Listen {
            subscription,
            topic,
            max_messages,
            delete_on_exit,
        } => execute_listen(config, subscription, topic, max_messages, delete_on_exit).await,
        Commands::ServePush {
            subscription,
            topic,
            port,
        } => execute_serve_push(config, subscription, topic, port).await,
        Commands::Config => print_json(&config),
    }
}

async fn execute_publish(
    config: RuntimeConfig,
    topic: String,
    data: Vec<String>,
    attributes: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let shutdown = ShutdownSignal::new();
    let service = PubSubService::init_shared(config, shutdown.clone(), None)
        .context("Failed to create Pub/Sub connection")?;
    let topic: Topic<BytesCodec> = Topic::new(topic)?;

    let messages: Vec<EncodedMessage> = data
        .into_iter()
        .map(|body| {
            attributes
                .iter()
                .fold(EncodedMessage::new(body), |message, (key, value)| {
                    message.with_attribute(key, value)
                })
        })
        .collect();

    let published = Publisher::new(Arc::clone(&service))
        .publish(&topic, &messages)
        .await
        .with_context(|| format!("Failed to publish to '{}'", topic.name()))?;

    print_success(&format!(
        "Published {} message(s) to '{}'",
        published.len(),
        topic.name()
    ));
    print_json(&PublishOutput {
        topic: topic.name().to_string(),
        message_ids: published.into_iter().map(|m| m.id).collect(),
    })?;

    shutdown.shutdown();
    service.run().await?;
    Ok(())
}

async fn execute_listen(
    config: RuntimeConfig,
    subscription: String,
    topic: String,
    max_messages: i32,
    delete_on_exit: bool,
) -> anyhow::Result<()> {
    let shutdown = ShutdownSignal::new();
    shutdown_on_signal(shutdown.clone());

    let service = PubSubService::init_shared(config, shutdown, None)
        .context("Failed to create Pub/Sub connection")?;
    let topic: Topic<BytesCodec> = Topic::new(topic)?;
    let subscription = Subscription::new(subscription, &topic)?;

    print_info(&format!(
        "Listening on '{}' (Ctrl+C to stop)",
        subscription.name()
    ));

    let options = PullOptions {
        max_messages,
        delete_on_shutdown: delete_on_exit,
        ..PullOptions::default()
    };
    let subscriber =
        PullSubscriber::new(Arc::clone(&service), handler_fn(subscription, log_message))
            .with_options(options);
    tokio::try_join!(subscriber.run(), service.run())?;
    Ok(())
}

async fn execute_serve_push(
    mut config: RuntimeConfig,
    subscription: String,
    topic: String,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.push.port = port;
    }

    let shutdown = ShutdownSignal::new();
    shutdown_on_signal(shutdown.clone());

    let service = PubSubService::init_shared(config, shutdown, None)
        .context("Failed to create Pub/Sub connection")?;
    let topic: Topic<BytesCodec> = Topic::new(topic)?;
    let subscription = Subscription::new(subscription, &topic)?;

    let server = PushServer::new(Arc::clone(&service));
    match server.mode() {
        PushMode::Native => print_info(&format!(
            "Accepting push deliveries for '{}' on port {}",
            subscription.name(),
            service.config().push.port
        )),
        PushMode::PullFallback => print_info(&format!(
            "Push unsupported here, pulling '{}' instead",
            subscription.name()
        )),
    }
    server
        .register(handler_fn(subscription, log_message))
        .await?;

    tokio::try_join!(server.run(), service.run())?;
    Ok(())
}

async fn log_message(message: RawMessage, context: HandlerContext) -> anyhow::Result<()> {
    info!(
        subscription = %context.subscription(),
        message_id = %message.id,
        published_at = %message.published_at,
        attributes = ?message.attributes,
        "{}",
        String::from_utf8_lossy(&message.body)
    );
    Ok(())
}
