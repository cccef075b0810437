//! # pubsub-runtime
//!
//! A client-side runtime for Google Cloud Pub/Sub.
//!
//! The crate wraps one shared gRPC connection ([`PubSubService`]) and builds
//! three message paths on top of it: a [`Publisher`], a long-running
//! [`PullSubscriber`], and a [`PushServer`] that accepts push deliveries over
//! HTTP or falls back to pulling when the environment cannot push.
//!
//! ```no_run
//! use pubsub_runtime::{
//!     handler_fn, PubSubService, PullSubscriber, Received, Subscription, TextCodec, Topic,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = PubSubService::shared()?;
//! let topic: Topic<TextCodec> = Topic::new("greetings")?;
//! let subscription = Subscription::new("greetings-worker", &topic)?;
//!
//! let handler = handler_fn(subscription, |message: Received<String>, _ctx| async move {
//!     println!("{}", message.body);
//!     Ok(())
//! });
//! PullSubscriber::new(service, handler).run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pubsub;
pub mod server;
pub mod testing;
pub mod types;

pub use codec::{BytesCodec, EncodedMessage, JsonCodec, MessageCodec, TextCodec};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use pubsub::{
    handler_fn, Handler, HandlerContext, MessagePublisher, PubSubService, Publisher, PullOptions,
    PullSubscriber, PushMode, PushServer,
};
pub use server::shutdown::ShutdownSignal;
pub use types::{Attributes, PublishedMessage, Received, Subscription, Topic};
