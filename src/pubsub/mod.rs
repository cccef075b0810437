//! Client runtime for Google Cloud Pub/Sub.
//!
//! This module contains:
//! - The shared connection manager ([`PubSubService`]) and its RPC seam
//! - Publishing with on-demand topic creation
//! - The pull consumer loop with ack/release and subscription recreation
//! - The push endpoint, with a pull fallback for environments without push

// Include generated protobuf code
/// Generated Protocol Buffer definitions for Google Cloud Pub/Sub v1 API.
///
/// Client stubs and the message types they exchange.
#[allow(clippy::all, unused_imports, dead_code, missing_docs)]
pub mod proto {
    include!("generated/google.pubsub.v1.rs");
}

pub mod handler;
pub mod publisher;
pub mod push;
pub mod retry;
pub mod rpc;
pub mod service;
pub mod subscriber;

pub use handler::{handler_fn, FnHandler, Handler, HandlerContext};
pub use publisher::{MessagePublisher, Publisher};
pub use push::{PushEnvelope, PushMessage, PushMode, PushServer};
pub use retry::{Backoff, RetryPolicy};
pub use rpc::{GrpcRpc, PubSubRpc, StaticTokenProvider, TokenProvider};
pub use service::PubSubService;
pub use subscriber::{PullOptions, PullSubscriber};
