//! Shared connection manager.
//!
//! [`PubSubService`] owns the single RPC connection of the process, the
//! idempotent provisioning calls, and the shutdown sequence: once the
//! shutdown signal fires, every registered blocker is awaited before the
//! connection and the token provider are torn down.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::pubsub::retry::{retry, Backoff, RetryPolicy};
use crate::pubsub::rpc::{GrpcRpc, PubSubRpc, TokenProvider};
use crate::server::shutdown::ShutdownSignal;
use crate::types::{Subscription, Topic};

/// How often the run loop performs connection upkeep.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

static SHARED: OnceCell<Arc<PubSubService>> = OnceCell::new();

type RunFuture = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

/// Process-wide handle to the remote Pub/Sub service.
pub struct PubSubService {
    config: RuntimeConfig,
    rpc: Arc<dyn PubSubRpc>,
    tokens: Option<Arc<dyn TokenProvider>>,
    shutdown: ShutdownSignal,
    retry: RetryPolicy,
    blockers: Mutex<Vec<JoinHandle<()>>>,
    run_task: Mutex<Option<RunFuture>>,
}

impl PubSubService {
    /// The process-wide instance, configured from the environment on first use.
    ///
    /// Concurrent first callers block until construction finishes and all
    /// receive the same instance. Must be called from within a Tokio runtime.
    pub fn shared() -> Result<Arc<Self>> {
        SHARED
            .get_or_try_init(|| {
                let config = RuntimeConfig::from_env()?;
                Self::connect(config, ShutdownSignal::new(), None)
            })
            .cloned()
    }

    /// Initialize the process-wide instance with explicit settings.
    ///
    /// Returns the existing instance if one was already constructed.
    pub fn init_shared(
        config: RuntimeConfig,
        shutdown: ShutdownSignal,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Arc<Self>> {
        let mut created = false;
        let service = SHARED.get_or_try_init(|| {
            created = true;
            Self::connect(config, shutdown, tokens)
        })?;
        if !created {
            warn!("Pub/Sub service already initialized, ignoring new configuration");
        }
        Ok(Arc::clone(service))
    }

    /// Build a service with its own gRPC connection.
    pub fn connect(
        config: RuntimeConfig,
        shutdown: ShutdownSignal,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Arc<Self>> {
        let rpc = GrpcRpc::new(&config, tokens.clone())?;
        let mut service = Self::build(config, Arc::new(rpc), shutdown);
        service.tokens = tokens;
        Ok(Arc::new(service))
    }

    /// Build a service over an arbitrary RPC implementation.
    pub fn with_rpc(
        config: RuntimeConfig,
        rpc: Arc<dyn PubSubRpc>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self::build(config, rpc, shutdown))
    }

    fn build(config: RuntimeConfig, rpc: Arc<dyn PubSubRpc>, shutdown: ShutdownSignal) -> Self {
        let retry = RetryPolicy::bounded(Backoff::from_config(&config.connection), 5);
        Self {
            config,
            rpc,
            tokens: None,
            shutdown,
            retry,
            blockers: Mutex::new(Vec::new()),
            run_task: Mutex::new(None),
        }
    }

    /// Project that owns all resources created through this service.
    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The underlying RPC surface.
    pub fn rpc(&self) -> &Arc<dyn PubSubRpc> {
        &self.rpc
    }

    /// Signal that starts the shutdown sequence.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Retry policy for publish and ack RPCs.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Drive the connection until shutdown, then tear it down.
    ///
    /// Idempotent: later callers await the same task. Teardown starts only
    /// after every registered shutdown blocker has completed.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let task = {
            let mut guard = self
                .run_task
                .lock()
                .map_err(|_| Error::Internal("run task lock poisoned".to_string()))?;
            guard
                .get_or_insert_with(|| {
                    let service = Arc::clone(self);
                    let handle = tokio::spawn(service.drive());
                    async move { handle.await.map_err(|e| e.to_string()) }
                        .boxed()
                        .shared()
                })
                .clone()
        };

        task.await
            .map_err(|e| Error::Internal(format!("Pub/Sub service task failed: {}", e)))
    }

    async fn drive(self: Arc<Self>) {
        let mut upkeep = tokio::time::interval(MAINTENANCE_INTERVAL);
        upkeep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        upkeep.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = upkeep.tick() => self.rpc.maintain().await,
            }
        }

        info!("Pub/Sub service shutting down, waiting for blockers");
        loop {
            let pending: Vec<JoinHandle<()>> = match self.blockers.lock() {
                Ok(mut blockers) => blockers.drain(..).collect(),
                Err(_) => Vec::new(),
            };
            if pending.is_empty() {
                break;
            }
            debug!(count = pending.len(), "Awaiting shutdown blockers");
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!("Shutdown blocker failed: {}", e);
                }
            }
        }

        self.rpc.close().await;
        if let Some(tokens) = &self.tokens {
            tokens.shutdown().await;
        }
        info!("Pub/Sub service stopped");
    }

    /// Keep the connection open until `task` completes.
    ///
    /// Blockers registered while shutdown is draining are awaited too.
    pub fn register_shutdown_blocker<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        match self.blockers.lock() {
            Ok(mut blockers) => {
                blockers.retain(|blocker| !blocker.is_finished());
                blockers.push(handle);
            }
            Err(_) => warn!("Blocker list poisoned, shutdown will not wait for task"),
        }
    }

    /// Create `topic`, treating "already exists" as success.
    pub async fn create_topic_if_needed<C>(&self, topic: &Topic<C>) -> Result<()> {
        match self.rpc.create_topic(topic.to_proto(self.project_id())).await {
            Ok(()) => {
                info!(topic = %topic.name(), "Created topic");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(topic = %topic.name(), "Topic already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create `subscription`, treating "already exists" as success.
    ///
    /// If its topic is missing, the topic is created and the subscription
    /// attempted exactly once more; a second "not found" is returned.
    pub async fn create_subscription_if_needed<C>(
        &self,
        subscription: &Subscription<C>,
    ) -> Result<()> {
        match self.try_create_subscription(subscription).await {
            Err(e) if e.is_not_found() => {
                debug!(
                    subscription = %subscription.name(),
                    topic = %subscription.topic().name(),
                    "Topic missing, creating it before the subscription"
                );
                self.create_topic_if_needed(subscription.topic()).await?;
                self.try_create_subscription(subscription).await
            }
            other => other,
        }
    }

    async fn try_create_subscription<C>(&self, subscription: &Subscription<C>) -> Result<()> {
        match self
            .rpc
            .create_subscription(subscription.to_proto(self.project_id()))
            .await
        {
            Ok(()) => {
                info!(subscription = %subscription.name(), "Created subscription");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(subscription = %subscription.name(), "Subscription already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete `subscription`, treating "not found" as success.
    ///
    /// Transient failures are retried until the call succeeds or fails
    /// with a non-transient error.
    pub async fn delete_subscription<C>(&self, subscription: &Subscription<C>) -> Result<()> {
        let name = subscription.id(self.project_id());
        let policy = RetryPolicy::unbounded(self.retry.backoff.clone());
        let rpc = &self.rpc;

        let result = retry(&policy, "delete_subscription", move || {
            rpc.delete_subscription(name.clone())
        })
        .await;

        match result {
            Ok(()) => {
                info!(subscription = %subscription.name(), "Deleted subscription");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
