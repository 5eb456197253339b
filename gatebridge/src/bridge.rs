//! Bridge orchestrator.
//!
//! Builds the component graph from configuration and runs it:
//!
//! ```text
//!   event log ──► EventConsumer ×N ──► ChatAdapter (post)
//!                                         │
//!   Slack ──► InteractionServer ──► InteractionDispatcher ──► GateDecisionMachine
//!                                                                 │
//!                                          GateStore (CAS) ◄──────┤
//!                                          EventPublisher ◄───────┘
//! ```
//!
//! Nothing here is global: every component receives its collaborators
//! explicitly, so tests can assemble the same graph over in-memory parts.

use prometheus_client::registry::Registry;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gatebridge_core::chat::{
    AdapterError, ChatAdapter, RecordingChatAdapter, SlackAdapter, SlackConfig,
};
use gatebridge_core::config::{BridgeDefaults, Config};
use gatebridge_core::consumer::{ConsumerConfig, EventConsumer};
use gatebridge_core::decision::GateDecisionMachine;
use gatebridge_core::events::{
    EventLog, EventPublisher, LogError, RedisEventLog, RedisStreamConfig,
};
use gatebridge_core::interaction::InteractionDispatcher;
use gatebridge_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use gatebridge_core::metrics::BridgeMetrics;
use gatebridge_core::rbac::RbacValidator;
use gatebridge_core::routing::RoutingPolicy;
use gatebridge_core::store::{DedupStore, GateStore, KeyLayout, RedisStore, StoreError};

use crate::admin::{AdminServer, AdminServerConfig};
use crate::interactions::InteractionServer;
use crate::signature::SlackVerifier;

/// Which chat adapter to wire in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ChatBackend {
    /// Slack Web API
    Slack,
    /// Records calls instead of sending them (development only)
    Mock,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("event log unavailable: {0}")]
    Log(#[from] LogError),

    #[error("chat adapter: {0}")]
    Chat(#[from] AdapterError),

    #[error("slack backend selected but no `slack` section is configured")]
    MissingSlackSettings,
}

/// Backing services the bridge runs against.
///
/// [`Bridge::connect`] fills this from Redis and Slack; tests fill it with
/// in-memory implementations.
pub struct Backends {
    pub store: Arc<dyn GateStore>,
    pub dedup: Arc<dyn DedupStore>,
    /// One log handle per consumer worker
    pub logs: Vec<Arc<dyn EventLog>>,
    pub publisher: Arc<dyn EventPublisher>,
    pub chat: Arc<dyn ChatAdapter>,
}

/// A fully wired bridge, ready to [`run`](Bridge::run).
pub struct Bridge {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<Registry>,
    store: Arc<dyn GateStore>,
    consumers: Vec<EventConsumer>,
    dispatcher: Arc<InteractionDispatcher>,
    verifier: Option<SlackVerifier>,
    defaults: BridgeDefaults,
}

impl Bridge {
    /// Connects to Redis (and Slack, unless `backend` is `Mock`) and assembles
    /// the bridge.
    ///
    /// # Errors
    ///
    /// Fails if Redis is unreachable or the Slack client cannot be built.
    pub async fn connect(
        config: &Config,
        defaults: BridgeDefaults,
        backend: ChatBackend,
    ) -> Result<Self, BridgeError> {
        let keys = KeyLayout::new(config.redis.key_prefix.clone());
        let store = Arc::new(RedisStore::connect(&config.redis.url, keys, config.dedup.ttl).await?);

        let streams = &config.streams;
        let stream_config = |consumer: String| RedisStreamConfig {
            stream: streams.events.clone(),
            group: streams.group.clone(),
            consumer,
            decision_stream: streams.decision_stream().to_string(),
            redelivery_timeout: streams.redelivery_timeout,
        };

        // Each reader blocks on its own connection.
        let mut logs: Vec<Arc<dyn EventLog>> = Vec::with_capacity(streams.consumers);
        for n in 1..=streams.consumers {
            let log =
                RedisEventLog::connect(&config.redis.url, stream_config(streams.consumer_name(n)))
                    .await?;
            logs.push(Arc::new(log));
        }
        let publisher = Arc::new(
            RedisEventLog::connect(
                &config.redis.url,
                stream_config(format!("{}-publisher", streams.instance)),
            )
            .await?,
        );

        let chat: Arc<dyn ChatAdapter> = match backend {
            ChatBackend::Mock => Arc::new(RecordingChatAdapter::new()),
            ChatBackend::Slack => {
                let settings = config
                    .slack
                    .as_ref()
                    .ok_or(BridgeError::MissingSlackSettings)?;
                let mut slack = SlackConfig::new(settings.bot_token.clone())
                    .with_timeout(settings.timeout)
                    .with_rate_limit(settings.rate_limit_per_sec);
                if let Some(url) = &settings.api_base_url {
                    slack = slack.with_api_base_url(url.clone());
                }
                Arc::new(SlackAdapter::new(slack)?)
            }
        };

        info!(
            redis_prefix = %config.redis.key_prefix,
            events_stream = %streams.events,
            decision_stream = %streams.decision_stream(),
            group = %streams.group,
            consumers = streams.consumers,
            chat = chat.name(),
            "Backends connected"
        );

        Ok(Self::assemble(
            config,
            defaults,
            Backends {
                store: store.clone(),
                dedup: store,
                logs,
                publisher,
                chat,
            },
        ))
    }

    /// Wires the components over the given backends.
    pub fn assemble(config: &Config, defaults: BridgeDefaults, backends: Backends) -> Self {
        let mut registry = Registry::default();
        let metrics = Arc::new(BridgeMetrics::new(&mut registry));

        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from(&defaults)));
        lifecycle.set_metrics(metrics.clone());

        let routing = Arc::new(RoutingPolicy::new(config.routing.clone()));
        let rbac = Arc::new(RbacValidator::new(config.rbac.clone()));

        let consumer_config = ConsumerConfig {
            batch_size: config.consumer.batch_size,
            block_timeout: config.consumer.block_timeout,
            claim_lease: config.consumer.claim_lease,
            error_backoff: config.consumer.error_backoff,
            evidence_base_url: config.evidence_base_url.clone(),
        };
        let consumers = backends
            .logs
            .into_iter()
            .map(|log| {
                EventConsumer::new(
                    log,
                    backends.store.clone(),
                    backends.dedup.clone(),
                    routing.clone(),
                    backends.chat.clone(),
                    metrics.clone(),
                    consumer_config.clone(),
                )
            })
            .collect();

        let machine = Arc::new(GateDecisionMachine::new(
            backends.store.clone(),
            backends.dedup,
            rbac.clone(),
            backends.publisher,
            backends.chat.clone(),
            metrics,
        ));
        let dispatcher = Arc::new(InteractionDispatcher::new(
            machine,
            backends.store.clone(),
            routing,
            rbac,
            backends.chat,
        ));

        let verifier = config
            .slack
            .as_ref()
            .and_then(|s| s.signing_secret())
            .map(SlackVerifier::new);

        Self {
            lifecycle,
            registry: Arc::new(registry),
            store: backends.store,
            consumers,
            dispatcher,
            verifier,
            defaults,
        }
    }

    /// Lifecycle handle; call `begin_shutdown` on it to stop the bridge.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        self.lifecycle.clone()
    }

    /// Whether interaction requests must carry a valid Slack signature.
    #[must_use]
    pub fn verifies_signatures(&self) -> bool {
        self.verifier.is_some()
    }

    /// Runs until the lifecycle's shutdown token fires, then drains.
    ///
    /// Consumers stop pulling as soon as shutdown begins. The HTTP servers
    /// keep answering (with 503 for new interactions) until the drain ends.
    pub async fn run(self) -> DrainResult {
        let lifecycle = self.lifecycle;
        lifecycle.mark_config_loaded();

        match self.store.ping().await {
            Ok(()) => lifecycle.set_store_reachable(true),
            Err(e) => warn!(error = %e, "Store not reachable at startup"),
        }
        let health_checker = lifecycle.spawn_store_health_checker(self.store.clone());

        let consumer_shutdown = lifecycle.shutdown_token();
        let workers: Vec<JoinHandle<()>> = self
            .consumers
            .into_iter()
            .map(|consumer| {
                let guard = lifecycle.consumer_started();
                let shutdown = consumer_shutdown.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    consumer.run(shutdown).await;
                })
            })
            .collect();

        let servers = CancellationToken::new();

        let admin = AdminServer::new(
            lifecycle.clone(),
            self.registry,
            AdminServerConfig::with_port(self.defaults.admin_port),
        );
        let admin_shutdown = servers.clone();
        let admin_task = tokio::spawn(async move {
            if let Err(e) = admin.run(admin_shutdown).await {
                error!(error = %e, "Admin server error");
            }
        });

        let interactions = InteractionServer::new(
            self.dispatcher,
            lifecycle.clone(),
            self.verifier,
            self.defaults.interactions_port,
        );
        let interactions_shutdown = servers.clone();
        let interactions_task = tokio::spawn(async move {
            if let Err(e) = interactions.run(interactions_shutdown).await {
                error!(error = %e, "Interaction endpoint error");
            }
        });

        lifecycle.mark_ready();
        info!(
            consumers = workers.len(),
            admin_port = self.defaults.admin_port,
            interactions_port = self.defaults.interactions_port,
            "Bridge ready"
        );

        consumer_shutdown.cancelled().await;

        let result = lifecycle.drain().await;
        match &result {
            DrainResult::Complete => info!("Drain complete"),
            DrainResult::Timeout { remaining } => {
                warn!(remaining, "Drain timed out, abandoning in-flight work");
            }
        }

        servers.cancel();
        for worker in workers {
            if !worker.is_finished() {
                worker.abort();
            }
        }
        let _ = tokio::join!(admin_task, interactions_task, health_checker);

        lifecycle.mark_stopped();
        info!("Bridge stopped");
        result
    }
}
