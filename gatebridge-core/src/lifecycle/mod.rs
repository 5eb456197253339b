//! Operational lifecycle management for the bridge.
//!
//! This module provides:
//! - Lifecycle state tracking
//! - Health and readiness probes
//! - Graceful shutdown with request draining
//! - Periodic store reachability checks
//!
//! ## Lifecycle States
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! - **Starting**: Initialization in progress
//! - **Ready**: Consuming events and serving interactions
//! - **ShuttingDown**: Draining, rejecting new requests
//! - **Stopped**: Shutdown complete

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeDefaults;
use crate::metrics::BridgeMetrics;
use crate::store::GateStore;

pub mod health;

pub use health::{HealthResponse, ReadinessChecks, ReadinessResponse, health_router};

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Initialization in progress
    Starting,
    /// Consuming and serving
    Ready,
    /// Draining, rejecting new requests
    ShuttingDown,
    /// Shutdown complete
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for lifecycle management.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Overall shutdown timeout (default: 30s)
    pub shutdown_timeout: Duration,
    /// Drain timeout (default: 25s, must be < shutdown_timeout)
    pub drain_timeout: Duration,
    /// Store reachability check interval (default: 10s)
    pub store_health_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&BridgeDefaults::default())
    }
}

impl From<&BridgeDefaults> for LifecycleConfig {
    /// Takes the timeouts from process defaults, clamping the drain timeout
    /// so that at least one second is left for cleanup.
    fn from(defaults: &BridgeDefaults) -> Self {
        const MIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
        const MIN_POST_DRAIN_BUFFER: Duration = Duration::from_secs(1);

        let shutdown_timeout = defaults.shutdown_timeout;
        let max_drain = shutdown_timeout
            .saturating_sub(MIN_POST_DRAIN_BUFFER)
            .max(MIN_DRAIN_TIMEOUT);

        let drain_timeout = if defaults.drain_timeout > max_drain {
            warn!(
                drain_timeout_secs = defaults.drain_timeout.as_secs(),
                shutdown_timeout_secs = shutdown_timeout.as_secs(),
                adjusted_drain_secs = max_drain.as_secs(),
                "drain_timeout must leave room before shutdown_timeout, adjusting"
            );
            max_drain
        } else {
            defaults.drain_timeout.max(MIN_DRAIN_TIMEOUT)
        };

        Self {
            shutdown_timeout,
            drain_timeout,
            store_health_interval: defaults.health_check_interval,
        }
    }
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

/// Coordinates startup, readiness and shutdown.
///
/// - Tracks lifecycle state (Starting → Ready → ShuttingDown → Stopped)
/// - Counts in-flight interaction requests for draining
/// - Holds the readiness flags reported by `/ready`
/// - Owns the shutdown `CancellationToken` shared with consumers
///
/// All state is atomic; the manager is shared behind an `Arc`.
pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    active_requests: AtomicUsize,

    config_loaded: AtomicBool,
    store_reachable: AtomicBool,
    /// Consumer workers currently inside their run loop
    running_consumers: AtomicUsize,

    config: LifecycleConfig,
    version: &'static str,
    metrics: ArcSwapOption<BridgeMetrics>,
}

impl LifecycleManager {
    /// Creates a new lifecycle manager in the `Starting` state.
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            state: ArcSwap::new(Arc::new(LifecycleState::Starting)),
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            active_requests: AtomicUsize::new(0),
            config_loaded: AtomicBool::new(false),
            store_reachable: AtomicBool::new(false),
            running_consumers: AtomicUsize::new(0),
            config,
            version: env!("CARGO_PKG_VERSION"),
            metrics: ArcSwapOption::empty(),
        }
    }

    /// Wire metrics so the health checker can refresh the uptime gauge.
    pub fn set_metrics(&self, metrics: Arc<BridgeMetrics>) {
        self.metrics.store(Some(metrics));
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Returns true if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), LifecycleState::Ready)
    }

    /// Returns true if the service is shutting down or stopped.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::ShuttingDown | LifecycleState::Stopped
        )
    }

    /// Transition to Ready state.
    pub fn mark_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
        info!(
            version = %self.version,
            startup_duration_ms = self.started_at.elapsed().as_millis(),
            "GateBridge ready"
        );
    }

    /// Mark configuration as loaded and validated.
    pub fn mark_config_loaded(&self) {
        self.config_loaded.store(true, Ordering::SeqCst);
    }

    /// Record the result of a store reachability probe.
    pub fn set_store_reachable(&self, reachable: bool) {
        let was = self.store_reachable.swap(reachable, Ordering::SeqCst);
        if was != reachable {
            if reachable {
                info!("Store reachable");
            } else {
                warn!("Store unreachable");
            }
        }
    }

    /// Track a running consumer (returns RAII guard).
    ///
    /// Readiness requires at least one running consumer.
    #[must_use]
    pub fn consumer_started(self: &Arc<Self>) -> ConsumerGuard {
        self.running_consumers.fetch_add(1, Ordering::SeqCst);
        ConsumerGuard {
            manager: Arc::clone(self),
        }
    }

    /// Returns the number of running consumers.
    #[must_use]
    pub fn running_consumer_count(&self) -> usize {
        self.running_consumers.load(Ordering::SeqCst)
    }

    /// Returns a clone of the shutdown token.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Begin graceful shutdown.
    ///
    /// Sets state to ShuttingDown and cancels the shutdown token, which stops
    /// consumers from pulling further events.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.shutdown_token.cancel();
        info!(
            active_requests = self.active_requests.load(Ordering::SeqCst),
            running_consumers = self.running_consumers.load(Ordering::SeqCst),
            "Shutdown initiated"
        );
    }

    /// Track an active request (returns RAII guard).
    ///
    /// Returns `None` if the service is shutting down.
    #[must_use]
    pub fn track_request(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            manager: Arc::clone(self),
        })
    }

    /// Returns the current active request count.
    #[must_use]
    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Returns uptime in seconds.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Returns the version string.
    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Get readiness checks status.
    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        ReadinessChecks {
            config_loaded: self.config_loaded.load(Ordering::SeqCst),
            store_reachable: self.store_reachable.load(Ordering::SeqCst),
            consumers_running: self.running_consumers.load(Ordering::SeqCst) > 0,
        }
    }

    /// Waits for in-flight requests and consumers to finish, polling every
    /// 100ms, up to the drain timeout.
    pub async fn drain(&self) -> DrainResult {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut last_log = tokio::time::Instant::now();

        loop {
            let active = self.active_requests.load(Ordering::SeqCst)
                + self.running_consumers.load(Ordering::SeqCst);

            if active == 0 {
                return DrainResult::Complete;
            }

            if tokio::time::Instant::now() > deadline {
                warn!(remaining = active, "Drain timeout exceeded, forcing shutdown");
                return DrainResult::Timeout { remaining: active };
            }

            if last_log.elapsed() >= Duration::from_secs(5) {
                info!(remaining = active, "Draining...");
                last_log = tokio::time::Instant::now();
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Mark as stopped.
    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// Spawns a background task that pings the store every
    /// `store_health_interval` until shutdown.
    pub fn spawn_store_health_checker(
        self: &Arc<Self>,
        store: Arc<dyn GateStore>,
    ) -> tokio::task::JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        let shutdown_token = self.shutdown_token.clone();
        let interval_duration = self.config.store_health_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_token.cancelled() => {
                        debug!("Store health checker stopping due to shutdown");
                        break;
                    }
                    _ = interval.tick() => {
                        match store.ping().await {
                            Ok(()) => lifecycle.set_store_reachable(true),
                            Err(e) => {
                                warn!(error = %e, "Store health check failed");
                                lifecycle.set_store_reachable(false);
                            }
                        }
                        if let Some(metrics) = lifecycle.metrics.load().as_ref() {
                            metrics.set_uptime(lifecycle.uptime_seconds());
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// Environment Validation
// ============================================================================

/// Refuses the recording chat adapter in production.
///
/// `GATEBRIDGE_ENVIRONMENT` defaults to production when unset; set it to
/// `development` or `test` to allow `--chat mock`.
///
/// # Errors
///
/// Returns a descriptive error string if unsafe configuration is detected.
pub fn validate_environment(mock_chat: bool) -> Result<(), String> {
    let environment =
        std::env::var("GATEBRIDGE_ENVIRONMENT").unwrap_or_else(|_| "production".to_string());
    let is_production = matches!(environment.as_str(), "production" | "prod" | "");

    if mock_chat {
        if is_production {
            return Err("--chat mock is not allowed in production. \
                 Set GATEBRIDGE_ENVIRONMENT=development to use the mock adapter."
                .to_string());
        }
        warn!(
            environment = %environment,
            "Mock chat adapter is active; notifications are recorded, not sent"
        );
    }

    if is_production {
        info!("Production environment validated");
    } else {
        info!(environment = %environment, "Non-production environment");
    }

    Ok(())
}

// ============================================================================
// Guards
// ============================================================================

/// RAII guard for request tracking.
///
/// Dropping the guard decrements the active request counter, including when
/// the handler panics.
pub struct RequestGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

/// RAII guard held by a consumer worker while its loop runs.
pub struct ConsumerGuard {
    manager: Arc<LifecycleManager>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.manager.running_consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Drain Result
// ============================================================================

/// Result of draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// Everything finished before the timeout
    Complete,
    /// Timeout reached with work still running
    Timeout {
        /// Requests plus consumers still active
        remaining: usize,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serial_test::serial;

    #[test]
    fn test_lifecycle_state_transitions() {
        let lifecycle = LifecycleManager::new(LifecycleConfig::default());
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(!lifecycle.is_ready());

        lifecycle.mark_ready();
        assert!(lifecycle.is_ready());
        assert!(!lifecycle.is_shutting_down());

        lifecycle.begin_shutdown();
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);
        assert!(lifecycle.is_shutting_down());
        assert!(lifecycle.shutdown_token().is_cancelled());

        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(lifecycle.is_shutting_down());
    }

    #[test]
    fn test_request_tracking_rejects_during_shutdown() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_ready();

        let guard = lifecycle.track_request();
        assert!(guard.is_some());
        assert_eq!(lifecycle.active_request_count(), 1);
        drop(guard);
        assert_eq!(lifecycle.active_request_count(), 0);

        lifecycle.begin_shutdown();
        assert!(lifecycle.track_request().is_none());
        assert_eq!(lifecycle.active_request_count(), 0);
    }

    #[test]
    fn test_readiness_checks() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        assert!(!lifecycle.readiness_checks().all_pass());

        lifecycle.mark_config_loaded();
        lifecycle.set_store_reachable(true);
        assert_eq!(
            lifecycle.readiness_checks().first_failure(),
            Some("consumers_running")
        );

        let guard = lifecycle.consumer_started();
        assert!(lifecycle.readiness_checks().all_pass());
        assert_eq!(lifecycle.running_consumer_count(), 1);

        drop(guard);
        assert!(!lifecycle.readiness_checks().consumers_running);
    }

    #[test]
    fn test_config_from_defaults_clamps_drain() {
        let config = LifecycleConfig::default();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.drain_timeout, Duration::from_secs(25));

        let config = LifecycleConfig::from(&BridgeDefaults {
            drain_timeout: Duration::from_secs(40),
            ..BridgeDefaults::default()
        });
        assert_eq!(config.drain_timeout, Duration::from_secs(29));

        let config = LifecycleConfig::from(&BridgeDefaults {
            drain_timeout: Duration::ZERO,
            ..BridgeDefaults::default()
        });
        assert_eq!(config.drain_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_drain_waits_for_requests_and_consumers() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig {
            drain_timeout: Duration::from_millis(500),
            ..Default::default()
        }));
        lifecycle.mark_ready();
        let request = lifecycle.track_request();
        let consumer = lifecycle.consumer_started();
        lifecycle.begin_shutdown();

        let drain = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(request);
        drop(consumer);

        assert_eq!(drain.await.unwrap(), DrainResult::Complete);
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig {
            drain_timeout: Duration::from_millis(100),
            ..Default::default()
        }));
        let _consumer = lifecycle.consumer_started();
        lifecycle.begin_shutdown();

        assert_eq!(
            lifecycle.drain().await,
            DrainResult::Timeout { remaining: 1 }
        );
    }

    #[tokio::test]
    async fn test_request_guard_panic_safety() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        lifecycle.mark_ready();

        let lifecycle_clone = lifecycle.clone();
        let handle = tokio::spawn(async move {
            let _guard = lifecycle_clone.track_request();
            tokio::time::sleep(Duration::from_millis(10)).await;
            panic!("Simulated panic in request handler");
        });

        assert!(handle.await.is_err());
        assert_eq!(lifecycle.active_request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_health_checker_marks_reachable() {
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig {
            store_health_interval: Duration::from_secs(10),
            ..Default::default()
        }));
        let metrics = Arc::new(BridgeMetrics::unregistered());
        lifecycle.set_metrics(metrics);

        let handle = lifecycle.spawn_store_health_checker(Arc::new(MemoryStore::default()));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(lifecycle.readiness_checks().store_reachable);

        lifecycle.begin_shutdown();
        handle.await.unwrap();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Starting.to_string(), "starting");
        assert_eq!(LifecycleState::ShuttingDown.to_string(), "shutting_down");
    }

    fn clear_env_validation_vars() {
        unsafe {
            std::env::remove_var("GATEBRIDGE_ENVIRONMENT");
        }
    }

    #[test]
    #[serial]
    fn test_validate_env_production_rejects_mock_chat() {
        clear_env_validation_vars();
        let err = validate_environment(true).unwrap_err();
        assert!(err.contains("--chat mock"));
    }

    #[test]
    #[serial]
    fn test_validate_env_development_allows_mock_chat() {
        clear_env_validation_vars();
        unsafe { std::env::set_var("GATEBRIDGE_ENVIRONMENT", "development") };
        assert!(validate_environment(true).is_ok());
        clear_env_validation_vars();
    }

    #[test]
    #[serial]
    fn test_validate_env_production_without_mock_passes() {
        clear_env_validation_vars();
        assert!(validate_environment(false).is_ok());
    }
}
