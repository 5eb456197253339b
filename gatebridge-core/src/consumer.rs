//! Event consumer: turns `GATE_REQUESTED` entries into chat notifications.
//!
//! Per entry:
//!
//! | Situation | Post | Ack |
//! |-----------|------|-----|
//! | malformed, or another event type | no | yes |
//! | already posted in the dedup window | no | yes |
//! | another consumer holds the claim | no | no |
//! | no route | no | yes |
//! | post failed transiently | - | no (redelivery retries) |
//! | post rejected permanently | no | yes |
//! | posted and dedup-marked | yes | yes |

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chat::{AdapterError, ChatAdapter, blocks};
use crate::events::{EventLog, InboundEvent, LogEntry, LogError, parse_event};
use crate::gate::{GateRequest, GateStatusRecord};
use crate::metrics::BridgeMetrics;
use crate::routing::RoutingPolicy;
use crate::store::{ClaimOutcome, DedupStore, GateStore, StoreError};

// ============================================================================
// Configuration
// ============================================================================

/// Tuning for one consumer worker.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Entries fetched per read
    pub batch_size: usize,
    /// How long a read waits for new entries
    pub block_timeout: Duration,
    /// How long a dedup claim is held while posting
    pub claim_lease: Duration,
    /// Pause after a loop-level error
    pub error_backoff: Duration,
    /// Base URL for evidence links
    pub evidence_base_url: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_timeout: Duration::from_secs(5),
            claim_lease: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            evidence_base_url: "http://localhost:8080".to_string(),
        }
    }
}

// ============================================================================
// Outcomes and Errors
// ============================================================================

/// How an entry was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Posted,
    Duplicate,
    AlreadyDecided,
    InFlight,
    NoRoute,
    Malformed,
    Ignored,
    /// The chat platform permanently rejected the message.
    Undeliverable,
}

impl HandleOutcome {
    /// Whether the entry should be acknowledged.
    #[must_use]
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Self::InFlight)
    }

    /// Label used in metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Posted => "posted",
            Self::Duplicate => "duplicate",
            Self::AlreadyDecided => "already_decided",
            Self::InFlight => "in_flight",
            Self::NoRoute => "no_route",
            Self::Malformed => "malformed",
            Self::Ignored => "ignored",
            Self::Undeliverable => "undeliverable",
        }
    }
}

/// Transient failures; the entry is left unacknowledged.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chat error: {0}")]
    Chat(#[from] AdapterError),

    #[error("event log error: {0}")]
    Log(#[from] LogError),
}

// ============================================================================
// Event Consumer
// ============================================================================

/// One competing consumer in the bridge's consumer group.
pub struct EventConsumer {
    log: Arc<dyn EventLog>,
    store: Arc<dyn GateStore>,
    dedup: Arc<dyn DedupStore>,
    routing: Arc<RoutingPolicy>,
    chat: Arc<dyn ChatAdapter>,
    metrics: Arc<BridgeMetrics>,
    config: ConsumerConfig,
    /// Dedup claim owner, unique to this consumer instance
    claim_token: String,
}

impl EventConsumer {
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn GateStore>,
        dedup: Arc<dyn DedupStore>,
        routing: Arc<RoutingPolicy>,
        chat: Arc<dyn ChatAdapter>,
        metrics: Arc<BridgeMetrics>,
        config: ConsumerConfig,
    ) -> Self {
        let claim_token = format!("{}:{}", log.consumer_name(), uuid::Uuid::new_v4());
        Self {
            log,
            store,
            dedup,
            routing,
            chat,
            metrics,
            config,
            claim_token,
        }
    }

    /// Consumer name within the group.
    #[must_use]
    pub fn name(&self) -> &str {
        self.log.consumer_name()
    }

    /// Owner recorded on dedup claims. Distinct per instance even when two
    /// processes share a consumer name.
    #[must_use]
    pub fn claim_token(&self) -> &str {
        &self.claim_token
    }

    /// Reads and processes entries until `shutdown` fires.
    ///
    /// The entry being processed when shutdown fires is finished; the rest
    /// of its batch stays unacknowledged and is redelivered.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(consumer = %self.name(), "Event consumer starting");

        while let Err(e) = self.log.ensure_group().await {
            error!(consumer = %self.name(), error = %e, "Failed to create consumer group");
            self.metrics.record_consumer_error();
            if self.pause(&shutdown).await {
                return;
            }
        }

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                batch = self.log.read(self.config.batch_size, self.config.block_timeout) => batch,
            };

            let entries = match batch {
                Ok(entries) => entries,
                Err(e) => {
                    error!(consumer = %self.name(), error = %e, "Event log read failed");
                    self.metrics.record_consumer_error();
                    if self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            for entry in &entries {
                if shutdown.is_cancelled() {
                    break;
                }
                self.process(entry).await;
            }
        }

        info!(consumer = %self.name(), "Event consumer stopped");
    }

    /// Sleeps for the error backoff. Returns true if shutdown fired meanwhile.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.config.error_backoff) => false,
        }
    }

    /// Handles one entry and acknowledges it when appropriate.
    ///
    /// Returns `None` when the entry failed and was left for redelivery.
    pub async fn process(&self, entry: &LogEntry) -> Option<HandleOutcome> {
        match self.handle(entry).await {
            Ok(outcome) => {
                self.metrics.record_notification(outcome.as_str());
                if outcome.acknowledges()
                    && let Err(e) = self.log.ack(&entry.id).await
                {
                    error!(entry_id = %entry.id, error = %e, "Failed to acknowledge entry");
                    self.metrics.record_consumer_error();
                }
                Some(outcome)
            }
            Err(e) => {
                self.metrics.record_notification("failed");
                warn!(
                    entry_id = %entry.id,
                    error = %e,
                    "Gate notification failed; leaving entry for redelivery"
                );
                None
            }
        }
    }

    /// Decides what to do with one entry. Does not acknowledge.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError` for transient failures that redelivery should
    /// retry.
    pub async fn handle(&self, entry: &LogEntry) -> Result<HandleOutcome, ConsumerError> {
        let request = match parse_event(&entry.fields) {
            Ok(InboundEvent::GateRequested(request)) => request,
            Ok(InboundEvent::Other { event_type }) => {
                debug!(entry_id = %entry.id, event_type = %event_type, "Ignoring event");
                return Ok(HandleOutcome::Ignored);
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Dropping malformed event");
                return Ok(HandleOutcome::Malformed);
            }
        };

        match self
            .dedup
            .claim(&request.request_id, &self.claim_token, self.config.claim_lease)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyPosted => {
                debug!(
                    request_id = %request.request_id,
                    redelivered = entry.redelivered,
                    "Notification already posted"
                );
                return Ok(HandleOutcome::Duplicate);
            }
            ClaimOutcome::HeldElsewhere => {
                debug!(
                    request_id = %request.request_id,
                    redelivered = entry.redelivered,
                    "Another consumer is posting this request"
                );
                return Ok(HandleOutcome::InFlight);
            }
        }

        let result = self.notify(&request).await;
        if !matches!(result, Ok(HandleOutcome::Posted)) {
            self.release(&request.request_id).await;
        }
        result
    }

    async fn notify(&self, request: &GateRequest) -> Result<HandleOutcome, ConsumerError> {
        let Some((route, source)) = self
            .routing
            .resolve_with_source(&request.gate_type, request.environment.as_deref())
        else {
            warn!(
                request_id = %request.request_id,
                gate_type = %request.gate_type,
                environment = ?request.environment,
                "No route for gate type"
            );
            return Ok(HandleOutcome::NoRoute);
        };

        let record = GateStatusRecord::pending(request);
        if !self.store.insert_pending(&record).await?
            && let Some(existing) = self.store.get(&request.request_id).await?
            && existing.status.is_terminal()
        {
            info!(
                request_id = %request.request_id,
                status = %existing.status,
                "Gate already decided; not notifying"
            );
            return Ok(HandleOutcome::AlreadyDecided);
        }

        let message = blocks::notification(request, route, &self.config.evidence_base_url);
        let started = Instant::now();
        let posted = match self.chat.post(&message).await {
            Ok(posted) => posted,
            // A bad token fails every post; keep entries until it is fixed.
            Err(e) if e.is_retriable() || matches!(e, AdapterError::InvalidToken) => {
                return Err(e.into());
            }
            Err(e) => {
                error!(
                    request_id = %request.request_id,
                    channel = %route.channel_id,
                    adapter = self.chat.name(),
                    kind = e.kind(),
                    error = %e,
                    "Chat platform rejected gate notification; dropping"
                );
                self.metrics.record_consumer_error();
                return Ok(HandleOutcome::Undeliverable);
            }
        };
        self.metrics
            .record_post_duration(started.elapsed().as_secs_f64() * 1000.0);

        self.dedup.mark_posted(&request.request_id, &posted).await?;

        info!(
            request_id = %request.request_id,
            gate_type = %request.gate_type,
            channel = %posted.channel,
            route = %source,
            adapter = self.chat.name(),
            "Posted gate notification"
        );
        Ok(HandleOutcome::Posted)
    }

    async fn release(&self, request_id: &str) {
        if let Err(e) = self.dedup.release(request_id, &self.claim_token).await {
            warn!(request_id = %request_id, error = %e, "Failed to release dedup claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::RecordingChatAdapter;
    use crate::events::{EventFields, InMemoryEventLog};
    use crate::gate::{DecisionKind, GateStatus};
    use crate::routing::{ChannelConfig, RoutingTable};
    use crate::store::MemoryStore;
    use chrono::Utc;

    struct Harness {
        log: Arc<InMemoryEventLog>,
        store: Arc<MemoryStore>,
        chat: Arc<RecordingChatAdapter>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: InMemoryEventLog::new(Duration::from_secs(30)),
                store: Arc::new(MemoryStore::default()),
                chat: Arc::new(RecordingChatAdapter::new()),
            }
        }

        fn consumer(&self, name: &str) -> EventConsumer {
            let mut table = RoutingTable::default();
            table
                .defaults
                .insert("hitl_4_code".into(), ChannelConfig::new("C-CODE", "reviewer"));
            EventConsumer::new(
                Arc::new(self.log.consumer(name)),
                self.store.clone(),
                self.store.clone(),
                Arc::new(RoutingPolicy::new(table)),
                self.chat.clone(),
                Arc::new(BridgeMetrics::unregistered()),
                ConsumerConfig {
                    evidence_base_url: "https://evidence.example.com".into(),
                    ..ConsumerConfig::default()
                },
            )
        }
    }

    fn gate_event(request_id: &str, gate_type: &str) -> EventFields {
        EventFields::from([
            ("event_type".to_string(), "GATE_REQUESTED".to_string()),
            ("request_id".to_string(), request_id.to_string()),
            ("gate_type".to_string(), gate_type.to_string()),
            ("task_id".to_string(), "task-1".to_string()),
            ("session_id".to_string(), "sess-1".to_string()),
            ("summary".to_string(), "Review auth changes".to_string()),
            ("requested_by".to_string(), "planner".to_string()),
        ])
    }

    fn entry(id: &str, fields: EventFields) -> LogEntry {
        LogEntry {
            id: id.to_string(),
            fields,
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn test_posts_once_and_creates_pending_record() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");

        let outcome = consumer
            .handle(&entry("1-0", gate_event("req-789", "hitl_4_code")))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::Posted);

        let posts = h.chat.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].channel, "C-CODE");
        let rendered = posts[0].blocks.to_string();
        assert!(rendered.contains("req-789"));
        assert!(rendered.contains(blocks::APPROVE_ACTION));
        assert!(rendered.contains(blocks::REJECT_ACTION));

        let record = h.store.get("req-789").await.unwrap().unwrap();
        assert_eq!(record.status, GateStatus::Pending);

        let again = consumer
            .handle(&entry("1-0", gate_event("req-789", "hitl_4_code")))
            .await
            .unwrap();
        assert_eq!(again, HandleOutcome::Duplicate);
        assert_eq!(h.chat.post_count(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_event_releases_claim() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");
        let outcome = consumer
            .handle(&entry("1-0", gate_event("req-1", "hitl_9_unknown")))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::NoRoute);
        assert!(outcome.acknowledges());
        assert_eq!(
            h.store
                .claim("req-1", "other", Duration::from_secs(5))
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_events() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");

        let mut missing = gate_event("req-1", "hitl_4_code");
        missing.remove("gate_type");
        assert_eq!(
            consumer.handle(&entry("1-0", missing)).await.unwrap(),
            HandleOutcome::Malformed
        );

        let foreign = EventFields::from([("event_type".to_string(), "GATE_APPROVED".to_string())]);
        assert_eq!(
            consumer.handle(&entry("2-0", foreign)).await.unwrap(),
            HandleOutcome::Ignored
        );
        assert_eq!(h.chat.post_count(), 0);
    }

    #[tokio::test]
    async fn test_post_failure_is_not_acked_and_retries() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");
        h.chat.fail_next_posts(1);

        let id = h.log.append(gate_event("req-1", "hitl_4_code"));
        let batch = h.log.consumer("c-1").read(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(consumer.process(&batch[0]).await, None);
        assert!(!h.log.is_acked(&id));
        assert_eq!(h.chat.post_count(), 0);
        assert!(h.store.posted_message("req-1").await.unwrap().is_none());

        assert_eq!(consumer.process(&batch[0]).await, Some(HandleOutcome::Posted));
        assert!(h.log.is_acked(&id));
        assert_eq!(h.chat.post_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_held_elsewhere_is_not_acked() {
        let h = Harness::new();
        h.store
            .claim("req-1", "c-2", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = h
            .consumer("c-1")
            .handle(&entry("1-0", gate_event("req-1", "hitl_4_code")))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::InFlight);
        assert!(!outcome.acknowledges());
        assert_eq!(h.chat.post_count(), 0);
    }

    #[tokio::test]
    async fn test_same_named_consumers_do_not_share_a_claim() {
        let h = Harness::new();
        let first = h.consumer("gatebridge-1");
        let second = h.consumer("gatebridge-1");
        assert_ne!(first.claim_token(), second.claim_token());

        h.store
            .claim("req-1", first.claim_token(), Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = second
            .handle(&entry("1-0", gate_event("req-1", "hitl_4_code")))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::InFlight);
        assert_eq!(h.chat.post_count(), 0);
    }

    #[tokio::test]
    async fn test_redelivered_entry_after_post_is_duplicate() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");
        consumer
            .handle(&entry("1-0", gate_event("req-1", "hitl_4_code")))
            .await
            .unwrap();

        let mut redelivery = entry("1-0", gate_event("req-1", "hitl_4_code"));
        redelivery.redelivered = true;
        let outcome = h.consumer("c-2").handle(&redelivery).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Duplicate);
        assert_eq!(h.chat.post_count(), 1);
        assert_eq!(h.chat.name(), "recording");
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_acked_and_released() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");
        h.chat.fail_next_posts_with(
            1,
            AdapterError::Api {
                method: "chat.postMessage".into(),
                code: "invalid_blocks".into(),
            },
        );

        let id = h.log.append(gate_event("req-1", "hitl_4_code"));
        let batch = h.log.consumer("c-1").read(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            consumer.process(&batch[0]).await,
            Some(HandleOutcome::Undeliverable)
        );
        assert!(h.log.is_acked(&id));
        assert_eq!(h.chat.post_count(), 0);
        assert!(h.store.posted_message("req-1").await.unwrap().is_none());
        assert_eq!(
            h.store
                .claim("req-1", "other", Duration::from_secs(5))
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_invalid_token_leaves_entry_for_redelivery() {
        let h = Harness::new();
        let consumer = h.consumer("c-1");
        h.chat.fail_next_posts_with(1, AdapterError::InvalidToken);

        let id = h.log.append(gate_event("req-1", "hitl_4_code"));
        let batch = h.log.consumer("c-1").read(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(consumer.process(&batch[0]).await, None);
        assert!(!h.log.is_acked(&id));
    }

    #[tokio::test]
    async fn test_decided_gate_is_not_renotified() {
        let h = Harness::new();
        let request = match parse_event(&gate_event("req-1", "hitl_4_code")).unwrap() {
            InboundEvent::GateRequested(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        let pending = GateStatusRecord::pending(&request);
        h.store.insert_pending(&pending).await.unwrap();
        let approved = pending
            .decided(DecisionKind::Approve, "U1", None, Utc::now())
            .unwrap();
        h.store
            .compare_and_set(GateStatus::Pending, &approved)
            .await
            .unwrap();

        let outcome = h
            .consumer("c-1")
            .handle(&entry("1-0", gate_event("req-1", "hitl_4_code")))
            .await
            .unwrap();
        assert_eq!(outcome, HandleOutcome::AlreadyDecided);
        assert_eq!(h.chat.post_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new();
        let consumer = Arc::new(h.consumer("c-1"));
        h.log.append(gate_event("req-1", "hitl_4_code"));

        let shutdown = CancellationToken::new();
        let task = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        for _ in 0..100 {
            if h.chat.post_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.chat.post_count(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("consumer should stop")
            .unwrap();
        assert_eq!(h.log.pending_count(), 0);
    }
}
