//! Gate decision state machine.
//!
//! `PENDING → APPROVED | REJECTED`, both terminal. A decision runs as:
//!
//! 1. load the record (`NotFound`)
//! 2. check the actor's role against the route (`RbacDenied`)
//! 3. refuse terminal records (`AlreadyDecided`)
//! 4. require a non-blank reason for rejections (`Validation`)
//! 5. compare-and-set `PENDING → decided`; a lost race is `AlreadyDecided`
//! 6. publish `GATE_APPROVED` / `GATE_REJECTED` (`PublishFailed`)
//! 7. rewrite the notification without its buttons (best-effort)
//!
//! Steps 1–5 never mutate anything on failure.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chat::{AdapterError, ChatAdapter, MessageContext, MessageRef, blocks};
use crate::events::{DecisionEvent, EventPublisher};
use crate::gate::{DecisionKind, GateError, GateStatus, GateStatusRecord};
use crate::metrics::BridgeMetrics;
use crate::rbac::RbacValidator;
use crate::routing::ChannelConfig;
use crate::store::{CasOutcome, DedupStore, GateStore};

// ============================================================================
// Rejection Form
// ============================================================================

/// Contents of a submitted rejection form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionForm {
    /// Correlation token carried by the form
    pub request_id: String,
    /// Text entered by the reviewer, if any
    pub reason: Option<String>,
}

impl RejectionForm {
    /// Reads the reason out of flattened form values.
    #[must_use]
    pub fn from_values(request_id: impl Into<String>, values: &HashMap<String, String>) -> Self {
        Self {
            request_id: request_id.into(),
            reason: values.get(blocks::REASON_INPUT).cloned(),
        }
    }
}

/// Outcome of a rejection form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormResult {
    pub success: bool,
    pub error: Option<GateError>,
}

impl FormResult {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: GateError) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

fn non_blank(reason: Option<&str>) -> Option<String> {
    reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

// ============================================================================
// Decision Machine
// ============================================================================

/// Applies reviewer decisions to gate records.
pub struct GateDecisionMachine {
    store: Arc<dyn GateStore>,
    dedup: Arc<dyn DedupStore>,
    rbac: Arc<RbacValidator>,
    publisher: Arc<dyn EventPublisher>,
    chat: Arc<dyn ChatAdapter>,
    metrics: Arc<BridgeMetrics>,
}

impl GateDecisionMachine {
    /// Wires the machine to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn GateStore>,
        dedup: Arc<dyn DedupStore>,
        rbac: Arc<RbacValidator>,
        publisher: Arc<dyn EventPublisher>,
        chat: Arc<dyn ChatAdapter>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            store,
            dedup,
            rbac,
            publisher,
            chat,
            metrics,
        }
    }

    /// Decides a gate without access to the original message layout.
    ///
    /// # Errors
    ///
    /// See [`decide_with_context`](Self::decide_with_context).
    pub async fn decide(
        &self,
        request_id: &str,
        actor: &str,
        kind: DecisionKind,
        channel: &ChannelConfig,
        reason: Option<&str>,
    ) -> Result<GateStatusRecord, GateError> {
        self.decide_with_context(request_id, actor, kind, channel, reason, None)
            .await
    }

    /// Decides a gate. When `original` is given, the rewrite keeps its layout
    /// and only swaps the buttons for the outcome line.
    ///
    /// Returns the decided record.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `RbacDenied`, `AlreadyDecided`, `Validation`: nothing changed
    /// - `Unavailable`: the store failed before the transition was written
    /// - `PublishFailed`: the transition is durable, the event is missing
    pub async fn decide_with_context(
        &self,
        request_id: &str,
        actor: &str,
        kind: DecisionKind,
        channel: &ChannelConfig,
        reason: Option<&str>,
        original: Option<&MessageContext>,
    ) -> Result<GateStatusRecord, GateError> {
        let result = self
            .transition(request_id, actor, kind, channel, reason, original)
            .await;
        let (gate_type, outcome) = match &result {
            Ok(record) => (
                record.gate_type.clone(),
                record.status.as_str().to_lowercase(),
            ),
            Err(e) => (
                self.gate_type_hint(request_id).await,
                e.kind().as_str().to_string(),
            ),
        };
        self.metrics.record_decision(&gate_type, &outcome);
        result
    }

    async fn transition(
        &self,
        request_id: &str,
        actor: &str,
        kind: DecisionKind,
        channel: &ChannelConfig,
        reason: Option<&str>,
        original: Option<&MessageContext>,
    ) -> Result<GateStatusRecord, GateError> {
        let record = self
            .store
            .get(request_id)
            .await?
            .ok_or_else(|| GateError::NotFound {
                request_id: request_id.to_string(),
            })?;

        self.rbac.require(actor, &record.gate_type, channel)?;

        if record.status != GateStatus::Pending {
            return Err(GateError::AlreadyDecided {
                request_id: request_id.to_string(),
                status: record.status,
            });
        }

        let reason = non_blank(reason);
        if kind == DecisionKind::Reject && reason.is_none() {
            return Err(GateError::reason_required());
        }

        let updated = record
            .decided(kind, actor, reason, Utc::now())
            .ok_or_else(|| GateError::AlreadyDecided {
                request_id: request_id.to_string(),
                status: record.status,
            })?;

        match self
            .store
            .compare_and_set(GateStatus::Pending, &updated)
            .await?
        {
            CasOutcome::Applied => {}
            CasOutcome::Conflict { current } => {
                debug!(request_id = %request_id, actor = %actor, "Lost decision race");
                return Err(GateError::AlreadyDecided {
                    request_id: request_id.to_string(),
                    status: current.status,
                });
            }
            CasOutcome::Missing => {
                return Err(GateError::NotFound {
                    request_id: request_id.to_string(),
                });
            }
        }

        info!(
            request_id = %request_id,
            gate_type = %updated.gate_type,
            actor = %actor,
            status = %updated.status,
            "Gate decided"
        );

        let published = self.publish(&updated).await;
        self.rewrite(&updated, original).await;
        published.map(|()| updated)
    }

    async fn publish(&self, record: &GateStatusRecord) -> Result<(), GateError> {
        let Some(event) = DecisionEvent::from_record(record) else {
            return Ok(());
        };
        match self.publisher.publish(&event).await {
            Ok(id) => {
                debug!(request_id = %record.request_id, event_id = %id, event_type = event.event_type(), "Published decision");
                Ok(())
            }
            Err(e) => {
                warn!(
                    request_id = %record.request_id,
                    error = %e,
                    "Decision recorded but event publish failed"
                );
                Err(GateError::PublishFailed {
                    request_id: record.request_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Best-effort: failures are logged and swallowed.
    async fn rewrite(&self, record: &GateStatusRecord, original: Option<&MessageContext>) {
        let (message, layout): (MessageRef, serde_json::Value) = match original {
            Some(ctx) => (
                ctx.message.clone(),
                blocks::resolved_blocks(&ctx.blocks, record),
            ),
            None => match self.dedup.posted_message(&record.request_id).await {
                Ok(Some(message)) => (message, blocks::compact_resolved(record)),
                Ok(None) => {
                    debug!(request_id = %record.request_id, "No posted message to rewrite");
                    return;
                }
                Err(e) => {
                    warn!(request_id = %record.request_id, error = %e, "Could not look up posted message");
                    return;
                }
            },
        };

        if let Err(e) = self
            .chat
            .update(&message, &blocks::resolved_text(record), &layout)
            .await
        {
            warn!(
                request_id = %record.request_id,
                channel = %message.channel,
                error = %e,
                "Failed to rewrite gate notification"
            );
        }
    }

    async fn gate_type_hint(&self, request_id: &str) -> String {
        match self.store.get(request_id).await {
            Ok(Some(record)) => record.gate_type,
            _ => "unknown".to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // Two-phase rejection
    // ------------------------------------------------------------------------

    /// Opens the rejection form; the form carries `request_id` as its
    /// correlation token.
    ///
    /// # Errors
    ///
    /// `Validation` if the trigger expired, `Unavailable` for other chat
    /// failures.
    pub async fn open_rejection_form(
        &self,
        trigger_id: &str,
        request_id: &str,
    ) -> Result<(), GateError> {
        self.chat
            .open_form(trigger_id, &blocks::rejection_form(request_id))
            .await
            .map_err(|e| match e {
                AdapterError::TriggerExpired => GateError::Validation {
                    message: "This action expired. Click Reject again.".to_string(),
                },
                other => GateError::Unavailable {
                    reason: other.to_string(),
                },
            })
    }

    /// Completes a rejection from its form.
    ///
    /// A missing or blank reason fails with `reason is required` and changes
    /// nothing.
    pub async fn submit_rejection(
        &self,
        form: &RejectionForm,
        actor: &str,
        channel: &ChannelConfig,
    ) -> FormResult {
        let Some(reason) = non_blank(form.reason.as_deref()) else {
            return FormResult::failed(GateError::reason_required());
        };
        match self
            .decide(
                &form.request_id,
                actor,
                DecisionKind::Reject,
                channel,
                Some(&reason),
            )
            .await
        {
            Ok(_) => FormResult::ok(),
            Err(e) => FormResult::failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::RecordingChatAdapter;
    use crate::events::{GATE_APPROVED, GATE_REJECTED, InMemoryEventLog, LogError};
    use crate::gate::GateRequest;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct Harness {
        machine: GateDecisionMachine,
        store: Arc<MemoryStore>,
        log: Arc<InMemoryEventLog>,
        chat: Arc<RecordingChatAdapter>,
    }

    fn rbac() -> Arc<RbacValidator> {
        Arc::new(RbacValidator::new(HashMap::from([
            (
                "U-REVIEWER".to_string(),
                BTreeSet::from(["reviewer".to_string()]),
            ),
            ("U-DEV".to_string(), BTreeSet::from(["developer".to_string()])),
        ])))
    }

    fn route() -> ChannelConfig {
        ChannelConfig::new("C-CODE", "reviewer")
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let log = InMemoryEventLog::new(Duration::from_secs(30));
        let chat = Arc::new(RecordingChatAdapter::new());
        store
            .insert_pending(&GateStatusRecord::pending(&GateRequest {
                request_id: "req-789".into(),
                gate_type: "hitl_4_code".into(),
                task_id: "task-1".into(),
                session_id: "sess-1".into(),
                summary: "Review".into(),
                requester: "agent".into(),
                environment: None,
            }))
            .await
            .unwrap();
        store
            .mark_posted(
                "req-789",
                &MessageRef {
                    channel: "C-CODE".into(),
                    ts: "1.1".into(),
                },
            )
            .await
            .unwrap();
        let machine = GateDecisionMachine::new(
            store.clone(),
            store.clone(),
            rbac(),
            log.clone(),
            chat.clone(),
            Arc::new(BridgeMetrics::unregistered()),
        );
        Harness {
            machine,
            store,
            log,
            chat,
        }
    }

    #[tokio::test]
    async fn test_approve_transitions_publishes_and_rewrites() {
        let h = harness().await;
        let record = h
            .machine
            .decide("req-789", "U-REVIEWER", DecisionKind::Approve, &route(), None)
            .await
            .unwrap();
        assert_eq!(record.status, GateStatus::Approved);
        assert_eq!(record.decided_by.as_deref(), Some("U-REVIEWER"));

        let events = h.log.entries_of_type(GATE_APPROVED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["request_id"], "req-789");
        assert_eq!(events[0]["reviewer"], "U-REVIEWER");

        let updates = h.chat.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.ts, "1.1");
        assert!(updates[0].1.to_string().contains("Approved"));
    }

    #[tokio::test]
    async fn test_rbac_denied_changes_nothing() {
        let h = harness().await;
        let err = h
            .machine
            .decide("req-789", "U-DEV", DecisionKind::Approve, &route(), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GateError::RbacDenied {
                actor: "U-DEV".into(),
                role: "reviewer".into()
            }
        );
        let record = h.store.get("req-789").await.unwrap().unwrap();
        assert_eq!(record.status, GateStatus::Pending);
        assert!(h.log.entries_of_type(GATE_APPROVED).is_empty());
        assert!(h.chat.updates().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_and_already_decided() {
        let h = harness().await;
        let err = h
            .machine
            .decide("req-missing", "U-REVIEWER", DecisionKind::Approve, &route(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NotFound { .. }));

        h.machine
            .decide("req-789", "U-REVIEWER", DecisionKind::Approve, &route(), None)
            .await
            .unwrap();
        let err = h
            .machine
            .decide(
                "req-789",
                "U-REVIEWER",
                DecisionKind::Reject,
                &route(),
                Some("too late"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GateError::AlreadyDecided {
                request_id: "req-789".into(),
                status: GateStatus::Approved
            }
        );
        assert!(h.log.entries_of_type(GATE_REJECTED).is_empty());
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let h = harness().await;
        for reason in [None, Some(""), Some("   ")] {
            let err = h
                .machine
                .decide("req-789", "U-REVIEWER", DecisionKind::Reject, &route(), reason)
                .await
                .unwrap_err();
            assert_eq!(err, GateError::reason_required());
        }
        let record = h.store.get("req-789").await.unwrap().unwrap();
        assert_eq!(record.status, GateStatus::Pending);
    }

    #[tokio::test]
    async fn test_submit_rejection_paths() {
        let h = harness().await;
        let blank = RejectionForm {
            request_id: "req-789".into(),
            reason: Some("  ".into()),
        };
        let result = h.machine.submit_rejection(&blank, "U-REVIEWER", &route()).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().to_string(), "reason is required");
        assert!(h.chat.forms().is_empty());

        let form = RejectionForm::from_values(
            "req-789",
            &HashMap::from([(blocks::REASON_INPUT.to_string(), " breaks prod ".to_string())]),
        );
        let result = h.machine.submit_rejection(&form, "U-REVIEWER", &route()).await;
        assert!(result.success, "{result:?}");

        let record = h.store.get("req-789").await.unwrap().unwrap();
        assert_eq!(record.status, GateStatus::Rejected);
        assert_eq!(record.reason.as_deref(), Some("breaks prod"));

        let events = h.log.entries_of_type(GATE_REJECTED);
        assert_eq!(events[0]["rejected_by"], "U-REVIEWER");
        assert_eq!(events[0]["reason"], "breaks prod");
    }

    #[tokio::test]
    async fn test_open_rejection_form_carries_request_id() {
        let h = harness().await;
        h.machine
            .open_rejection_form("trig-1", "req-789")
            .await
            .unwrap();
        let forms = h.chat.forms();
        assert_eq!(forms[0].0, "trig-1");
        assert_eq!(forms[0].1["private_metadata"], "req-789");
    }

    #[tokio::test]
    async fn test_concurrent_decisions_single_winner() {
        let h = Arc::new(harness().await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                let kind = if i % 2 == 0 {
                    DecisionKind::Approve
                } else {
                    DecisionKind::Reject
                };
                h.machine
                    .decide("req-789", "U-REVIEWER", kind, &route(), Some("race"))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, GateError::AlreadyDecided { .. }), "{e:?}"),
            }
        }
        assert_eq!(wins, 1);
        let published =
            h.log.entries_of_type(GATE_APPROVED).len() + h.log.entries_of_type(GATE_REJECTED).len();
        assert_eq!(published, 1);
    }

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _event: &DecisionEvent) -> Result<String, LogError> {
            Err(LogError::Unavailable {
                reason: "stream down".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_transition_and_rewrites() {
        let h = harness().await;
        let machine = GateDecisionMachine::new(
            h.store.clone(),
            h.store.clone(),
            rbac(),
            Arc::new(FailingPublisher),
            h.chat.clone(),
            Arc::new(BridgeMetrics::unregistered()),
        );

        let err = machine
            .decide("req-789", "U-REVIEWER", DecisionKind::Approve, &route(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::PublishFailed { .. }));
        let record = h.store.get("req-789").await.unwrap().unwrap();
        assert_eq!(record.status, GateStatus::Approved);
        assert_eq!(h.chat.updates().len(), 1);
    }
}
