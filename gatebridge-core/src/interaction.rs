//! Reviewer interactions and their dispatch.
//!
//! | Interaction | Key | Effect |
//! |-------------|-----|--------|
//! | action clicked | `gate_approve` | approve |
//! | action clicked | `gate_reject` | role pre-check, open the rejection form |
//! | form submitted | `gate_reject_form` | reject with the entered reason |
//!
//! Anything else is acknowledged and ignored. Failures are reported to the
//! actor as ephemeral messages, except a blank rejection reason, which is
//! returned inline so the form stays open.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chat::{ChatAdapter, MessageContext, blocks};
use crate::decision::{GateDecisionMachine, RejectionForm};
use crate::gate::{DecisionKind, GateError, GateErrorKind, GateStatus, GateStatusRecord};
use crate::rbac::RbacValidator;
use crate::routing::{ChannelConfig, RoutingPolicy};
use crate::store::GateStore;

// ============================================================================
// Interaction Types
// ============================================================================

/// A button press on a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionClick {
    /// Which control was pressed
    pub action_id: String,
    /// Identity of the reviewer
    pub actor: String,
    /// Value carried by the control (the request id)
    pub correlation_id: String,
    /// Short-lived token for opening a form
    pub trigger_id: Option<String>,
    /// Channel the click happened in
    pub channel: Option<String>,
    /// The message that was clicked, when the surface provides it
    pub message: Option<MessageContext>,
}

/// A submitted form.
#[derive(Debug, Clone, PartialEq)]
pub struct FormSubmission {
    /// Which form was submitted
    pub callback_id: String,
    /// Identity of the reviewer
    pub actor: String,
    /// Opaque token the form was opened with (the request id)
    pub correlation_id: String,
    /// Input values keyed by input id
    pub values: HashMap<String, String>,
}

/// Inbound callback from the chat surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    ActionClicked(ActionClick),
    FormSubmitted(FormSubmission),
    Other { kind: String },
}

/// What the HTTP layer should answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionReply {
    /// Plain acknowledgement (closes a submitted form)
    Ack,
    /// Keep the form open and show these errors (block id → message)
    FormErrors(HashMap<String, String>),
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes interactions to the decision machine.
pub struct InteractionDispatcher {
    machine: Arc<GateDecisionMachine>,
    store: Arc<dyn GateStore>,
    routing: Arc<RoutingPolicy>,
    rbac: Arc<RbacValidator>,
    chat: Arc<dyn ChatAdapter>,
}

impl InteractionDispatcher {
    #[must_use]
    pub fn new(
        machine: Arc<GateDecisionMachine>,
        store: Arc<dyn GateStore>,
        routing: Arc<RoutingPolicy>,
        rbac: Arc<RbacValidator>,
        chat: Arc<dyn ChatAdapter>,
    ) -> Self {
        Self {
            machine,
            store,
            routing,
            rbac,
            chat,
        }
    }

    /// Handles one interaction to completion.
    pub async fn dispatch(&self, interaction: Interaction) -> InteractionReply {
        match interaction {
            Interaction::ActionClicked(click) => {
                match click.action_id.as_str() {
                    blocks::APPROVE_ACTION => self.on_approve(&click).await,
                    blocks::REJECT_ACTION => self.on_reject(&click).await,
                    other => debug!(action_id = %other, "Ignoring unknown action"),
                }
                InteractionReply::Ack
            }
            Interaction::FormSubmitted(form) if form.callback_id == blocks::REJECT_FORM_CALLBACK => {
                self.on_reject_form(&form).await
            }
            Interaction::FormSubmitted(form) => {
                debug!(callback_id = %form.callback_id, "Ignoring unknown form");
                InteractionReply::Ack
            }
            Interaction::Other { kind } => {
                debug!(kind = %kind, "Ignoring interaction");
                InteractionReply::Ack
            }
        }
    }

    /// Loads the record and the route its notification used.
    async fn route_for(
        &self,
        request_id: &str,
    ) -> Result<(GateStatusRecord, ChannelConfig), GateError> {
        let record = self
            .store
            .get(request_id)
            .await?
            .ok_or_else(|| GateError::NotFound {
                request_id: request_id.to_string(),
            })?;
        let route = self
            .routing
            .resolve(&record.gate_type, record.environment.as_deref())
            .cloned()
            .ok_or_else(|| GateError::NoRoute {
                gate_type: record.gate_type.clone(),
            })?;
        Ok((record, route))
    }

    async fn on_approve(&self, click: &ActionClick) {
        let request_id = click.correlation_id.as_str();
        let route = match self.route_for(request_id).await {
            Ok((_, route)) => route,
            Err(e) => return self.tell(click.channel.as_deref(), &click.actor, &e).await,
        };
        match self
            .machine
            .decide_with_context(
                request_id,
                &click.actor,
                DecisionKind::Approve,
                &route,
                None,
                click.message.as_ref(),
            )
            .await
        {
            Ok(_) => info!(request_id = %request_id, actor = %click.actor, "Approval applied"),
            Err(e) => {
                let channel = click.channel.as_deref().unwrap_or(&route.channel_id);
                self.tell(Some(channel), &click.actor, &e).await;
            }
        }
    }

    async fn on_reject(&self, click: &ActionClick) {
        if let Err(e) = self.open_reject_form(click).await {
            self.tell(click.channel.as_deref(), &click.actor, &e).await;
        }
    }

    /// Role and status checks run before the form opens.
    async fn open_reject_form(&self, click: &ActionClick) -> Result<(), GateError> {
        let request_id = click.correlation_id.as_str();
        let (record, route) = self.route_for(request_id).await?;
        self.rbac.require(&click.actor, &record.gate_type, &route)?;
        if record.status != GateStatus::Pending {
            return Err(GateError::AlreadyDecided {
                request_id: request_id.to_string(),
                status: record.status,
            });
        }
        let trigger_id = click
            .trigger_id
            .as_deref()
            .ok_or_else(|| GateError::Validation {
                message: "This action cannot open a form.".to_string(),
            })?;
        self.machine
            .open_rejection_form(trigger_id, request_id)
            .await
    }

    async fn on_reject_form(&self, form: &FormSubmission) -> InteractionReply {
        let request_id = form.correlation_id.as_str();
        let route = match self.route_for(request_id).await {
            Ok((_, route)) => route,
            Err(e) => {
                self.tell(None, &form.actor, &e).await;
                return InteractionReply::Ack;
            }
        };

        let rejection = RejectionForm::from_values(request_id, &form.values);
        let result = self
            .machine
            .submit_rejection(&rejection, &form.actor, &route)
            .await;
        match result.error {
            None => InteractionReply::Ack,
            Some(e) if e.kind() == GateErrorKind::Validation => {
                InteractionReply::FormErrors(HashMap::from([(
                    blocks::REASON_BLOCK.to_string(),
                    e.user_message(),
                )]))
            }
            Some(e) => {
                self.tell(Some(&route.channel_id), &form.actor, &e).await;
                InteractionReply::Ack
            }
        }
    }

    /// Sends the error to the actor only.
    async fn tell(&self, channel: Option<&str>, actor: &str, error: &GateError) {
        info!(actor = %actor, error = %error, kind = error.kind().as_str(), "Decision refused");
        let Some(channel) = channel else {
            warn!(actor = %actor, "No channel to report the error in");
            return;
        };
        if let Err(e) = self
            .chat
            .post_ephemeral(channel, actor, &error.user_message())
            .await
        {
            warn!(
                actor = %actor,
                channel = %channel,
                kind = e.kind(),
                error = %e,
                "Failed to deliver decision error to user"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{MessageRef, RecordingChatAdapter};
    use crate::events::InMemoryEventLog;
    use crate::gate::GateRequest;
    use crate::metrics::BridgeMetrics;
    use crate::routing::RoutingTable;
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct Harness {
        dispatcher: InteractionDispatcher,
        store: Arc<MemoryStore>,
        chat: Arc<RecordingChatAdapter>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let chat = Arc::new(RecordingChatAdapter::new());
        let log = InMemoryEventLog::new(Duration::from_secs(30));
        let rbac = Arc::new(RbacValidator::new(HashMap::from([
            (
                "U-REVIEWER".to_string(),
                BTreeSet::from(["reviewer".to_string()]),
            ),
            ("U-DEV".to_string(), BTreeSet::from(["developer".to_string()])),
        ])));
        let mut table = RoutingTable::default();
        table
            .defaults
            .insert("hitl_4_code".into(), ChannelConfig::new("C-CODE", "reviewer"));
        let routing = Arc::new(RoutingPolicy::new(table));

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

        let machine = Arc::new(GateDecisionMachine::new(
            store.clone(),
            store.clone(),
            rbac.clone(),
            log,
            chat.clone(),
            Arc::new(BridgeMetrics::unregistered()),
        ));
        let dispatcher =
            InteractionDispatcher::new(machine, store.clone(), routing, rbac, chat.clone());
        Harness {
            dispatcher,
            store,
            chat,
        }
    }

    fn click(action_id: &str, actor: &str) -> Interaction {
        Interaction::ActionClicked(ActionClick {
            action_id: action_id.to_string(),
            actor: actor.to_string(),
            correlation_id: "req-789".to_string(),
            trigger_id: Some("trig-1".to_string()),
            channel: Some("C-CODE".to_string()),
            message: Some(MessageContext {
                message: MessageRef {
                    channel: "C-CODE".into(),
                    ts: "1.1".into(),
                },
                blocks: serde_json::json!([{"type": "section"}, {"type": "actions"}]),
            }),
        })
    }

    fn submit(actor: &str, reason: &str) -> Interaction {
        Interaction::FormSubmitted(FormSubmission {
            callback_id: blocks::REJECT_FORM_CALLBACK.to_string(),
            actor: actor.to_string(),
            correlation_id: "req-789".to_string(),
            values: HashMap::from([(blocks::REASON_INPUT.to_string(), reason.to_string())]),
        })
    }

    async fn status(h: &Harness) -> GateStatus {
        h.store.get("req-789").await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_approve_click_rewrites_clicked_message() {
        let h = harness().await;
        let reply = h.dispatcher.dispatch(click(blocks::APPROVE_ACTION, "U-REVIEWER")).await;
        assert_eq!(reply, InteractionReply::Ack);
        assert_eq!(status(&h).await, GateStatus::Approved);

        let updates = h.chat.updates();
        assert_eq!(updates.len(), 1);
        let rendered = updates[0].1.to_string();
        assert!(!rendered.contains("\"actions\""));
        assert!(rendered.contains("U-REVIEWER"));
    }

    #[tokio::test]
    async fn test_denied_click_gets_ephemeral() {
        let h = harness().await;
        h.dispatcher.dispatch(click(blocks::APPROVE_ACTION, "U-DEV")).await;
        assert_eq!(status(&h).await, GateStatus::Pending);

        let ephemerals = h.chat.ephemerals();
        assert_eq!(ephemerals.len(), 1);
        assert_eq!(ephemerals[0].0, "U-DEV");
        assert!(ephemerals[0].1.contains("reviewer"));
    }

    #[tokio::test]
    async fn test_undeliverable_ephemeral_still_acks() {
        let h = harness().await;
        h.chat.fail_ephemerals();
        let reply = h.dispatcher.dispatch(click(blocks::APPROVE_ACTION, "U-DEV")).await;
        assert_eq!(reply, InteractionReply::Ack);
        assert!(h.chat.ephemerals().is_empty());
        assert_eq!(status(&h).await, GateStatus::Pending);
    }

    #[tokio::test]
    async fn test_reject_click_checks_role_before_opening_form() {
        let h = harness().await;
        h.dispatcher.dispatch(click(blocks::REJECT_ACTION, "U-DEV")).await;
        assert!(h.chat.forms().is_empty());
        assert_eq!(h.chat.ephemerals().len(), 1);

        h.dispatcher.dispatch(click(blocks::REJECT_ACTION, "U-REVIEWER")).await;
        let forms = h.chat.forms();
        assert_eq!(forms.len(), 1);
        assert_eq!(forms[0].1["private_metadata"], "req-789");
        assert_eq!(status(&h).await, GateStatus::Pending);
    }

    #[tokio::test]
    async fn test_blank_reason_is_inline_form_error() {
        let h = harness().await;
        let reply = h.dispatcher.dispatch(submit("U-REVIEWER", "   ")).await;
        assert_eq!(
            reply,
            InteractionReply::FormErrors(HashMap::from([(
                blocks::REASON_BLOCK.to_string(),
                "reason is required".to_string()
            )]))
        );
        assert_eq!(status(&h).await, GateStatus::Pending);
        assert!(h.chat.ephemerals().is_empty());
    }

    #[tokio::test]
    async fn test_form_submission_rejects() {
        let h = harness().await;
        let reply = h.dispatcher.dispatch(submit("U-REVIEWER", "unsafe migration")).await;
        assert_eq!(reply, InteractionReply::Ack);
        let record = h.store.get("req-789").await.unwrap().unwrap();
        assert_eq!(record.status, GateStatus::Rejected);
        assert_eq!(record.reason.as_deref(), Some("unsafe migration"));
    }

    #[tokio::test]
    async fn test_second_decision_reports_already_decided() {
        let h = harness().await;
        h.dispatcher.dispatch(click(blocks::APPROVE_ACTION, "U-REVIEWER")).await;
        let reply = h.dispatcher.dispatch(submit("U-REVIEWER", "too late")).await;
        assert_eq!(reply, InteractionReply::Ack);
        assert_eq!(status(&h).await, GateStatus::Approved);
        let ephemerals = h.chat.ephemerals();
        assert_eq!(ephemerals.len(), 1);
        assert!(ephemerals[0].1.contains("already decided"));
    }

    #[tokio::test]
    async fn test_unknown_interactions_are_acked() {
        let h = harness().await;
        assert_eq!(
            h.dispatcher.dispatch(click("something_else", "U-REVIEWER")).await,
            InteractionReply::Ack
        );
        assert_eq!(
            h.dispatcher
                .dispatch(Interaction::Other {
                    kind: "shortcut".into()
                })
                .await,
            InteractionReply::Ack
        );
        assert!(h.chat.calls().is_empty());
    }
}
