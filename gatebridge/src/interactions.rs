//! Slack interaction endpoint.
//!
//! Slack posts every button click and modal submission to a single URL as
//! `application/x-www-form-urlencoded` with one `payload` field holding the
//! interaction JSON. The reply must arrive within Slack's three second window:
//!
//! - empty `200` acknowledges (and closes a submitted modal)
//! - `{"response_action":"errors",...}` keeps the modal open with inline errors

use axum::{
    Form, Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gatebridge_core::chat::slack::parse_interaction;
use gatebridge_core::interaction::{InteractionDispatcher, InteractionReply};
use gatebridge_core::lifecycle::LifecycleManager;

use crate::signature::{SlackVerifier, verify_slack_signature};

pub const INTERACTIONS_PATH: &str = "/slack/interactions";

#[derive(Debug, Deserialize)]
struct InteractionForm {
    payload: String,
}

#[derive(Clone)]
struct InteractionState {
    dispatcher: Arc<InteractionDispatcher>,
    lifecycle: Arc<LifecycleManager>,
}

/// HTTP front for the interaction dispatcher.
pub struct InteractionServer {
    port: u16,
    bind_addr: String,
    state: InteractionState,
    verifier: Option<SlackVerifier>,
}

impl InteractionServer {
    /// Creates a server bound to `0.0.0.0:{port}`.
    ///
    /// Without a `verifier` requests are accepted unsigned.
    pub fn new(
        dispatcher: Arc<InteractionDispatcher>,
        lifecycle: Arc<LifecycleManager>,
        verifier: Option<SlackVerifier>,
        port: u16,
    ) -> Self {
        Self {
            port,
            bind_addr: "0.0.0.0".to_string(),
            state: InteractionState {
                dispatcher,
                lifecycle,
            },
            verifier,
        }
    }

    pub fn router(&self) -> Router {
        let router = Router::new()
            .route(INTERACTIONS_PATH, post(handle_interaction))
            .with_state(self.state.clone());

        match &self.verifier {
            Some(verifier) => router.layer(middleware::from_fn_with_state(
                verifier.clone(),
                verify_slack_signature,
            )),
            None => router,
        }
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or serve.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind = format!("{}:{}", self.bind_addr, self.port);
        let listener = TcpListener::bind(&bind).await?;

        info!(
            addr = %bind,
            signed = self.verifier.is_some(),
            "Interaction endpoint listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Interaction endpoint shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn handle_interaction(
    State(state): State<InteractionState>,
    Form(form): Form<InteractionForm>,
) -> Response {
    let Some(_guard) = state.lifecycle.track_request() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let interaction = match parse_interaction(&form.payload) {
        Ok(interaction) => interaction,
        Err(e) => {
            warn!(error = %e, "Unparseable interaction payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match state.dispatcher.dispatch(interaction).await {
        InteractionReply::Ack => StatusCode::OK.into_response(),
        InteractionReply::FormErrors(errors) => {
            debug!(fields = errors.len(), "Returning inline form errors");
            Json(serde_json::json!({
                "response_action": "errors",
                "errors": errors,
            }))
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use gatebridge_core::chat::RecordingChatAdapter;
    use gatebridge_core::decision::GateDecisionMachine;
    use gatebridge_core::events::InMemoryEventLog;
    use gatebridge_core::lifecycle::LifecycleConfig;
    use gatebridge_core::metrics::BridgeMetrics;
    use gatebridge_core::rbac::RbacValidator;
    use gatebridge_core::gate::{GateRequest, GateStatusRecord};
    use gatebridge_core::routing::{ChannelConfig, RoutingPolicy, RoutingTable};
    use gatebridge_core::store::{GateStore, MemoryStore};
    use std::collections::{BTreeSet, HashMap};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};

    async fn server(verifier: Option<SlackVerifier>) -> (InteractionServer, Arc<LifecycleManager>) {
        let store = Arc::new(MemoryStore::default());
        store
            .insert_pending(&GateStatusRecord::pending(&GateRequest {
                request_id: "req-1".into(),
                gate_type: "hitl_4_code".into(),
                task_id: "task-1".into(),
                session_id: "sess-1".into(),
                summary: "Review".into(),
                requester: "agent".into(),
                environment: None,
            }))
            .await
            .unwrap();
        let chat = Arc::new(RecordingChatAdapter::new());
        let rbac = Arc::new(RbacValidator::new(HashMap::from([(
            "U-1".to_string(),
            BTreeSet::from(["reviewer".to_string()]),
        )])));
        let mut table = RoutingTable::default();
        table
            .defaults
            .insert("hitl_4_code".into(), ChannelConfig::new("C-CODE", "reviewer"));
        let routing = Arc::new(RoutingPolicy::new(table));
        let machine = Arc::new(GateDecisionMachine::new(
            store.clone(),
            store.clone(),
            rbac.clone(),
            InMemoryEventLog::new(Duration::from_secs(30)),
            chat.clone(),
            Arc::new(BridgeMetrics::unregistered()),
        ));
        let dispatcher = Arc::new(InteractionDispatcher::new(
            machine, store, routing, rbac, chat,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::default()));
        (
            InteractionServer::new(dispatcher, lifecycle.clone(), verifier, 0),
            lifecycle,
        )
    }

    fn form_body(payload: &serde_json::Value) -> String {
        let encoded: String = payload
            .to_string()
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                _ => format!("%{b:02X}"),
            })
            .collect();
        format!("payload={encoded}")
    }

    fn request(body: String, extra: &[(&str, String)]) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(INTERACTIONS_PATH)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        for (name, value) in extra {
            builder = builder.header(*name, value);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn unknown_action() -> serde_json::Value {
        serde_json::json!({
            "type": "block_actions",
            "user": {"id": "U-1"},
            "trigger_id": "t-1",
            "actions": [{"action_id": "something_else", "value": "req-1"}]
        })
    }

    #[tokio::test]
    async fn test_unknown_action_is_acknowledged() {
        let (server, _) = server(None).await;
        let response = server
            .router()
            .oneshot(request(form_body(&unknown_action()), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_blank_rejection_reason_returns_inline_errors() {
        let (server, _) = server(None).await;
        let submission = serde_json::json!({
            "type": "view_submission",
            "user": {"id": "U-1"},
            "view": {
                "callback_id": "gate_reject_form",
                "private_metadata": "req-1",
                "state": {"values": {
                    "reason_block": {"reason_input": {"type": "plain_text_input", "value": "   "}}
                }}
            }
        });
        let response = server
            .router()
            .oneshot(request(form_body(&submission), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["response_action"], "errors");
        assert!(json["errors"]["reason_block"].is_string());
    }

    #[tokio::test]
    async fn test_garbage_payload_is_bad_request() {
        let (server, _) = server(None).await;
        let response = server
            .router()
            .oneshot(request("payload=not-json".to_string(), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_shutting_down_refuses_requests() {
        let (server, lifecycle) = server(None).await;
        lifecycle.begin_shutdown();
        let response = server
            .router()
            .oneshot(request(form_body(&unknown_action()), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_signature_required_when_secret_configured() {
        let verifier = SlackVerifier::new("signing-secret");
        let (server, _) = server(Some(verifier.clone())).await;
        let body = form_body(&unknown_action());

        let response = server
            .router()
            .oneshot(request(body.clone(), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let ts = chrono::Utc::now().timestamp().to_string();
        let signature = verifier.signature_header(&ts, body.as_bytes());
        let response = server
            .router()
            .oneshot(request(
                body,
                &[(TIMESTAMP_HEADER, ts), (SIGNATURE_HEADER, signature)],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
