//! Block Kit payloads for gate notifications and the rejection form.

use serde_json::{Value, json};
use std::collections::BTreeSet;

use super::OutboundMessage;
use crate::gate::{GateRequest, GateStatus, GateStatusRecord};
use crate::routing::ChannelConfig;

/// Action id of the approve button.
pub const APPROVE_ACTION: &str = "gate_approve";
/// Action id of the reject button.
pub const REJECT_ACTION: &str = "gate_reject";
/// Callback id of the rejection form.
pub const REJECT_FORM_CALLBACK: &str = "gate_reject_form";
/// Block id holding the reason input.
pub const REASON_BLOCK: &str = "reason_block";
/// Action id of the reason input.
pub const REASON_INPUT: &str = "reason_input";
/// Block id of the approve/reject buttons.
pub const ACTIONS_BLOCK: &str = "gate_actions";

const MENTION_GROUP_PREFIX: &str = "subteam:";

/// Slack rejects `plain_text` header text longer than this.
pub const MAX_HEADER_CHARS: usize = 150;
/// Slack rejects section text longer than this.
pub const MAX_SECTION_CHARS: usize = 3000;

/// Cuts `text` to at most `max_chars` characters, ending with `…` when cut.
#[must_use]
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars.saturating_sub(1)) {
        Some((cut, _)) if text[cut..].chars().nth(1).is_some() => {
            format!("{}…", &text[..cut])
        }
        _ => text.to_string(),
    }
}

/// `{base}/gates/{request_id}/evidence`
#[must_use]
pub fn evidence_url(base: &str, request_id: &str) -> String {
    format!("{}/gates/{request_id}/evidence", base.trim_end_matches('/'))
}

/// Renders mention targets as Slack mention markup.
///
/// `subteam:S123` becomes a user-group mention, anything else a user mention.
#[must_use]
pub fn mention_line(targets: &BTreeSet<String>) -> Option<String> {
    if targets.is_empty() {
        return None;
    }
    let mentions: Vec<String> = targets
        .iter()
        .map(|target| match target.strip_prefix(MENTION_GROUP_PREFIX) {
            Some(group) => format!("<!subteam^{group}>"),
            None => format!("<@{target}>"),
        })
        .collect();
    Some(mentions.join(" "))
}

/// Builds the notification for a gate request.
#[must_use]
pub fn notification(
    request: &GateRequest,
    route: &ChannelConfig,
    evidence_base_url: &str,
) -> OutboundMessage {
    let evidence = evidence_url(evidence_base_url, &request.request_id);
    let summary = if request.summary.trim().is_empty() {
        "_No summary provided._".to_string()
    } else {
        truncate(&request.summary, MAX_SECTION_CHARS)
    };

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": truncate(
                    &format!("🔒 Approval needed: {}", request.gate_type),
                    MAX_HEADER_CHARS
                ),
                "emoji": true
            }
        }),
        json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": summary}
        }),
        json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("*Evidence:* <{evidence}|View evidence>")}
        }),
    ];

    if let Some(mentions) = mention_line(&route.mention_targets) {
        blocks.push(json!({
            "type": "context",
            "elements": [{"type": "mrkdwn", "text": format!("Attention: {mentions}")}]
        }));
    }

    blocks.push(json!({
        "type": "actions",
        "block_id": ACTIONS_BLOCK,
        "elements": [
            {
                "type": "button",
                "action_id": APPROVE_ACTION,
                "style": "primary",
                "text": {"type": "plain_text", "text": "Approve"},
                "value": request.request_id
            },
            {
                "type": "button",
                "action_id": REJECT_ACTION,
                "style": "danger",
                "text": {"type": "plain_text", "text": "Reject"},
                "value": request.request_id
            }
        ]
    }));

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!(
                "Requested by *{}* • Request `{}` • Task `{}`",
                display_or_unknown(&request.requester),
                request.request_id,
                display_or_unknown(&request.task_id)
            )
        }]
    }));

    OutboundMessage {
        channel: route.channel_id.clone(),
        text: format!(
            "Approval needed for {} ({})",
            request.gate_type, request.request_id
        ),
        blocks: Value::Array(blocks),
    }
}

fn display_or_unknown(value: &str) -> &str {
    if value.is_empty() { "unknown" } else { value }
}

/// One-line outcome appended to a resolved notification.
#[must_use]
pub fn terminal_line(record: &GateStatusRecord) -> String {
    let actor = record
        .decided_by
        .as_deref()
        .map_or_else(|| "unknown".to_string(), |a| format!("<@{a}>"));
    match record.status {
        GateStatus::Approved => format!("✅ *Approved* by {actor}"),
        GateStatus::Rejected => match record.reason.as_deref() {
            Some(reason) => format!("❌ *Rejected* by {actor}: {reason}"),
            None => format!("❌ *Rejected* by {actor}"),
        },
        GateStatus::Pending => "⏳ Pending".to_string(),
    }
}

/// Removes interactive controls from `original` and appends the outcome.
#[must_use]
pub fn resolved_blocks(original: &Value, record: &GateStatusRecord) -> Value {
    let mut blocks: Vec<Value> = original
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) != Some("actions"))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    blocks.push(outcome_section(record));
    Value::Array(blocks)
}

/// Resolved message rendered from the record alone, used when the original
/// layout is not at hand.
#[must_use]
pub fn compact_resolved(record: &GateStatusRecord) -> Value {
    json!([
        {
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*{}* gate for request `{}`",
                    record.gate_type, record.request_id
                )
            }
        },
        outcome_section(record)
    ])
}

/// Plain-text fallback for a resolved message.
#[must_use]
pub fn resolved_text(record: &GateStatusRecord) -> String {
    format!(
        "{} gate {} {}",
        record.gate_type,
        record.request_id,
        record.status.as_str().to_lowercase()
    )
}

fn outcome_section(record: &GateStatusRecord) -> Value {
    json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": terminal_line(record)}
    })
}

/// Modal asking for a rejection reason. `request_id` rides along as the
/// form's private metadata.
#[must_use]
pub fn rejection_form(request_id: &str) -> Value {
    json!({
        "type": "modal",
        "callback_id": REJECT_FORM_CALLBACK,
        "private_metadata": request_id,
        "title": {"type": "plain_text", "text": "Reject gate"},
        "submit": {"type": "plain_text", "text": "Reject"},
        "close": {"type": "plain_text", "text": "Cancel"},
        "blocks": [
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("Rejecting request `{request_id}`")}
            },
            {
                "type": "input",
                "block_id": REASON_BLOCK,
                "label": {"type": "plain_text", "text": "Reason"},
                "element": {
                    "type": "plain_text_input",
                    "action_id": REASON_INPUT,
                    "multiline": true
                }
            }
        ]
    })
}
