//! Slack request signature verification.
//!
//! Slack signs each interaction request with
//! `v0=hex(HMAC-SHA256(secret, "v0:{timestamp}:{body}"))` and sends the
//! result in `X-Slack-Signature` alongside `X-Slack-Request-Timestamp`.
//! Requests older than five minutes are refused to limit replay.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

const SIGNATURE_VERSION: &str = "v0";
const SIGNATURE_TOLERANCE_SECS: u64 = 300;
const MAX_BODY_BYTES: usize = 64 * 1024;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid request timestamp")]
    InvalidTimestamp,

    #[error("request timestamp outside the 5 minute window")]
    Expired,

    #[error("malformed signature")]
    Malformed,

    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies request signatures with a shared signing secret.
#[derive(Clone)]
pub struct SlackVerifier {
    secret: Arc<str>,
}

impl std::fmt::Debug for SlackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackVerifier").finish_non_exhaustive()
    }
}

impl SlackVerifier {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Checks headers and body against the secret at time `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns the first check that failed.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8], now: i64) -> Result<(), SignatureError> {
        let timestamp = header_str(headers, TIMESTAMP_HEADER)?;
        let signature = header_str(headers, SIGNATURE_HEADER)?;

        let sent_at = timestamp
            .parse::<i64>()
            .map_err(|_| SignatureError::InvalidTimestamp)?;
        if now.abs_diff(sent_at) > SIGNATURE_TOLERANCE_SECS {
            return Err(SignatureError::Expired);
        }

        let provided = signature
            .strip_prefix("v0=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(SignatureError::Malformed)?;

        let expected = self.sign(timestamp, body);
        if bool::from(expected.ct_eq(provided.as_slice())) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Raw MAC bytes for `timestamp` and `body`.
    fn sign(&self, timestamp: &str, body: &[u8]) -> Vec<u8> {
        // new_from_slice accepts keys of any length for HMAC.
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return Vec::new();
        };
        mac.update(SIGNATURE_VERSION.as_bytes());
        mac.update(b":");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }

    /// `v0=...` header value for `timestamp` and `body`.
    pub fn signature_header(&self, timestamp: &str, body: &[u8]) -> String {
        format!("v0={}", hex::encode(self.sign(timestamp, body)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader(name))
}

/// Middleware that buffers the body, verifies it and passes the request on.
pub async fn verify_slack_signature(
    State(verifier): State<SlackVerifier>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes: Bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to read interaction body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let now = chrono::Utc::now().timestamp();
    if let Err(e) = verifier.verify(&parts.headers, &bytes, now) {
        warn!(error = %e, "Rejected unsigned or stale interaction request");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
