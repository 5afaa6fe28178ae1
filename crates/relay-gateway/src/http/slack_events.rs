//! Slack Events API ingress: POST /slack/events.
//!
//! Every request is answered immediately. Admitted messages run on their own
//! task so the response always fits inside Slack's three-second window.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use relay_slack::{EventEnvelope, Route, SlackEvent};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Requests signed further than this from now are rejected as replays.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

pub async fn slack_events_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.config.slack.verify_signatures {
        verify_slack_signature(
            &headers,
            &body,
            state.config.slack.signing_secret.as_deref(),
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| auth_error(&e))?;
    }

    let envelope = EventEnvelope::parse(&body).map_err(|e| {
        warn!(error = %e, "invalid Slack event body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid event body"})),
        )
    })?;

    match envelope {
        EventEnvelope::UrlVerification { challenge } => {
            info!("answering url_verification");
            Ok(Json(json!({ "challenge": challenge })))
        }
        EventEnvelope::EventCallback { event_id, event } => {
            if let Some(retry) = headers.get("x-slack-retry-num").and_then(|v| v.to_str().ok()) {
                let reason = headers
                    .get("x-slack-retry-reason")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                info!(retry, reason, %event_id, "acknowledging Slack retry");
                return Ok(ack());
            }
            if !state.first_delivery(&event_id) {
                debug!(%event_id, "duplicate event");
                return Ok(ack());
            }
            tokio::spawn(dispatch(Arc::clone(&state), event));
            Ok(ack())
        }
        EventEnvelope::Unsupported => Ok(ack()),
    }
}

async fn dispatch(state: Arc<AppState>, event: SlackEvent) {
    match state.router.route(event).await {
        Route::Answer(message) => {
            let thread = message.thread.clone();
            let outcome = state.relay.handle(message).await;
            debug!(thread = %thread, outcome = outcome.as_str(), "event handled");
        }
        Route::Stop(thread) => {
            if state.relay.stop(&thread) {
                info!(thread = %thread, "stop requested");
            } else {
                debug!(thread = %thread, "stop requested but nothing is running");
            }
        }
        Route::Ignore(reason) => debug!(reason, "event ignored"),
    }
}

/// Verify Slack's `v0` request signature:
/// `X-Slack-Signature: v0=<hex hmac_sha256(secret, "v0:{ts}:{body}")>`.
pub fn verify_slack_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
    now: i64,
) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no signing secret configured".to_string())?;

    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Slack-Request-Timestamp header".to_string())?;
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| "malformed X-Slack-Request-Timestamp header".to_string())?;
    if (now - ts).abs() > MAX_TIMESTAMP_SKEW_SECS {
        return Err("request timestamp outside the allowed window".to_string());
    }

    let sig_header = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Slack-Signature header".to_string())?;
    let sig_hex = sig_header
        .strip_prefix("v0=")
        .ok_or_else(|| "malformed X-Slack-Signature header".to_string())?;
    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Slack-Signature is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "signature mismatch".to_string())
}

fn ack() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn auth_error(reason: &str) -> (StatusCode, Json<Value>) {
    warn!(reason = %reason, "Slack request authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed"})),
    )
}
