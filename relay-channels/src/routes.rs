//! HTTP routes for the WhatsApp relay.
//!
//! - `GET /health`: liveness
//! - `GET /webhook`: Meta webhook verification handshake
//! - `POST /webhook`: inbound messages, acknowledged before any reply is produced

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use relay_common::logging::generate_trace_id;
use relay_common::Error as RelayError;
use relay_session::{now_millis, Orchestrator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::whatsapp::WhatsAppChannel;

const MAX_WEBHOOK_BODY: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// State
// ============================================================================

/// Shared state for the relay HTTP server.
pub struct RelayState {
    pub whatsapp: Arc<WhatsAppChannel>,
    /// App secret for `X-Hub-Signature-256` verification; unchecked when absent
    pub app_secret: Option<Arc<str>>,
    pub orchestrator: Arc<Orchestrator>,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    tracked_users: usize,
    pending_users: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub accepted: usize,
}

impl WebhookResponse {
    fn ok(accepted: usize) -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
            accepted,
        })
    }

    /// Answer with the error's status and message.
    fn reject(err: RelayError) -> (StatusCode, Json<Self>) {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(Self {
                success: false,
                message: Some(err.to_string()),
                accepted: 0,
            }),
        )
    }
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "relay-channels",
        version: env!("CARGO_PKG_VERSION"),
        tracked_users: state.orchestrator.store().len(),
        pending_users: state.orchestrator.pending_users(),
    })
}

// ============================================================================
// WhatsApp Webhook
// ============================================================================

/// Meta webhook verification query params.
#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Verify an `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw body.
pub fn verify_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    // Constant-time
    mac.verify_slice(&expected).is_ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// GET /webhook
async fn webhook_verify(
    State(state): State<Arc<RelayState>>,
    Query(params): Query<VerifyQuery>,
) -> impl IntoResponse {
    let token_matches = params
        .verify_token
        .as_deref()
        .is_some_and(|t| constant_time_eq(t.as_bytes(), state.whatsapp.verify_token().as_bytes()));

    if params.mode.as_deref() == Some("subscribe") && token_matches {
        if let Some(challenge) = params.challenge {
            tracing::info!("WhatsApp webhook verified");
            return (StatusCode::OK, challenge);
        }
        return (StatusCode::BAD_REQUEST, "Missing hub.challenge".to_string());
    }

    tracing::warn!("WhatsApp webhook verification failed: token mismatch");
    (StatusCode::FORBIDDEN, "Forbidden".to_string())
}

/// POST /webhook
async fn webhook_receive(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(ref app_secret) = state.app_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !verify_signature(app_secret, &body, signature) {
            tracing::warn!(
                signature = if signature.is_empty() { "missing" } else { "invalid" },
                "WhatsApp webhook signature rejected"
            );
            return WebhookResponse::reject(RelayError::BadSignature);
        }
    }

    let payload = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(payload) => payload,
        Err(e) => return WebhookResponse::reject(RelayError::MalformedPayload(e.to_string())),
    };

    let messages = state.whatsapp.parse_webhook_payload(&payload);
    let accepted = messages.len();

    let span = tracing::debug_span!("webhook", trace_id = %generate_trace_id());
    span.in_scope(|| {
        for msg in messages {
            // Rate windows run on arrival time; the platform timestamp only
            // tells how late the delivery is.
            let now = now_millis();
            tracing::debug!(
                user = %msg.user_key,
                message_id = %msg.id,
                delivery_lag_ms = now - msg.timestamp,
                preview = %msg.text.chars().take(50).collect::<String>(),
                "WhatsApp message received"
            );

            let user_key = msg.user_key;
            let decision = state.orchestrator.dispatch(user_key.clone(), msg.text, now);
            let (minute_left, hour_left) = state.orchestrator.limiter().remaining(&user_key, now);
            tracing::debug!(
                user = %user_key,
                admitted = decision.admitted,
                scope = ?decision.scope,
                minute_left,
                hour_left,
                "Message dispatched"
            );
        }
    });

    // Status updates and ignored messages are acknowledged too, or Meta retries
    (StatusCode::OK, WebhookResponse::ok(accepted))
}

// ============================================================================
// Router
// ============================================================================

/// Build the relay router.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_receive))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"entry":[]}"#;
        let header = sign("s3cret", body);

        assert!(verify_signature("s3cret", body, &header));
        assert!(!verify_signature("other", body, &header));
        assert!(!verify_signature("s3cret", b"tampered", &header));
        assert!(!verify_signature("s3cret", body, header.trim_start_matches("sha256=")));
        assert!(!verify_signature("s3cret", body, "sha256=zz"));
        assert!(!verify_signature("s3cret", body, ""));
    }

    #[test]
    fn test_reject_uses_error_status() {
        let (status, Json(body)) =
            WebhookResponse::reject(RelayError::MalformedPayload("EOF at line 1".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert_eq!(body.message.as_deref(), Some("Malformed payload: EOF at line 1"));

        let (status, _) = WebhookResponse::reject(RelayError::BadSignature);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"token", b"token2"));
    }
}
