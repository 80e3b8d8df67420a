use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::notify::{Notice, Notifier};
use crate::subscription::{GrantOutcome, LedgerError, SubscriptionLedger};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Payment provider webhook envelope. Delivery is at-least-once; the
/// payload's `event_id` is the idempotency key.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub name: String,
    pub payload: PaymentEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub event_id: String,
    pub telegram_user_id: i64,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub amount: i64,
}

pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check over the raw body. An empty secret refuses
/// everything rather than accepting everything.
pub fn verify_signature(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    if secret.is_empty() || signature_hex.is_empty() {
        return false;
    }
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessOutcome {
    Granted { expires_at: DateTime<Utc> },
    /// Redelivered event; nothing changed.
    Duplicate,
}

/// Applies a verified payment event: premium grant, activation notice,
/// referral bonus. Safe to call repeatedly with the same event.
#[derive(Clone)]
pub struct PaymentProcessor {
    ledger: SubscriptionLedger,
    notifier: Arc<dyn Notifier>,
    premium_days: i64,
}

impl PaymentProcessor {
    pub fn new(ledger: SubscriptionLedger, notifier: Arc<dyn Notifier>, premium_days: i64) -> Self {
        Self {
            ledger,
            notifier,
            premium_days,
        }
    }

    pub async fn process(&self, event: &PaymentEvent) -> Result<ProcessOutcome, LedgerError> {
        let outcome = self
            .ledger
            .grant_premium(
                event.telegram_user_id,
                self.premium_days,
                &event.event_id,
                event.amount,
                "payment",
            )
            .await?;

        let GrantOutcome::Applied { expires_at } = outcome else {
            tracing::info!("payment event {} already applied, skipping", event.event_id);
            return Ok(ProcessOutcome::Duplicate);
        };
        tracing::info!(
            "premium granted to user {} until {expires_at}",
            event.telegram_user_id,
        );

        if let Err(e) = self
            .notifier
            .notify(event.telegram_user_id, Notice::PremiumActivated { until: expires_at })
            .await
        {
            tracing::warn!(
                "failed to notify user {} about activation: {e}",
                event.telegram_user_id,
            );
        }

        match self
            .ledger
            .apply_referral_bonus(event.telegram_user_id, &event.event_id)
            .await
        {
            Ok(Some(bonus)) => {
                tracing::info!(
                    "referral bonus of {} days granted to user {}",
                    bonus.days,
                    bonus.referrer_id,
                );
                if let Err(e) = self
                    .notifier
                    .notify(bonus.referrer_id, Notice::ReferralConverted { bonus_days: bonus.days })
                    .await
                {
                    tracing::warn!("failed to notify referrer {}: {e}", bonus.referrer_id);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("referral bonus for event {} failed: {e}", event.event_id);
            }
        }

        Ok(ProcessOutcome::Granted { expires_at })
    }
}

pub struct WebhookState {
    pub processor: PaymentProcessor,
    pub secret: String,
    /// Expected product id; empty accepts any.
    pub product_id: String,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/payment", post(payment_webhook))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(state: Arc<WebhookState>, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("payment webhook listening on port {port}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn payment_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.secret, body.as_bytes(), signature) {
        tracing::warn!("payment webhook with invalid signature");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "invalid signature"})),
        );
    }

    let envelope: WebhookEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("malformed payment webhook: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "bad payload"})));
        }
    };

    if envelope.name != "new_digital_product" {
        tracing::info!("acknowledging unhandled webhook event: {}", envelope.name);
        return (StatusCode::OK, Json(json!({"ok": true})));
    }

    let event = envelope.payload;
    if !state.product_id.is_empty() && event.product_id != state.product_id {
        tracing::warn!("unknown product id: {}", event.product_id);
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "unknown product"})));
    }

    match state.processor.process(&event).await {
        Ok(ProcessOutcome::Granted { .. }) => (
            StatusCode::OK,
            Json(json!({"ok": true, "status": "premium_granted"})),
        ),
        Ok(ProcessOutcome::Duplicate) => (
            StatusCode::OK,
            Json(json!({"ok": true, "status": "duplicate"})),
        ),
        Err(LedgerError::NotFound(user_id)) => {
            tracing::warn!("payment for unknown user {user_id}");
            (StatusCode::BAD_REQUEST, Json(json!({"error": "unknown user"})))
        }
        Err(e) => {
            tracing::error!("payment processing failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "storage unavailable"})),
            )
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "laoshi-bot-webhook"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip() {
        let secret = "webhook-secret";
        let body = br#"{"name":"new_digital_product"}"#;
        let signature = sign_payload(secret, body);
        assert!(verify_signature(secret, body, &signature));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let secret = "webhook-secret";
        let signature = sign_payload(secret, b"original");
        assert!(!verify_signature(secret, b"tampered", &signature));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signature = sign_payload("secret-a", b"body");
        assert!(!verify_signature("secret-b", b"body", &signature));
    }

    #[test]
    fn empty_secret_refuses_everything() {
        assert!(!verify_signature("", b"body", "deadbeef"));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(!verify_signature("secret", b"body", "not-hex"));
    }

    #[test]
    fn envelope_parses_provider_payload() {
        let raw = r#"{
            "name": "new_digital_product",
            "created_at": "2025-06-01T10:00:00Z",
            "payload": {
                "event_id": "evt_123",
                "telegram_user_id": 42,
                "product_id": "pq5z",
                "amount": 77000,
                "currency": "rub"
            }
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.name, "new_digital_product");
        assert_eq!(envelope.payload.event_id, "evt_123");
        assert_eq!(envelope.payload.telegram_user_id, 42);
        assert_eq!(envelope.payload.amount, 77000);
    }
}
