//! # API Request Models
//!
//! Structures for incoming API request bodies.
//! Each struct represents the expected JSON body for an endpoint.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::RaffleStatus;

/// Create or update a raffle.
///
/// Sent by the organizer platform; the backend does not own raffle
/// authoring, it only mirrors what the draw needs.
///
/// ## Example JSON
///
/// ```json
/// {
///     "id": "0b7e7c58-…",
///     "title": "Moto Honda CG 160",
///     "goalCents": 1500000,
///     "ticketPriceCents": 500,
///     "totalTickets": 5000,
///     "status": "active",
///     "drawDate": "2026-12-19"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRaffleRequest {
    /// Omit to create a raffle with a fresh id.
    pub id: Option<Uuid>,
    pub title: String,
    pub goal_cents: i64,
    pub ticket_price_cents: i64,

    /// Omit for an unbounded number pool.
    pub total_tickets: Option<i64>,

    /// Defaults to `active`.
    pub status: Option<RaffleStatus>,
    pub draw_date: Option<NaiveDate>,
}

/// Move a raffle to another status.
///
/// ## Example JSON
///
/// ```json
/// { "status": "suspended" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaffleStatusRequest {
    pub status: RaffleStatus,
}

/// Reserve tickets in a raffle.
///
/// ## Example JSON
///
/// ```json
/// { "buyerId": "user_2x8…", "quantity": 5 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub buyer_id: String,
    pub quantity: i64,
}

/// Register the charge checkout issued for a reservation.
///
/// ## Example JSON
///
/// ```json
/// {
///     "reservationId": "5b0c…",
///     "provider": "asaas",
///     "providerPaymentId": "pay_080225913252",
///     "amountCents": 2500
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPaymentRequest {
    pub reservation_id: Uuid,
    pub provider: String,
    pub provider_payment_id: String,
    pub amount_cents: i64,
}

/// Store a Federal Lottery result.
///
/// ## Example JSON
///
/// ```json
/// {
///     "contestNumber": 5912,
///     "drawDate": "2026-10-14",
///     "numbers": [12, 34, 56, 78, 90]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestDrawRequest {
    pub contest_number: i64,
    pub draw_date: NaiveDate,
    pub numbers: Vec<i64>,
}

/// Resolve a raffle, optionally against a specific contest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Omit to use the earliest qualifying ingested draw.
    pub contest_number: Option<i64>,
}

/// Query parameters for `GET /reconciliation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagQuery {
    /// Default: 50, max: 500.
    pub limit: Option<i64>,
}

impl FlagQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

/// Payment id and status pulled out of a provider webhook body.
///
/// Providers nest these differently: Asaas sends
/// `{"event": …, "payment": {"id", "status"}}`, others send flat
/// `{"paymentId" | "id", "status"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookFields {
    pub payment_id: String,
    pub status: String,
}

impl WebhookFields {
    /// Extract the fields, `None` when either is missing.
    pub fn extract(body: &Value) -> Option<Self> {
        let text = |v: &Value| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };

        let nested = body.get("payment");
        let payment_id = body
            .get("paymentId")
            .or_else(|| nested.and_then(|p| p.get("id")))
            .or_else(|| body.get("id"))
            .and_then(text)?;
        let status = body
            .get("status")
            .or_else(|| nested.and_then(|p| p.get("status")))
            .and_then(text)?;

        Some(Self { payment_id, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_webhook_fields_flat_and_nested() {
        let flat = json!({ "paymentId": "pay_1", "status": "RECEIVED" });
        assert_eq!(
            WebhookFields::extract(&flat),
            Some(WebhookFields { payment_id: "pay_1".into(), status: "RECEIVED".into() })
        );

        let nested = json!({ "event": "PAYMENT_RECEIVED", "payment": { "id": "pay_2", "status": "CONFIRMED" } });
        assert_eq!(WebhookFields::extract(&nested).unwrap().payment_id, "pay_2");

        let numeric = json!({ "id": 123456789, "status": "approved" });
        assert_eq!(WebhookFields::extract(&numeric).unwrap().payment_id, "123456789");

        assert_eq!(WebhookFields::extract(&json!({ "status": "paid" })), None);
    }

    #[test]
    fn test_flag_query_limit_is_clamped() {
        assert_eq!(FlagQuery { limit: None }.limit(), 50);
        assert_eq!(FlagQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(FlagQuery { limit: Some(10_000) }.limit(), 500);
    }
}
