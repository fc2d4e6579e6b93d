//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{PaymentTransaction, Raffle, RaffleStatus, Reservation, ReservationState, WinnerRecord};
use crate::utils::{format_brl, funding_progress};

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "INSUFFICIENT_CAPACITY",
///         "message": "Sold out: only 3 ticket(s) left, try fewer tickets"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "RAFFLE_NOT_ACTIVE").
    pub code: String,

    /// Human-readable error message.
    pub message: String,
}

/// Raffle read model.
///
/// Returned by `GET /raffles/{id}`
///
/// ## Example Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "id": "0b7e7c58-…",
///         "title": "Moto Honda CG 160",
///         "status": "active",
///         "goalCents": 1500000,
///         "amountRaisedCents": 375000,
///         "progressPercent": 25.0,
///         "formattedGoal": "R$ 15.000,00",
///         "formattedRaised": "R$ 3.750,00"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaffleResponse {
    pub id: Uuid,
    pub title: String,
    pub status: RaffleStatus,
    pub goal_cents: i64,
    pub ticket_price_cents: i64,
    pub amount_raised_cents: i64,
    pub total_tickets: Option<i64>,
    pub draw_date: Option<NaiveDate>,
    pub goal_reached_at: Option<DateTime<Utc>>,

    /// Share of the goal raised, 0–100.
    pub progress_percent: f64,

    /// e.g. "R$ 15.000,00"
    pub formatted_goal: String,
    pub formatted_raised: String,
    pub formatted_ticket_price: String,
    pub updated_at: DateTime<Utc>,
}

impl From<Raffle> for RaffleResponse {
    fn from(r: Raffle) -> Self {
        Self {
            progress_percent: funding_progress(r.amount_raised_cents, r.goal_cents),
            formatted_goal: format_brl(r.goal_cents),
            formatted_raised: format_brl(r.amount_raised_cents),
            formatted_ticket_price: format_brl(r.ticket_price_cents),
            id: r.id,
            title: r.title,
            status: r.status,
            goal_cents: r.goal_cents,
            ticket_price_cents: r.ticket_price_cents,
            amount_raised_cents: r.amount_raised_cents,
            total_tickets: r.total_tickets,
            draw_date: r.draw_date,
            goal_reached_at: r.goal_reached_at,
            updated_at: r.updated_at,
        }
    }
}

/// Reservation read model.
///
/// A reservation whose payment has not arrived yet reads as `reserved`
/// with `awaitingPayment: true`; a slow payment is never shown as failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationResponse {
    pub id: Uuid,
    pub raffle_id: Uuid,
    pub buyer_id: String,
    pub quantity: i64,
    pub ticket_numbers: Vec<i64>,
    pub amount_cents: i64,
    pub formatted_amount: String,
    pub state: ReservationState,
    pub awaiting_payment: bool,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub transaction_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<Reservation> for ReservationResponse {
    fn from(r: Reservation) -> Self {
        Self {
            formatted_amount: format_brl(r.amount_cents),
            awaiting_payment: r.state == ReservationState::Reserved,
            id: r.id,
            raffle_id: r.raffle_id,
            buyer_id: r.buyer_id,
            quantity: r.quantity,
            ticket_numbers: r.ticket_numbers,
            amount_cents: r.amount_cents,
            state: r.state,
            expires_at: r.expires_at,
            paid_at: r.paid_at,
            transaction_ref: r.transaction_ref,
            created_at: r.created_at,
        }
    }
}

/// Result of a provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEventResponse {
    /// `applied`, `duplicate` or `ignored`.
    pub outcome: String,

    /// Why an event was ignored.
    pub reason: Option<String>,
    pub transaction: PaymentTransaction,
}

/// Result of `POST /raffles/{id}/resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResponse {
    /// `true` when the raffle had been decided before this call.
    pub already_resolved: bool,
    pub winner: WinnerRecord,
}

/// Result of `POST /maintenance/expire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpireResponse {
    pub expired: usize,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status: "healthy" or "unhealthy".
    pub status: String,

    /// Storage backend reachable.
    pub storage: bool,

    /// `postgres` or `memory`.
    pub storage_backend: String,

    /// Open WebSocket connections.
    pub websocket_connections: usize,

    /// Service version.
    pub version: String,

    /// Current timestamp.
    pub timestamp: DateTime<Utc>,
}
