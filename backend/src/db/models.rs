//! # Database Models
//!
//! This module defines the records the draw backend persists. Each struct
//! maps to one table; the status enums are stored as lowercase `TEXT`.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `raffles` | Prize drawings and their funding progress |
//! | `reservations` | Ticket holds, paid or pending payment |
//! | `reservation_tickets` | Live number claims (one row per held number) |
//! | `payment_transactions` | Provider payment records |
//! | `lottery_draws` | Federal Lottery results, immutable |
//! | `winners` | One resolved outcome per raffle |
//! | `reconciliation_flags` | Cases routed to an operator |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌─────────────┐       ┌──────────────────┐       ┌──────────────────────┐
//! │   raffles   │──────<│   reservations   │──────<│ payment_transactions │
//! │             │       │                  │       │                      │
//! │ id (PK)     │       │ raffle_id (FK)   │       │ reservation_id (FK)  │
//! │ status      │       │ ticket_numbers   │       │ (provider, payment)  │
//! │ raised      │       │ state            │       │ status               │
//! └─────────────┘       └──────────────────┘       └──────────────────────┘
//!        │                       │
//!        ▼                       ▼
//! ┌─────────────┐       ┌──────────────────────┐
//! │   winners   │       │ reservation_tickets  │
//! │ raffle (PK) │       │ (raffle_id, number)  │
//! └─────────────┘       └──────────────────────┘
//! ```
//!
//! ## Note on Types
//!
//! Money is kept in centavos and ticket numbers in `i64` because PostgreSQL
//! has no unsigned integers. Both are always positive in practice.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates `as_str`, `Display` and `FromStr` for a status enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The lowercase text stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

// ============================================
// RAFFLES
// ============================================

/// Lifecycle of a raffle.
///
/// Transitions only move forward, except `active ↔ suspended`:
///
/// ```text
/// pending ──> active ──> completed
///    │          │ ▲
///    │          ▼ │
///    │       suspended
///    │          │
///    └──────────┴──────> cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RaffleStatus {
    /// Created but not yet selling tickets.
    Pending,
    /// Selling tickets.
    Active,
    /// Funding goal reached. Awaiting the draw, or already drawn.
    Completed,
    /// Called off by the organizer.
    Cancelled,
    /// Sales paused by moderation.
    Suspended,
}

text_enum!(RaffleStatus {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Suspended => "suspended",
});

impl RaffleStatus {
    /// Whether `self → next` is a permitted transition.
    pub fn can_transition_to(self, next: RaffleStatus) -> bool {
        use RaffleStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Suspended, Cancelled)
        )
    }
}

/// A prize drawing ("ganhável").
///
/// ## Fields
///
/// | Field | Type | Description |
/// |-------|------|-------------|
/// | goal_cents | i64 | Funding target |
/// | ticket_price_cents | i64 | Price of one ticket |
/// | amount_raised_cents | i64 | Sum of paid reservations |
/// | total_tickets | Option<i64> | Size of a bounded number pool |
/// | draw_date | Option<NaiveDate> | Earliest lottery date that may decide it |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Raffle {
    pub id: Uuid,
    pub title: String,
    pub goal_cents: i64,
    pub ticket_price_cents: i64,

    /// Only ever decreased by refund compensation.
    pub amount_raised_cents: i64,

    /// `None` means numbers are drawn from an unbounded `1..` domain.
    pub total_tickets: Option<i64>,
    pub status: RaffleStatus,
    pub draw_date: Option<NaiveDate>,

    /// Set once, when a payment pushes the raffle over its goal.
    pub goal_reached_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Raffle {
    /// Whether new reservations may be taken.
    pub fn accepts_purchases(&self) -> bool {
        self.status == RaffleStatus::Active
    }

    /// Move to `next`, enforcing the transition table.
    pub fn transition(&mut self, next: RaffleStatus, now: DateTime<Utc>) -> Result<(), String> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(format!("cannot move raffle from {} to {}", self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        if next == RaffleStatus::Completed && self.goal_reached_at.is_none() {
            // Closed by an operator before the goal: the draw window opens now.
            self.goal_reached_at = Some(now);
        }
        Ok(())
    }

    /// Add a confirmed payment to the amount raised.
    ///
    /// Returns `true` when this payment is the one that reached the goal;
    /// the raffle then closes for sales and awaits the draw.
    pub fn credit(&mut self, amount_cents: i64, now: DateTime<Utc>) -> bool {
        self.amount_raised_cents = self.amount_raised_cents.saturating_add(amount_cents);
        self.updated_at = now;

        if self.status == RaffleStatus::Active && self.amount_raised_cents >= self.goal_cents {
            self.status = RaffleStatus::Completed;
            self.goal_reached_at = Some(now);
            return true;
        }
        false
    }

    /// Refund compensation, the only path that lowers the amount raised.
    pub fn compensate_refund(&mut self, amount_cents: i64, now: DateTime<Utc>) {
        self.amount_raised_cents = (self.amount_raised_cents - amount_cents).max(0);
        self.updated_at = now;
    }

    /// First draw date allowed to decide the raffle.
    ///
    /// Sales close on the day the goal is reached, and a result published
    /// that day may already be public while the last numbers are sold, so
    /// the window opens the day after. A scheduled date later than that
    /// pushes it further out.
    pub fn earliest_draw_date(&self) -> NaiveDate {
        let closed_on = self.goal_reached_at.unwrap_or(self.updated_at).date_naive();
        let after_close = closed_on.succ_opt().unwrap_or(closed_on);
        match self.draw_date {
            Some(scheduled) => scheduled.max(after_close),
            None => after_close,
        }
    }
}

// ============================================
// RESERVATIONS
// ============================================

/// State of a ticket reservation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Numbers held, payment pending.
    Reserved,
    /// Payment confirmed; the numbers are sold.
    Paid,
    /// Payment window lapsed; numbers returned to the pool.
    Expired,
    /// Abandoned by the buyer or refunded; numbers returned to the pool.
    Released,
}

text_enum!(ReservationState {
    Reserved => "reserved",
    Paid => "paid",
    Expired => "expired",
    Released => "released",
});

/// A hold on a set of ticket numbers for one buyer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    pub raffle_id: Uuid,

    /// Opaque user id from the auth platform.
    pub buyer_id: String,
    pub quantity: i64,

    /// Sorted ascending.
    pub ticket_numbers: Vec<i64>,

    /// `quantity × ticket price` at reservation time.
    pub amount_cents: i64,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,

    /// The payment transaction that paid for this reservation.
    pub transaction_ref: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// A `reserved` hold whose payment window has lapsed.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Reserved && self.expires_at <= now
    }
}

/// A sold ticket as seen by winner resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub number: i64,
    pub reservation_id: Uuid,
    pub buyer_id: String,

    /// Confirmation time of the paying reservation.
    pub purchased_at: DateTime<Utc>,
}

// ============================================
// PAYMENTS
// ============================================

/// Payment record status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

text_enum!(PaymentStatus {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
    Refunded => "refunded",
});

impl PaymentStatus {
    /// `pending → paid`, `pending → failed`, `paid → refunded`. Nothing else.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!((self, next), (Pending, Paid) | (Pending, Failed) | (Paid, Refunded))
    }
}

/// Payment providers the backend understands.
///
/// Each provider reports statuses in its own vocabulary;
/// [`PaymentProvider::normalize_status`] maps them onto [`PaymentStatus`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Asaas,
    MercadoPago,
    /// Back-office confirmations entered by an operator.
    Manual,
}

text_enum!(PaymentProvider {
    Asaas => "asaas",
    MercadoPago => "mercadopago",
    Manual => "manual",
});

impl PaymentProvider {
    /// Map a provider status onto our state machine.
    ///
    /// Returns `None` for statuses we do not recognise.
    pub fn normalize_status(&self, raw: &str) -> Option<PaymentStatus> {
        let status = raw.trim();
        match self {
            PaymentProvider::Asaas => match status.to_ascii_uppercase().as_str() {
                "PENDING" | "AWAITING_RISK_ANALYSIS" => Some(PaymentStatus::Pending),
                "RECEIVED" | "CONFIRMED" | "RECEIVED_IN_CASH" => Some(PaymentStatus::Paid),
                "OVERDUE" | "DELETED" | "REFUSED" => Some(PaymentStatus::Failed),
                "REFUNDED" | "CHARGEBACK_REQUESTED" => Some(PaymentStatus::Refunded),
                _ => None,
            },
            PaymentProvider::MercadoPago => match status.to_ascii_lowercase().as_str() {
                "pending" | "in_process" | "authorized" => Some(PaymentStatus::Pending),
                "approved" => Some(PaymentStatus::Paid),
                "rejected" | "cancelled" => Some(PaymentStatus::Failed),
                "refunded" | "charged_back" => Some(PaymentStatus::Refunded),
                _ => None,
            },
            PaymentProvider::Manual => status.to_ascii_lowercase().parse().ok(),
        }
    }
}

/// One payment attempt.
///
/// `reservation_id` is `None` while the record is provisional, i.e. the
/// provider's webhook arrived before checkout registered the charge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub provider: String,

    /// Unique together with `provider`.
    pub provider_payment_id: String,
    pub amount_cents: Option<i64>,
    pub status: PaymentStatus,

    /// Last provider payload that changed the status, kept for audit.
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

// ============================================
// DRAWS & WINNERS
// ============================================

/// A Federal Lottery result. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LotteryDraw {
    pub contest_number: i64,
    pub draw_date: NaiveDate,

    /// Two-digit numbers in published order.
    pub numbers: [u8; 5],
    pub ingested_at: DateTime<Utc>,
}

impl LotteryDraw {
    /// Same contest data, ignoring when it was ingested.
    pub fn same_result(&self, other: &LotteryDraw) -> bool {
        self.contest_number == other.contest_number
            && self.draw_date == other.draw_date
            && self.numbers == other.numbers
    }
}

/// How the winning ticket was reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Ticket number equals the target.
    Exact,
    /// Closest sold number above the target.
    NearestAbove,
    /// Nothing sold above the target; the lowest sold number wins.
    WrappedToLowest,
}

text_enum!(MatchKind {
    Exact => "exact",
    NearestAbove => "nearest_above",
    WrappedToLowest => "wrapped_to_lowest",
});

/// The single resolved outcome of a raffle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WinnerRecord {
    pub raffle_id: Uuid,
    pub ticket_number: i64,
    pub target_number: i64,
    pub match_kind: MatchKind,
    pub buyer_id: String,
    pub reservation_id: Uuid,
    pub contest_number: i64,
    pub pool_size: i64,

    /// Identifier of the target combination rule used.
    pub rule: String,
    pub resolved_at: DateTime<Utc>,
}

// ============================================
// RECONCILIATION
// ============================================

/// Why a case was routed to an operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    /// Payment confirmed after the reservation lapsed and could not be restored.
    LatePayment,
    /// Payment events that contradict the recorded state.
    PaymentConflict,
    /// A broken invariant found during resolution.
    IntegrityViolation,
}

text_enum!(FlagKind {
    LatePayment => "late_payment",
    PaymentConflict => "payment_conflict",
    IntegrityViolation => "integrity_violation",
});

/// Audit entry for a case that needs manual reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationFlag {
    pub id: Uuid,
    pub kind: FlagKind,
    pub raffle_id: Option<Uuid>,
    pub reservation_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub detail: String,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationFlag {
    pub fn new(kind: FlagKind, detail: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            raffle_id: None,
            reservation_id: None,
            transaction_id: None,
            detail: detail.into(),
            context: None,
            created_at: now,
        }
    }

    pub fn with_raffle(mut self, raffle_id: Uuid) -> Self {
        self.raffle_id = Some(raffle_id);
        self
    }

    pub fn with_reservation(mut self, reservation_id: Uuid) -> Self {
        self.reservation_id = Some(reservation_id);
        self
    }

    pub fn with_transaction(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raffle(status: RaffleStatus) -> Raffle {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Raffle {
            id: Uuid::new_v4(),
            title: "Moto 0km".to_string(),
            goal_cents: 10_000,
            ticket_price_cents: 1_000,
            amount_raised_cents: 0,
            total_tickets: Some(100),
            status,
            draw_date: None,
            goal_reached_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_raffle_status_transitions() {
        use RaffleStatus::*;
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Suspended.can_transition_to(Completed));
    }

    #[test]
    fn test_credit_completes_raffle_at_goal() {
        let mut r = raffle(RaffleStatus::Active);
        let now = r.created_at;

        assert!(!r.credit(9_000, now));
        assert_eq!(r.status, RaffleStatus::Active);

        assert!(r.credit(1_000, now));
        assert_eq!(r.status, RaffleStatus::Completed);
        assert_eq!(r.goal_reached_at, Some(now));
        assert_eq!(r.earliest_draw_date(), now.date_naive().succ_opt().unwrap());

        // Later credits keep counting but do not "reach" the goal again.
        assert!(!r.credit(1_000, now));
        assert_eq!(r.amount_raised_cents, 11_000);
    }

    #[test]
    fn test_draw_window_opens_after_sales_close() {
        let mut r = raffle(RaffleStatus::Active);
        let late_evening = Utc.with_ymd_and_hms(2026, 5, 10, 23, 30, 0).unwrap();
        assert!(r.credit(10_000, late_evening));

        let next_day = NaiveDate::from_ymd_opt(2026, 5, 11).unwrap();
        assert_eq!(r.earliest_draw_date(), next_day);

        // A schedule before the close never lets an earlier result decide.
        r.draw_date = NaiveDate::from_ymd_opt(2026, 5, 9);
        assert_eq!(r.earliest_draw_date(), next_day);

        r.draw_date = NaiveDate::from_ymd_opt(2026, 5, 16);
        assert_eq!(r.earliest_draw_date(), NaiveDate::from_ymd_opt(2026, 5, 16).unwrap());
    }

    #[test]
    fn test_payment_status_transitions() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Paid.can_transition_to(Refunded));
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Failed));
    }

    #[test]
    fn test_provider_status_normalization() {
        assert_eq!(PaymentProvider::Asaas.normalize_status("RECEIVED"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentProvider::Asaas.normalize_status("overdue"), Some(PaymentStatus::Failed));
        assert_eq!(PaymentProvider::MercadoPago.normalize_status("approved"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentProvider::MercadoPago.normalize_status("charged_back"), Some(PaymentStatus::Refunded));
        assert_eq!(PaymentProvider::Manual.normalize_status("PAID"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentProvider::MercadoPago.normalize_status("weird"), None);
    }

    #[test]
    fn test_text_round_trip_of_stored_enums() {
        assert_eq!("wrapped_to_lowest".parse::<MatchKind>(), Ok(MatchKind::WrappedToLowest));
        assert_eq!(ReservationState::Expired.to_string(), "expired");
        assert!("archived".parse::<RaffleStatus>().is_err());
    }
}
