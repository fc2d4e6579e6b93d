//! # Ticket Pool Rules
//!
//! Pure decisions shared by every [`Store`](crate::store::Store)
//! implementation. The stores own atomicity (row locks or per-raffle
//! mutexes); this module owns *what* happens inside the critical section,
//! so PostgreSQL and the in-memory store cannot drift apart.
//!
//! ## Number Selection
//!
//! The lowest free numbers win. Bounded raffles draw from
//! `1..=total_tickets`, unbounded ones from `1..`. Numbers released by
//! expired or abandoned holds are therefore reused first.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::LatePaymentPolicy;
use crate::db::{FlagKind, Raffle, RaffleStatus, ReconciliationFlag, Reservation, ReservationState};

use super::reservation_ledger::LedgerError;

/// Pick `quantity` unclaimed numbers.
///
/// ## Arguments
///
/// * `claimed` - Numbers held by live (`reserved` or `paid`) reservations
/// * `quantity` - How many numbers the buyer asked for
/// * `pool_size` - Upper bound of the number domain, if any
///
/// ## Returns
///
/// * `Ok(numbers)` - Sorted ascending, disjoint from `claimed`
/// * `Err(LedgerError::InsufficientCapacity)` - Bounded pool too small
pub fn allocate_numbers(
    claimed: &BTreeSet<i64>,
    quantity: i64,
    pool_size: Option<i64>,
) -> Result<Vec<i64>, LedgerError> {
    if let Some(available) = remaining_capacity(claimed, pool_size) {
        if quantity > available {
            return Err(LedgerError::InsufficientCapacity {
                requested: quantity,
                available,
            });
        }
    }

    let mut numbers = Vec::with_capacity(quantity.max(0) as usize);
    let mut candidate = 1_i64;
    while (numbers.len() as i64) < quantity {
        if !claimed.contains(&candidate) {
            numbers.push(candidate);
        }
        candidate += 1;
    }

    Ok(numbers)
}

/// Free numbers left in a bounded pool; `None` when unbounded.
pub fn remaining_capacity(claimed: &BTreeSet<i64>, pool_size: Option<i64>) -> Option<i64> {
    pool_size.map(|pool| {
        let taken = claimed.range(1..=pool).count() as i64;
        (pool - taken).max(0)
    })
}

/// What a payment confirmation should do to a reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmDecision {
    /// In-window `reserved` hold: mark it paid.
    MarkPaid,
    /// Already paid by this very transaction. Nothing to do.
    AlreadyPaid,
    /// Lapsed hold under the `resurrect` policy: re-claim the same numbers
    /// if none of them has been handed out again.
    Resurrect,
    /// Leave everything as is and flag for an operator.
    Reconcile { kind: FlagKind, reason: String },
}

/// Decide how to confirm a payment for `reservation`.
pub fn decide_confirmation(
    reservation: &Reservation,
    raffle: &Raffle,
    transaction_ref: Uuid,
    now: DateTime<Utc>,
    policy: LatePaymentPolicy,
) -> ConfirmDecision {
    match reservation.state {
        ReservationState::Paid if reservation.transaction_ref == Some(transaction_ref) => {
            ConfirmDecision::AlreadyPaid
        }
        ReservationState::Paid => ConfirmDecision::Reconcile {
            kind: FlagKind::PaymentConflict,
            reason: format!(
                "reservation already paid by transaction {}",
                reservation
                    .transaction_ref
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        },
        ReservationState::Released => ConfirmDecision::Reconcile {
            kind: FlagKind::PaymentConflict,
            reason: "payment received for a released reservation".to_string(),
        },
        _ if raffle.status == RaffleStatus::Cancelled => ConfirmDecision::Reconcile {
            kind: FlagKind::PaymentConflict,
            reason: "payment received for a cancelled raffle".to_string(),
        },
        ReservationState::Reserved if !reservation.is_stale(now) => ConfirmDecision::MarkPaid,
        ReservationState::Reserved | ReservationState::Expired => match policy {
            LatePaymentPolicy::Resurrect => ConfirmDecision::Resurrect,
            LatePaymentPolicy::Reconcile => ConfirmDecision::Reconcile {
                kind: FlagKind::LatePayment,
                reason: "payment arrived after the reservation expired".to_string(),
            },
        },
    }
}

/// Once a winner exists the ticket set is frozen; new sales go to an operator.
pub fn freeze_after_draw(decision: ConfirmDecision) -> ConfirmDecision {
    match decision {
        ConfirmDecision::MarkPaid | ConfirmDecision::Resurrect => ConfirmDecision::Reconcile {
            kind: FlagKind::PaymentConflict,
            reason: "payment received after the raffle was drawn".to_string(),
        },
        other => other,
    }
}

/// First number of a lapsed reservation that another live reservation now holds.
///
/// `owner_of` returns the reservation currently claiming a number, if any.
pub fn resurrection_conflict<F>(reservation: &Reservation, owner_of: F) -> Option<i64>
where
    F: Fn(i64) -> Option<Uuid>,
{
    reservation
        .ticket_numbers
        .iter()
        .copied()
        .find(|number| owner_of(*number).is_some_and(|owner| owner != reservation.id))
}

/// Reason recorded when a resurrection finds its numbers taken.
pub fn reassigned_reason(number: i64) -> String {
    format!("payment arrived after expiry and number {} was sold again", number)
}

/// Mark `reservation` paid and credit its amount to `raffle`.
///
/// Returns `true` when this payment reached the funding goal.
pub fn apply_payment(
    reservation: &mut Reservation,
    raffle: &mut Raffle,
    transaction_ref: Uuid,
    now: DateTime<Utc>,
) -> bool {
    reservation.state = ReservationState::Paid;
    reservation.paid_at = Some(now);
    reservation.transaction_ref = Some(transaction_ref);
    reservation.updated_at = now;

    raffle.credit(reservation.amount_cents, now)
}

/// Build the flag recorded for a confirmation that needs an operator.
pub fn confirmation_flag(
    kind: FlagKind,
    reason: &str,
    reservation: &Reservation,
    transaction_ref: Uuid,
    now: DateTime<Utc>,
) -> ReconciliationFlag {
    ReconciliationFlag::new(kind, reason, now)
        .with_raffle(reservation.raffle_id)
        .with_reservation(reservation.id)
        .with_transaction(transaction_ref)
        .with_context(serde_json::json!({
            "reservationState": reservation.state.as_str(),
            "ticketNumbers": reservation.ticket_numbers,
            "expiresAt": reservation.expires_at,
        }))
}

/// Result of [`ReservationLedger::confirm_paid`](super::ReservationLedger::confirm_paid).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// The reservation moved from `reserved` to `paid`.
    Confirmed { reservation: Reservation, goal_reached: bool },
    /// Duplicate confirmation; the stored reservation is returned unchanged.
    AlreadyConfirmed(Reservation),
    /// A lapsed reservation was restored and paid.
    Resurrected { reservation: Reservation, goal_reached: bool },
    /// Nothing changed; an operator has to look at it.
    NeedsReconciliation { reservation: Reservation, flag: ReconciliationFlag },
}

impl ConfirmOutcome {
    pub fn reservation(&self) -> &Reservation {
        match self {
            ConfirmOutcome::Confirmed { reservation, .. }
            | ConfirmOutcome::Resurrected { reservation, .. }
            | ConfirmOutcome::NeedsReconciliation { reservation, .. } => reservation,
            ConfirmOutcome::AlreadyConfirmed(reservation) => reservation,
        }
    }

    /// Whether this confirmation pushed the raffle over its goal.
    pub fn goal_reached(&self) -> bool {
        match self {
            ConfirmOutcome::Confirmed { goal_reached, .. }
            | ConfirmOutcome::Resurrected { goal_reached, .. } => *goal_reached,
            _ => false,
        }
    }

    /// Whether this call changed state (as opposed to a replay or a flag).
    pub fn is_state_change(&self) -> bool {
        matches!(self, ConfirmOutcome::Confirmed { .. } | ConfirmOutcome::Resurrected { .. })
    }
}
