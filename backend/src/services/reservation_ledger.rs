//! # Reservation Ledger Service
//!
//! The ReservationLedger hands out ticket numbers. It guarantees that a
//! number is never held by two live reservations of the same raffle and
//! that abandoned holds give their numbers back.
//!
//! ## Responsibilities
//!
//! - Reserve the lowest free numbers for a buyer
//! - Expire holds whose payment window lapsed
//! - Confirm payments (idempotently) and credit the raffle
//! - Release abandoned holds and revoke refunded purchases
//!
//! ## Reservation Lifecycle
//!
//! ```text
//!                 confirm_paid
//!   reserved ─────────────────────> paid ──(refund)──> released
//!      │  │                          ▲
//!      │  └──(ttl lapsed)──> expired ┘ (late payment, resurrect policy)
//!      │
//!      └──(release)──> released
//! ```
//!
//! ## Flow Example: Reserve
//!
//! ```text
//! 1. Buyer asks for N tickets via API
//!                ↓
//! 2. Ledger validates quantity
//!                ↓
//! 3. Store locks the raffle, expires its stale holds
//!                ↓
//! 4. Lowest free numbers are claimed
//!                ↓
//! 5. reservation_created is published
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{DatabaseError, Raffle, RaffleStatus, Reservation, ReservationState};
use crate::events::{DomainEvent, EventBus, GoalReachedEvent, PaymentConfirmedEvent, ReservationEvent};
use crate::store::{ReservationRequest, Store};
use crate::utils::Clock;

use super::ticket_pool::ConfirmOutcome;

/// Errors that can occur in ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Quantity outside `1..=max`.
    #[error("Invalid quantity {requested}: must be between 1 and {max}")]
    InvalidQuantity { requested: i64, max: i64 },

    /// Raffle definition rejected.
    #[error("Invalid raffle: {0}")]
    InvalidRaffle(String),

    #[error("Raffle not found: {0}")]
    RaffleNotFound(Uuid),

    /// The raffle is not selling tickets.
    #[error("Raffle {raffle_id} is not accepting purchases (status: {status})")]
    RaffleNotActive { raffle_id: Uuid, status: RaffleStatus },

    /// Bounded pool has fewer free numbers than requested.
    #[error("Insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: i64, available: i64 },

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    /// The reservation is in a state that does not allow `action`.
    #[error("Cannot {action} reservation {reservation_id} in state {state}")]
    InvalidState {
        reservation_id: Uuid,
        state: ReservationState,
        action: &'static str,
    },

    /// Raffle status change not in the transition table.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The raffle already has a winner; its ticket set is frozen.
    #[error("Raffle {0} has already been drawn")]
    AlreadyDrawn(Uuid),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Raffle fields accepted from the organizer platform.
#[derive(Debug, Clone)]
pub struct RaffleDraft {
    pub id: Option<Uuid>,
    pub title: String,
    pub goal_cents: i64,
    pub ticket_price_cents: i64,
    pub total_tickets: Option<i64>,
    pub status: RaffleStatus,
    pub draw_date: Option<chrono::NaiveDate>,
}

/// The ticket reservation ledger.
///
/// ## Usage
///
/// ```rust,ignore
/// let ledger = ReservationLedger::new(store, config, clock, events);
///
/// let reservation = ledger.reserve(raffle_id, "user-42", 3).await?;
/// let outcome = ledger.confirm_paid(reservation.id, transaction.id).await?;
/// ```
#[derive(Clone)]
pub struct ReservationLedger {
    store: Arc<dyn Store>,
    config: AppConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl ReservationLedger {
    /// Create a new ReservationLedger.
    ///
    /// ## Arguments
    ///
    /// * `store` - Persistence backend
    /// * `config` - Application configuration (TTL, quantity cap, late payment policy)
    /// * `clock` - Time source
    /// * `events` - Bus the ledger publishes to after each commit
    pub fn new(store: Arc<dyn Store>, config: AppConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self { store, config, clock, events }
    }

    // ==========================================
    // RAFFLES
    // ==========================================

    /// Create a raffle, or update title, goal, price and draw date of an existing one.
    pub async fn upsert_raffle(&self, draft: RaffleDraft) -> Result<Raffle, LedgerError> {
        if draft.title.trim().is_empty() {
            return Err(LedgerError::InvalidRaffle("title must not be empty".to_string()));
        }
        if draft.goal_cents <= 0 || draft.ticket_price_cents <= 0 {
            return Err(LedgerError::InvalidRaffle(
                "goal and ticket price must be positive".to_string(),
            ));
        }
        if draft.total_tickets.is_some_and(|total| total <= 0) {
            return Err(LedgerError::InvalidRaffle("total tickets must be positive".to_string()));
        }

        let now = self.clock.now();
        let raffle = Raffle {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            title: draft.title,
            goal_cents: draft.goal_cents,
            ticket_price_cents: draft.ticket_price_cents,
            amount_raised_cents: 0,
            total_tickets: draft.total_tickets,
            status: draft.status,
            draw_date: draft.draw_date,
            goal_reached_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.upsert_raffle(raffle).await?;
        info!("Raffle {} stored ({})", stored.id, stored.status);
        Ok(stored)
    }

    pub async fn get_raffle(&self, raffle_id: Uuid) -> Result<Raffle, LedgerError> {
        self.store
            .get_raffle(raffle_id)
            .await?
            .ok_or(LedgerError::RaffleNotFound(raffle_id))
    }

    /// Move a raffle through its lifecycle.
    pub async fn set_raffle_status(&self, raffle_id: Uuid, status: RaffleStatus) -> Result<Raffle, LedgerError> {
        let raffle = self.store.set_raffle_status(raffle_id, status, self.clock.now()).await?;
        info!("Raffle {} is now {}", raffle_id, raffle.status);
        Ok(raffle)
    }

    // ==========================================
    // RESERVATIONS
    // ==========================================

    /// Reserve `quantity` numbers of a raffle for a buyer.
    ///
    /// ## Arguments
    ///
    /// * `raffle_id` - The raffle to buy into
    /// * `buyer_id` - Opaque user id
    /// * `quantity` - Number of tickets, `1..=max_tickets_per_reservation`
    ///
    /// ## Returns
    ///
    /// * `Ok(Reservation)` - `reserved`, numbers sorted ascending
    /// * `Err(LedgerError)` - Validation, status or capacity failure; nothing was allocated
    pub async fn reserve(&self, raffle_id: Uuid, buyer_id: &str, quantity: i64) -> Result<Reservation, LedgerError> {
        let max = self.config.max_tickets_per_reservation;
        if quantity < 1 || quantity > max {
            return Err(LedgerError::InvalidQuantity { requested: quantity, max });
        }

        let now = self.clock.now();
        let outcome = self
            .store
            .reserve(ReservationRequest {
                raffle_id,
                buyer_id: buyer_id.to_string(),
                quantity,
                now,
                expires_at: now + self.config.reservation_ttl(),
            })
            .await?;

        for expired in &outcome.expired {
            self.events.publish(DomainEvent::ReservationExpired(ReservationEvent::from(expired)));
        }

        let reservation = outcome.reservation;
        info!(
            "Reserved {} ticket(s) {:?} in raffle {} for {} (reservation {})",
            reservation.quantity, reservation.ticket_numbers, raffle_id, buyer_id, reservation.id
        );
        self.events.publish(DomainEvent::ReservationCreated(ReservationEvent::from(&reservation)));

        Ok(reservation)
    }

    /// Expire every stale hold. Returns how many were expired.
    pub async fn expire_stale(&self) -> Result<usize, LedgerError> {
        let expired = self.store.expire_stale(self.clock.now()).await?;

        if !expired.is_empty() {
            info!("Expired {} stale reservation(s)", expired.len());
        }
        for reservation in &expired {
            self.events.publish(DomainEvent::ReservationExpired(ReservationEvent::from(reservation)));
        }

        Ok(expired.len())
    }

    /// Confirm that `transaction_ref` paid for a reservation.
    ///
    /// Safe to call any number of times with the same arguments; only the
    /// first call changes state or credits the raffle.
    pub async fn confirm_paid(&self, reservation_id: Uuid, transaction_ref: Uuid) -> Result<ConfirmOutcome, LedgerError> {
        let now = self.clock.now();
        let outcome = self
            .store
            .confirm_paid(reservation_id, transaction_ref, now, self.config.late_payment_policy)
            .await?;

        match &outcome {
            ConfirmOutcome::Confirmed { reservation, .. } | ConfirmOutcome::Resurrected { reservation, .. } => {
                info!(
                    "Reservation {} paid by transaction {} ({} centavos)",
                    reservation.id, transaction_ref, reservation.amount_cents
                );
                self.events.publish(DomainEvent::PaymentConfirmed(PaymentConfirmedEvent {
                    transaction_id: transaction_ref,
                    reservation_id: reservation.id,
                    raffle_id: reservation.raffle_id,
                    buyer_id: reservation.buyer_id.clone(),
                    ticket_numbers: reservation.ticket_numbers.clone(),
                    amount_cents: reservation.amount_cents,
                }));

                if outcome.goal_reached() {
                    info!("Raffle {} reached its goal and awaits the draw", reservation.raffle_id);
                    self.events.publish(DomainEvent::RaffleGoalReached(GoalReachedEvent {
                        raffle_id: reservation.raffle_id,
                        reached_at: now,
                    }));
                }
            }
            ConfirmOutcome::AlreadyConfirmed(_) => {
                debug!("Reservation {} already paid by {}", reservation_id, transaction_ref);
            }
            ConfirmOutcome::NeedsReconciliation { flag, .. } => {
                warn!(
                    "Payment {} for reservation {} needs reconciliation ({}): {}",
                    transaction_ref, reservation_id, flag.kind, flag.detail
                );
            }
        }

        Ok(outcome)
    }

    /// Give up a pending hold and return its numbers to the pool.
    pub async fn release(&self, reservation_id: Uuid) -> Result<Reservation, LedgerError> {
        let reservation = self.store.release(reservation_id, self.clock.now()).await?;

        info!("Reservation {} released by buyer", reservation_id);
        self.events.publish(DomainEvent::ReservationReleased(ReservationEvent::from(&reservation)));
        Ok(reservation)
    }

    /// Undo a paid reservation after its payment was refunded.
    ///
    /// The only operation that lowers a raffle's amount raised.
    pub async fn revoke_paid(&self, reservation_id: Uuid, transaction_ref: Uuid) -> Result<Reservation, LedgerError> {
        let reservation = self
            .store
            .revoke_paid(reservation_id, transaction_ref, self.clock.now())
            .await?;

        info!(
            "Reservation {} revoked after refund of {} ({} centavos returned)",
            reservation_id, transaction_ref, reservation.amount_cents
        );
        self.events.publish(DomainEvent::ReservationReleased(ReservationEvent::from(&reservation)));
        Ok(reservation)
    }

    /// Read a reservation. A lapsed hold reads as `expired` before the sweep runs.
    pub async fn get_reservation(&self, reservation_id: Uuid) -> Result<Reservation, LedgerError> {
        let mut reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;

        if reservation.is_stale(self.clock.now()) {
            reservation.state = ReservationState::Expired;
        }
        Ok(reservation)
    }
}
