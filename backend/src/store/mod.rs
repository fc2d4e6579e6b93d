//! # Store Module
//!
//! Persistence seam of the draw backend. Services talk to a [`Store`] and
//! never to PostgreSQL directly, so the same ledger, payment and resolution
//! code runs against the database in production and against process
//! memory in tests and local demos.
//!
//! ## Implementations
//!
//! | Store | Per-raffle atomicity | Used for |
//! |-------|----------------------|----------|
//! | [`PgStore`] | `SELECT … FOR UPDATE` on the raffle row + `reservation_tickets` primary key | Production |
//! | [`MemoryStore`] | One `tokio::sync::Mutex` per raffle cell | Tests, demos |
//!
//! ## Contract
//!
//! ```text
//! reserve / expire / confirm / release / revoke
//!     one atomic unit per raffle, raffles never block each other
//!
//! resolve_winner
//!     paid tickets read, winner chosen and stored in one atomic unit
//!     per raffle; an existing winner is returned unchanged
//!
//! insert_transaction, insert_draw
//!     insert-if-absent, always return the stored record
//!
//! transition_transaction
//!     compare-and-set on the previous status
//! ```
//!
//! What happens inside a critical section is decided by
//! [`ticket_pool`](crate::services::ticket_pool); a store only supplies
//! the locking and the persistence.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::config::LatePaymentPolicy;
use crate::db::{
    DatabaseError, LotteryDraw, PaymentStatus, PaymentTransaction, Raffle, RaffleStatus,
    ReconciliationFlag, Reservation, Ticket, WinnerRecord,
};
use crate::services::reservation_ledger::LedgerError;
use crate::services::ticket_pool::ConfirmOutcome;
use crate::services::winner_engine::ResolutionError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Input of [`Store::reserve`].
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub raffle_id: Uuid,
    pub buyer_id: String,
    pub quantity: i64,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of [`Store::reserve`].
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    /// The new hold.
    pub reservation: Reservation,
    /// Stale holds of the same raffle expired on the way in.
    pub expired: Vec<Reservation>,
}

/// Storage operations the services need.
///
/// Methods return boxed futures so the trait stays object safe and can be
/// shared as `Arc<dyn Store>`.
pub trait Store: Send + Sync {
    /// Check the backing storage is reachable.
    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>>;

    // ==========================================
    // RAFFLES
    // ==========================================

    /// Insert a raffle, or update the descriptive fields of an existing one.
    ///
    /// Status, amount raised and pool size of an existing raffle are left
    /// alone; they only change through the ledger.
    fn upsert_raffle(&self, raffle: Raffle) -> BoxFuture<'_, Result<Raffle, DatabaseError>>;

    fn get_raffle(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Option<Raffle>, DatabaseError>>;

    /// Apply a status transition under the raffle lock.
    fn set_raffle_status(
        &self,
        raffle_id: Uuid,
        status: RaffleStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Raffle, LedgerError>>;

    /// `completed` raffles that have no winner yet.
    fn list_awaiting_draw(&self) -> BoxFuture<'_, Result<Vec<Raffle>, DatabaseError>>;

    // ==========================================
    // RESERVATIONS
    // ==========================================

    /// Expire the raffle's stale holds, then allocate the lowest free numbers.
    fn reserve(&self, request: ReservationRequest) -> BoxFuture<'_, Result<ReserveOutcome, LedgerError>>;

    /// Expire every stale hold, raffle by raffle.
    fn expire_stale(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<Reservation>, DatabaseError>>;

    /// Confirm a payment. Any reconciliation flag is stored in the same unit.
    fn confirm_paid(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
        policy: LatePaymentPolicy,
    ) -> BoxFuture<'_, Result<ConfirmOutcome, LedgerError>>;

    /// `reserved → released`.
    fn release(&self, reservation_id: Uuid, now: DateTime<Utc>) -> BoxFuture<'_, Result<Reservation, LedgerError>>;

    /// `paid → released` for a refund of `transaction_ref`, debiting the raffle.
    fn revoke_paid(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Reservation, LedgerError>>;

    fn get_reservation(&self, reservation_id: Uuid) -> BoxFuture<'_, Result<Option<Reservation>, DatabaseError>>;

    /// Every number sold by a `paid` reservation, ordered by number.
    ///
    /// A snapshot; resolution reads the paid set under the raffle lock
    /// through [`Store::resolve_winner`].
    fn list_paid_tickets(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Vec<Ticket>, DatabaseError>>;

    // ==========================================
    // PAYMENT TRANSACTIONS
    // ==========================================

    /// Insert unless `(provider, provider_payment_id)` exists; returns the stored record.
    fn insert_transaction(
        &self,
        transaction: PaymentTransaction,
    ) -> BoxFuture<'_, Result<PaymentTransaction, DatabaseError>>;

    fn find_transaction<'a>(
        &'a self,
        provider: &'a str,
        provider_payment_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<PaymentTransaction>, DatabaseError>>;

    /// Move `from → to` only if the record is still in `from`.
    ///
    /// Returns `None` when another writer got there first.
    fn transition_transaction(
        &self,
        transaction_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<PaymentTransaction>, DatabaseError>>;

    /// Attach a provisional record to its reservation. A record that is
    /// already linked keeps its link; the stored record is returned either way.
    fn link_transaction(
        &self,
        transaction_id: Uuid,
        reservation_id: Uuid,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<PaymentTransaction, DatabaseError>>;

    // ==========================================
    // DRAWS & WINNERS
    // ==========================================

    /// Insert unless the contest exists; returns the stored draw.
    fn insert_draw(&self, draw: LotteryDraw) -> BoxFuture<'_, Result<LotteryDraw, DatabaseError>>;

    fn get_draw(&self, contest_number: i64) -> BoxFuture<'_, Result<Option<LotteryDraw>, DatabaseError>>;

    /// Earliest draw dated on or after `date`.
    fn first_draw_on_or_after(&self, date: NaiveDate) -> BoxFuture<'_, Result<Option<LotteryDraw>, DatabaseError>>;

    /// Decide the raffle from `draw` under the raffle lock.
    ///
    /// Refunds and confirmations of the same raffle wait for this unit, so
    /// the stored winner always comes from the paid set at decision time.
    /// Returns the stored record and whether this call inserted it.
    fn resolve_winner(
        &self,
        raffle_id: Uuid,
        draw: LotteryDraw,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(WinnerRecord, bool), ResolutionError>>;

    fn get_winner(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Option<WinnerRecord>, DatabaseError>>;

    // ==========================================
    // RECONCILIATION
    // ==========================================

    /// Record a flag once per (kind, raffle, reservation, transaction).
    fn insert_flag(&self, flag: ReconciliationFlag) -> BoxFuture<'_, Result<(), DatabaseError>>;

    /// Newest first.
    fn list_flags(&self, limit: i64) -> BoxFuture<'_, Result<Vec<ReconciliationFlag>, DatabaseError>>;
}

/// Whether two flags describe the same case.
pub(crate) fn same_case(a: &ReconciliationFlag, b: &ReconciliationFlag) -> bool {
    a.kind == b.kind
        && a.raffle_id == b.raffle_id
        && a.reservation_id == b.reservation_id
        && a.transaction_id == b.transaction_id
}
