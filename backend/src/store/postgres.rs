//! # PostgreSQL Store
//!
//! A [`Store`] over the deadpool connection pool. Every ledger operation is
//! one database transaction:
//!
//! ```text
//! BEGIN
//!   SELECT … FROM raffles WHERE id = $1 FOR UPDATE   ← per-raffle serialization
//!   expire stale holds of this raffle (lazy expiry)
//!   read live claims → decide (ticket_pool) → write
//!   INSERT INTO reservation_tickets …                ← PK (raffle_id, number)
//! COMMIT
//! ```
//!
//! Winner resolution takes the same lock, so a refund or a late
//! confirmation never lands between reading the paid tickets and storing
//! the winner.
//!
//! The row lock keeps allocation linearizable per raffle; the claim table's
//! primary key is the last line of defence against a double allocation.

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::LatePaymentPolicy;
use crate::db::queries;
use crate::db::{
    Database, DatabaseError, FlagKind, LotteryDraw, PaymentStatus, PaymentTransaction, Raffle,
    RaffleStatus, ReconciliationFlag, Reservation, ReservationState, Ticket, WinnerRecord,
};
use crate::services::reservation_ledger::LedgerError;
use crate::services::draw_rules;
use crate::services::ticket_pool::{self, ConfirmDecision, ConfirmOutcome};
use crate::services::winner_engine::ResolutionError;

use super::{ReservationRequest, ReserveOutcome, Store};

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn transition_raffle(
        &self,
        raffle_id: Uuid,
        status: RaffleStatus,
        now: DateTime<Utc>,
    ) -> Result<Raffle, LedgerError> {
        let mut client = self.db.pool().get().await.map_err(DatabaseError::from)?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut raffle = queries::lock_raffle(&tx, raffle_id)
            .await?
            .ok_or(LedgerError::RaffleNotFound(raffle_id))?;
        raffle
            .transition(status, now)
            .map_err(LedgerError::InvalidTransition)?;
        queries::update_raffle(&tx, &raffle).await?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(raffle)
    }

    async fn reserve_numbers(&self, request: ReservationRequest) -> Result<ReserveOutcome, LedgerError> {
        let mut client = self.db.pool().get().await.map_err(DatabaseError::from)?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let raffle = queries::lock_raffle(&tx, request.raffle_id)
            .await?
            .ok_or(LedgerError::RaffleNotFound(request.raffle_id))?;

        if !raffle.accepts_purchases() {
            return Err(LedgerError::RaffleNotActive {
                raffle_id: raffle.id,
                status: raffle.status,
            });
        }

        let expired = queries::expire_stale_for_raffle(&tx, raffle.id, request.now).await?;
        let claimed = queries::claimed_numbers(&tx, raffle.id).await?;
        let numbers = ticket_pool::allocate_numbers(&claimed, request.quantity, raffle.total_tickets)?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            raffle_id: raffle.id,
            buyer_id: request.buyer_id,
            quantity: request.quantity,
            ticket_numbers: numbers,
            amount_cents: request.quantity.saturating_mul(raffle.ticket_price_cents),
            state: ReservationState::Reserved,
            created_at: request.now,
            expires_at: request.expires_at,
            paid_at: None,
            transaction_ref: None,
            updated_at: request.now,
        };

        queries::insert_reservation(&tx, &reservation).await?;
        queries::insert_claims(&tx, raffle.id, reservation.id, &reservation.ticket_numbers).await?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(ReserveOutcome { reservation, expired })
    }

    async fn expire_all(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, DatabaseError> {
        let raffle_ids = queries::raffles_with_stale_reservations(self.db.pool(), now).await?;

        let mut expired = Vec::new();
        for raffle_id in raffle_ids {
            let mut client = self.db.pool().get().await?;
            let tx = client.transaction().await?;

            if queries::lock_raffle(&tx, raffle_id).await?.is_none() {
                continue;
            }
            expired.extend(queries::expire_stale_for_raffle(&tx, raffle_id, now).await?);

            tx.commit().await?;
        }
        Ok(expired)
    }

    /// Raffle of a reservation, so the right row can be locked.
    async fn raffle_of(&self, reservation_id: Uuid) -> Result<Uuid, LedgerError> {
        queries::reservation_raffle(self.db.pool(), reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))
    }

    async fn confirm(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
        policy: LatePaymentPolicy,
    ) -> Result<ConfirmOutcome, LedgerError> {
        let raffle_id = self.raffle_of(reservation_id).await?;

        let mut client = self.db.pool().get().await.map_err(DatabaseError::from)?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut raffle = queries::lock_raffle(&tx, raffle_id)
            .await?
            .ok_or(LedgerError::RaffleNotFound(raffle_id))?;
        let mut reservation = queries::fetch_reservation(&tx, reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;

        let mut decision =
            ticket_pool::decide_confirmation(&reservation, &raffle, transaction_ref, now, policy);
        if queries::winner_exists(&tx, raffle_id).await? {
            decision = ticket_pool::freeze_after_draw(decision);
        }

        if decision == ConfirmDecision::Resurrect {
            let owners = queries::claim_owners(&tx, raffle_id, &reservation.ticket_numbers).await?;
            if let Some(number) =
                ticket_pool::resurrection_conflict(&reservation, |n| owners.get(&n).copied())
            {
                decision = ConfirmDecision::Reconcile {
                    kind: FlagKind::LatePayment,
                    reason: ticket_pool::reassigned_reason(number),
                };
            }
        }

        let outcome = match decision {
            ConfirmDecision::AlreadyPaid => ConfirmOutcome::AlreadyConfirmed(reservation),
            ConfirmDecision::MarkPaid | ConfirmDecision::Resurrect => {
                let resurrected = decision == ConfirmDecision::Resurrect;
                let goal_reached =
                    ticket_pool::apply_payment(&mut reservation, &mut raffle, transaction_ref, now);

                if resurrected {
                    // A stale but unswept hold still owns its claims.
                    queries::free_claims(&tx, reservation.id).await?;
                    queries::insert_claims(&tx, raffle_id, reservation.id, &reservation.ticket_numbers).await?;
                }
                queries::update_reservation(&tx, &reservation).await?;
                queries::update_raffle(&tx, &raffle).await?;

                if resurrected {
                    info!("Resurrected lapsed reservation {}", reservation.id);
                    ConfirmOutcome::Resurrected { reservation, goal_reached }
                } else {
                    ConfirmOutcome::Confirmed { reservation, goal_reached }
                }
            }
            ConfirmDecision::Reconcile { kind, reason } => {
                let flag = ticket_pool::confirmation_flag(kind, &reason, &reservation, transaction_ref, now);
                queries::insert_flag(&tx, &flag).await?;
                ConfirmOutcome::NeedsReconciliation { reservation, flag }
            }
        };

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(outcome)
    }

    async fn release_reservation(&self, reservation_id: Uuid, now: DateTime<Utc>) -> Result<Reservation, LedgerError> {
        let raffle_id = self.raffle_of(reservation_id).await?;

        let mut client = self.db.pool().get().await.map_err(DatabaseError::from)?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        queries::lock_raffle(&tx, raffle_id)
            .await?
            .ok_or(LedgerError::RaffleNotFound(raffle_id))?;
        let mut reservation = queries::fetch_reservation(&tx, reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;

        if reservation.state != ReservationState::Reserved {
            return Err(LedgerError::InvalidState {
                reservation_id,
                state: reservation.state,
                action: "release",
            });
        }

        reservation.state = ReservationState::Released;
        reservation.updated_at = now;
        queries::free_claims(&tx, reservation_id).await?;
        queries::update_reservation(&tx, &reservation).await?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(reservation)
    }

    async fn revoke(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        let raffle_id = self.raffle_of(reservation_id).await?;

        let mut client = self.db.pool().get().await.map_err(DatabaseError::from)?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let mut raffle = queries::lock_raffle(&tx, raffle_id)
            .await?
            .ok_or(LedgerError::RaffleNotFound(raffle_id))?;
        let mut reservation = queries::fetch_reservation(&tx, reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;

        if queries::winner_exists(&tx, raffle_id).await? {
            return Err(LedgerError::AlreadyDrawn(raffle_id));
        }
        if reservation.state != ReservationState::Paid || reservation.transaction_ref != Some(transaction_ref) {
            return Err(LedgerError::InvalidState {
                reservation_id,
                state: reservation.state,
                action: "revoke",
            });
        }

        reservation.state = ReservationState::Released;
        reservation.updated_at = now;
        raffle.compensate_refund(reservation.amount_cents, now);

        queries::free_claims(&tx, reservation_id).await?;
        queries::update_reservation(&tx, &reservation).await?;
        queries::update_raffle(&tx, &raffle).await?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(reservation)
    }

    async fn decide_winner(
        &self,
        raffle_id: Uuid,
        draw: LotteryDraw,
        now: DateTime<Utc>,
    ) -> Result<(WinnerRecord, bool), ResolutionError> {
        let mut client = self.db.pool().get().await.map_err(DatabaseError::from)?;
        let tx = client.transaction().await.map_err(DatabaseError::from)?;

        let raffle = queries::lock_raffle(&tx, raffle_id)
            .await?
            .ok_or(ResolutionError::RaffleNotFound(raffle_id))?;
        if let Some(existing) = queries::fetch_winner(&tx, raffle_id).await? {
            return Ok((existing, false));
        }

        let tickets = queries::locked_paid_tickets(&tx, raffle_id).await?;
        let winner = draw_rules::decide(&raffle, &tickets, &draw, now)?;
        let stored = queries::insert_winner(&tx, &winner).await?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(stored)
    }

    async fn record_flag(&self, flag: ReconciliationFlag) -> Result<(), DatabaseError> {
        let mut client = self.db.pool().get().await?;
        let tx = client.transaction().await?;

        if let Err(e) = queries::insert_flag(&tx, &flag).await {
            error!("Failed to record {} flag: {} ({})", flag.kind, flag.detail, e);
            return Err(e);
        }

        tx.commit().await?;
        Ok(())
    }
}

impl Store for PgStore {
    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(self.db.ping())
    }

    fn upsert_raffle(&self, raffle: Raffle) -> BoxFuture<'_, Result<Raffle, DatabaseError>> {
        Box::pin(async move { queries::upsert_raffle(self.db.pool(), &raffle).await })
    }

    fn get_raffle(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Option<Raffle>, DatabaseError>> {
        Box::pin(queries::get_raffle(self.db.pool(), raffle_id))
    }

    fn set_raffle_status(
        &self,
        raffle_id: Uuid,
        status: RaffleStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Raffle, LedgerError>> {
        Box::pin(self.transition_raffle(raffle_id, status, now))
    }

    fn list_awaiting_draw(&self) -> BoxFuture<'_, Result<Vec<Raffle>, DatabaseError>> {
        Box::pin(queries::list_awaiting_draw(self.db.pool()))
    }

    fn reserve(&self, request: ReservationRequest) -> BoxFuture<'_, Result<ReserveOutcome, LedgerError>> {
        Box::pin(self.reserve_numbers(request))
    }

    fn expire_stale(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<Reservation>, DatabaseError>> {
        Box::pin(self.expire_all(now))
    }

    fn confirm_paid(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
        policy: LatePaymentPolicy,
    ) -> BoxFuture<'_, Result<ConfirmOutcome, LedgerError>> {
        Box::pin(self.confirm(reservation_id, transaction_ref, now, policy))
    }

    fn release(&self, reservation_id: Uuid, now: DateTime<Utc>) -> BoxFuture<'_, Result<Reservation, LedgerError>> {
        Box::pin(self.release_reservation(reservation_id, now))
    }

    fn revoke_paid(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Reservation, LedgerError>> {
        Box::pin(self.revoke(reservation_id, transaction_ref, now))
    }

    fn get_reservation(&self, reservation_id: Uuid) -> BoxFuture<'_, Result<Option<Reservation>, DatabaseError>> {
        Box::pin(queries::get_reservation(self.db.pool(), reservation_id))
    }

    fn list_paid_tickets(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Vec<Ticket>, DatabaseError>> {
        Box::pin(queries::list_paid_tickets(self.db.pool(), raffle_id))
    }

    fn insert_transaction(
        &self,
        transaction: PaymentTransaction,
    ) -> BoxFuture<'_, Result<PaymentTransaction, DatabaseError>> {
        Box::pin(async move { queries::insert_transaction(self.db.pool(), &transaction).await })
    }

    fn find_transaction<'a>(
        &'a self,
        provider: &'a str,
        provider_payment_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<PaymentTransaction>, DatabaseError>> {
        Box::pin(queries::find_transaction(self.db.pool(), provider, provider_payment_id))
    }

    fn transition_transaction(
        &self,
        transaction_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<PaymentTransaction>, DatabaseError>> {
        Box::pin(async move {
            queries::transition_transaction(self.db.pool(), transaction_id, from, to, payload.as_ref(), now).await
        })
    }

    fn link_transaction(
        &self,
        transaction_id: Uuid,
        reservation_id: Uuid,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<PaymentTransaction, DatabaseError>> {
        Box::pin(queries::link_transaction(self.db.pool(), transaction_id, reservation_id, amount_cents, now))
    }

    fn insert_draw(&self, draw: LotteryDraw) -> BoxFuture<'_, Result<LotteryDraw, DatabaseError>> {
        Box::pin(async move { queries::insert_draw(self.db.pool(), &draw).await })
    }

    fn get_draw(&self, contest_number: i64) -> BoxFuture<'_, Result<Option<LotteryDraw>, DatabaseError>> {
        Box::pin(queries::get_draw(self.db.pool(), contest_number))
    }

    fn first_draw_on_or_after(&self, date: NaiveDate) -> BoxFuture<'_, Result<Option<LotteryDraw>, DatabaseError>> {
        Box::pin(queries::first_draw_on_or_after(self.db.pool(), date))
    }

    fn resolve_winner(
        &self,
        raffle_id: Uuid,
        draw: LotteryDraw,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(WinnerRecord, bool), ResolutionError>> {
        Box::pin(self.decide_winner(raffle_id, draw, now))
    }

    fn get_winner(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Option<WinnerRecord>, DatabaseError>> {
        Box::pin(queries::get_winner(self.db.pool(), raffle_id))
    }

    fn insert_flag(&self, flag: ReconciliationFlag) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(self.record_flag(flag))
    }

    fn list_flags(&self, limit: i64) -> BoxFuture<'_, Result<Vec<ReconciliationFlag>, DatabaseError>> {
        Box::pin(queries::list_flags(self.db.pool(), limit))
    }
}
