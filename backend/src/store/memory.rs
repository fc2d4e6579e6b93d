//! # In-Memory Store
//!
//! A [`Store`] backed by process memory. Each raffle lives in its own
//! cell behind a `tokio::sync::Mutex`; the map of cells is only
//! read-locked to find a cell, so allocation on one raffle never waits
//! for another.
//!
//! ```text
//! raffles: RwLock<HashMap<raffle_id, Arc<Mutex<RaffleCell>>>>
//!                                          │
//!                    ┌─────────────────────┼──────────────────────┐
//!                    ▼                     ▼                      ▼
//!              reservations          claims (number →       winner (at
//!              by id                 reservation id)        most one)
//! ```
//!
//! Lock order: a raffle cell may be held while taking the reservation
//! index or the flag list, never the other way round.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LatePaymentPolicy;
use crate::db::{
    DatabaseError, LotteryDraw, PaymentStatus, PaymentTransaction, Raffle, RaffleStatus,
    ReconciliationFlag, Reservation, ReservationState, Ticket, WinnerRecord,
};
use crate::services::reservation_ledger::LedgerError;
use crate::services::draw_rules;
use crate::services::ticket_pool::{self, ConfirmDecision, ConfirmOutcome};
use crate::services::winner_engine::ResolutionError;

use super::{same_case, ReservationRequest, ReserveOutcome, Store};

/// Everything that belongs to one raffle.
struct RaffleCell {
    raffle: Raffle,
    reservations: HashMap<Uuid, Reservation>,
    /// Live claims: number → reservation id.
    claims: BTreeMap<i64, Uuid>,
    winner: Option<WinnerRecord>,
}

impl RaffleCell {
    fn new(raffle: Raffle) -> Self {
        Self {
            raffle,
            reservations: HashMap::new(),
            claims: BTreeMap::new(),
            winner: None,
        }
    }

    fn claimed_numbers(&self) -> BTreeSet<i64> {
        self.claims.keys().copied().collect()
    }

    fn claim(&mut self, reservation: &Reservation) {
        for number in &reservation.ticket_numbers {
            self.claims.insert(*number, reservation.id);
        }
    }

    fn free_claims(&mut self, reservation: &Reservation) {
        for number in &reservation.ticket_numbers {
            if self.claims.get(number) == Some(&reservation.id) {
                self.claims.remove(number);
            }
        }
    }

    fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<Reservation> {
        let stale: Vec<Uuid> = self
            .reservations
            .values()
            .filter(|r| r.is_stale(now))
            .map(|r| r.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            let snapshot = match self.reservations.get_mut(&id) {
                Some(reservation) => {
                    reservation.state = ReservationState::Expired;
                    reservation.updated_at = now;
                    reservation.clone()
                }
                None => continue,
            };
            self.free_claims(&snapshot);
            expired.push(snapshot);
        }

        expired.sort_by_key(|r| r.created_at);
        expired
    }

    fn reservation(&self, reservation_id: Uuid) -> Result<Reservation, LedgerError> {
        self.reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(LedgerError::ReservationNotFound(reservation_id))
    }

    fn paid_tickets(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Paid)
            .flat_map(|r| {
                let purchased_at = r.paid_at.unwrap_or(r.updated_at);
                r.ticket_numbers.iter().map(move |number| Ticket {
                    number: *number,
                    reservation_id: r.id,
                    buyer_id: r.buyer_id.clone(),
                    purchased_at,
                })
            })
            .collect();
        tickets.sort_by_key(|t| (t.number, t.purchased_at));
        tickets
    }
}

#[derive(Default)]
struct PaymentBook {
    by_id: HashMap<Uuid, PaymentTransaction>,
    by_key: HashMap<(String, String), Uuid>,
}

/// Process-memory [`Store`]. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    raffles: RwLock<HashMap<Uuid, Arc<Mutex<RaffleCell>>>>,
    /// Reservation id → raffle id.
    reservation_index: RwLock<HashMap<Uuid, Uuid>>,
    payments: Mutex<PaymentBook>,
    draws: Mutex<BTreeMap<i64, LotteryDraw>>,
    flags: Mutex<Vec<ReconciliationFlag>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, raffle_id: Uuid) -> Option<Arc<Mutex<RaffleCell>>> {
        self.raffles.read().await.get(&raffle_id).cloned()
    }

    async fn cell_of_reservation(&self, reservation_id: Uuid) -> Result<Arc<Mutex<RaffleCell>>, LedgerError> {
        let raffle_id = self
            .reservation_index
            .read()
            .await
            .get(&reservation_id)
            .copied()
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;

        self.cell(raffle_id)
            .await
            .ok_or(LedgerError::RaffleNotFound(raffle_id))
    }

    /// Store a paid reservation without claiming its numbers.
    ///
    /// Only tests need to build a ledger that breaks the allocation rules.
    #[cfg(test)]
    pub(crate) async fn insert_unclaimed_paid(&self, reservation: Reservation) {
        if let Some(cell) = self.cell(reservation.raffle_id).await {
            self.reservation_index
                .write()
                .await
                .insert(reservation.id, reservation.raffle_id);
            cell.lock().await.reservations.insert(reservation.id, reservation);
        }
    }

    async fn push_flag(&self, flag: ReconciliationFlag) {
        let mut flags = self.flags.lock().await;
        if flags.iter().any(|existing| same_case(existing, &flag)) {
            debug!("Flag {} already recorded for this case", flag.kind);
            return;
        }
        flags.push(flag);
    }

    // ==========================================
    // RAFFLES
    // ==========================================

    async fn upsert_raffle_record(&self, raffle: Raffle) -> Result<Raffle, DatabaseError> {
        let existing = self.cell(raffle.id).await;
        if let Some(cell) = existing {
            let mut cell = cell.lock().await;
            cell.raffle.title = raffle.title;
            cell.raffle.goal_cents = raffle.goal_cents;
            cell.raffle.ticket_price_cents = raffle.ticket_price_cents;
            cell.raffle.draw_date = raffle.draw_date;
            cell.raffle.updated_at = raffle.updated_at;
            return Ok(cell.raffle.clone());
        }

        let mut raffles = self.raffles.write().await;
        let cell = raffles
            .entry(raffle.id)
            .or_insert_with(|| Arc::new(Mutex::new(RaffleCell::new(raffle.clone()))))
            .clone();
        drop(raffles);

        let stored = cell.lock().await.raffle.clone();
        Ok(stored)
    }

    async fn raffle_snapshot(&self, raffle_id: Uuid) -> Option<Raffle> {
        let cell = self.cell(raffle_id).await?;
        let raffle = cell.lock().await.raffle.clone();
        Some(raffle)
    }

    async fn transition_raffle(
        &self,
        raffle_id: Uuid,
        status: RaffleStatus,
        now: DateTime<Utc>,
    ) -> Result<Raffle, LedgerError> {
        let cell = self
            .cell(raffle_id)
            .await
            .ok_or(LedgerError::RaffleNotFound(raffle_id))?;
        let mut cell = cell.lock().await;

        cell.raffle
            .transition(status, now)
            .map_err(LedgerError::InvalidTransition)?;
        Ok(cell.raffle.clone())
    }

    async fn raffles_awaiting_draw(&self) -> Vec<Raffle> {
        let cells: Vec<_> = self.raffles.read().await.values().cloned().collect();

        let mut awaiting = Vec::new();
        for cell in cells {
            let cell = cell.lock().await;
            if cell.raffle.status == RaffleStatus::Completed && cell.winner.is_none() {
                awaiting.push(cell.raffle.clone());
            }
        }
        awaiting.sort_by_key(|r| r.goal_reached_at);
        awaiting
    }

    // ==========================================
    // RESERVATIONS
    // ==========================================

    async fn reserve_numbers(&self, request: ReservationRequest) -> Result<ReserveOutcome, LedgerError> {
        let cell = self
            .cell(request.raffle_id)
            .await
            .ok_or(LedgerError::RaffleNotFound(request.raffle_id))?;
        let mut cell = cell.lock().await;

        if !cell.raffle.accepts_purchases() {
            return Err(LedgerError::RaffleNotActive {
                raffle_id: request.raffle_id,
                status: cell.raffle.status,
            });
        }

        let expired = cell.expire_stale(request.now);
        let numbers = ticket_pool::allocate_numbers(
            &cell.claimed_numbers(),
            request.quantity,
            cell.raffle.total_tickets,
        )?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            raffle_id: request.raffle_id,
            buyer_id: request.buyer_id,
            quantity: request.quantity,
            ticket_numbers: numbers,
            amount_cents: request.quantity.saturating_mul(cell.raffle.ticket_price_cents),
            state: ReservationState::Reserved,
            created_at: request.now,
            expires_at: request.expires_at,
            paid_at: None,
            transaction_ref: None,
            updated_at: request.now,
        };

        cell.claim(&reservation);
        cell.reservations.insert(reservation.id, reservation.clone());
        self.reservation_index
            .write()
            .await
            .insert(reservation.id, reservation.raffle_id);

        Ok(ReserveOutcome { reservation, expired })
    }

    async fn expire_all(&self, now: DateTime<Utc>) -> Vec<Reservation> {
        let cells: Vec<_> = self.raffles.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for cell in cells {
            let mut cell = cell.lock().await;
            expired.extend(cell.expire_stale(now));
        }
        expired
    }

    async fn confirm(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
        policy: LatePaymentPolicy,
    ) -> Result<ConfirmOutcome, LedgerError> {
        let cell = self.cell_of_reservation(reservation_id).await?;
        let mut cell = cell.lock().await;
        let mut reservation = cell.reservation(reservation_id)?;

        let mut decision =
            ticket_pool::decide_confirmation(&reservation, &cell.raffle, transaction_ref, now, policy);
        if cell.winner.is_some() {
            decision = ticket_pool::freeze_after_draw(decision);
        }

        if decision == ConfirmDecision::Resurrect {
            if let Some(number) =
                ticket_pool::resurrection_conflict(&reservation, |n| cell.claims.get(&n).copied())
            {
                decision = ConfirmDecision::Reconcile {
                    kind: crate::db::FlagKind::LatePayment,
                    reason: ticket_pool::reassigned_reason(number),
                };
            }
        }

        match decision {
            ConfirmDecision::AlreadyPaid => Ok(ConfirmOutcome::AlreadyConfirmed(reservation)),
            ConfirmDecision::MarkPaid | ConfirmDecision::Resurrect => {
                let resurrected = decision == ConfirmDecision::Resurrect;
                let goal_reached =
                    ticket_pool::apply_payment(&mut reservation, &mut cell.raffle, transaction_ref, now);
                cell.claim(&reservation);
                cell.reservations.insert(reservation.id, reservation.clone());

                if resurrected {
                    info!("Resurrected lapsed reservation {}", reservation.id);
                    Ok(ConfirmOutcome::Resurrected { reservation, goal_reached })
                } else {
                    Ok(ConfirmOutcome::Confirmed { reservation, goal_reached })
                }
            }
            ConfirmDecision::Reconcile { kind, reason } => {
                let flag = ticket_pool::confirmation_flag(kind, &reason, &reservation, transaction_ref, now);
                self.push_flag(flag.clone()).await;
                Ok(ConfirmOutcome::NeedsReconciliation { reservation, flag })
            }
        }
    }

    async fn release_reservation(&self, reservation_id: Uuid, now: DateTime<Utc>) -> Result<Reservation, LedgerError> {
        let cell = self.cell_of_reservation(reservation_id).await?;
        let mut cell = cell.lock().await;
        let mut reservation = cell.reservation(reservation_id)?;

        if reservation.state != ReservationState::Reserved {
            return Err(LedgerError::InvalidState {
                reservation_id,
                state: reservation.state,
                action: "release",
            });
        }

        reservation.state = ReservationState::Released;
        reservation.updated_at = now;
        cell.free_claims(&reservation);
        cell.reservations.insert(reservation.id, reservation.clone());

        Ok(reservation)
    }

    async fn revoke(
        &self,
        reservation_id: Uuid,
        transaction_ref: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        let cell = self.cell_of_reservation(reservation_id).await?;
        let mut cell = cell.lock().await;
        let mut reservation = cell.reservation(reservation_id)?;

        if cell.winner.is_some() {
            return Err(LedgerError::AlreadyDrawn(reservation.raffle_id));
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
        cell.free_claims(&reservation);
        cell.raffle.compensate_refund(reservation.amount_cents, now);
        cell.reservations.insert(reservation.id, reservation.clone());

        Ok(reservation)
    }

    async fn reservation_snapshot(&self, reservation_id: Uuid) -> Option<Reservation> {
        let cell = self.cell_of_reservation(reservation_id).await.ok()?;
        let reservation = cell.lock().await.reservations.get(&reservation_id).cloned();
        reservation
    }

    async fn paid_tickets(&self, raffle_id: Uuid) -> Vec<Ticket> {
        match self.cell(raffle_id).await {
            Some(cell) => cell.lock().await.paid_tickets(),
            None => Vec::new(),
        }
    }

    // ==========================================
    // PAYMENT TRANSACTIONS
    // ==========================================

    async fn insert_transaction_record(&self, transaction: PaymentTransaction) -> PaymentTransaction {
        let mut book = self.payments.lock().await;
        let key = (transaction.provider.clone(), transaction.provider_payment_id.clone());

        if let Some(existing) = book.by_key.get(&key).and_then(|id| book.by_id.get(id)) {
            return existing.clone();
        }

        book.by_key.insert(key, transaction.id);
        book.by_id.insert(transaction.id, transaction.clone());
        transaction
    }

    async fn find_transaction_record(&self, provider: &str, provider_payment_id: &str) -> Option<PaymentTransaction> {
        let book = self.payments.lock().await;
        book.by_key
            .get(&(provider.to_string(), provider_payment_id.to_string()))
            .and_then(|id| book.by_id.get(id))
            .cloned()
    }

    async fn compare_and_set_status(
        &self,
        transaction_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Option<PaymentTransaction>, DatabaseError> {
        let mut book = self.payments.lock().await;
        let transaction = book
            .by_id
            .get_mut(&transaction_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("Transaction not found: {}", transaction_id)))?;

        if transaction.status != from {
            warn!(
                "Transaction {} moved to {} before {} → {} could apply",
                transaction_id, transaction.status, from, to
            );
            return Ok(None);
        }

        transaction.status = to;
        if payload.is_some() {
            transaction.raw_payload = payload;
        }
        if to == PaymentStatus::Paid {
            transaction.confirmed_at = Some(now);
        }
        transaction.updated_at = now;

        Ok(Some(transaction.clone()))
    }

    async fn link_transaction_record(
        &self,
        transaction_id: Uuid,
        reservation_id: Uuid,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction, DatabaseError> {
        let mut book = self.payments.lock().await;
        let transaction = book
            .by_id
            .get_mut(&transaction_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("Transaction not found: {}", transaction_id)))?;

        if transaction.reservation_id.is_none() {
            transaction.reservation_id = Some(reservation_id);
            transaction.amount_cents = transaction.amount_cents.or(Some(amount_cents));
            transaction.updated_at = now;
        }

        Ok(transaction.clone())
    }

    // ==========================================
    // DRAWS & WINNERS
    // ==========================================

    async fn insert_draw_record(&self, draw: LotteryDraw) -> LotteryDraw {
        let mut draws = self.draws.lock().await;
        draws.entry(draw.contest_number).or_insert(draw).clone()
    }

    async fn first_draw_from(&self, date: NaiveDate) -> Option<LotteryDraw> {
        let draws = self.draws.lock().await;
        draws
            .values()
            .filter(|d| d.draw_date >= date)
            .min_by_key(|d| (d.draw_date, d.contest_number))
            .cloned()
    }

    async fn decide_winner(
        &self,
        raffle_id: Uuid,
        draw: LotteryDraw,
        now: DateTime<Utc>,
    ) -> Result<(WinnerRecord, bool), ResolutionError> {
        let cell = self
            .cell(raffle_id)
            .await
            .ok_or(ResolutionError::RaffleNotFound(raffle_id))?;
        let mut cell = cell.lock().await;

        if let Some(existing) = &cell.winner {
            return Ok((existing.clone(), false));
        }

        let tickets = cell.paid_tickets();
        let winner = draw_rules::decide(&cell.raffle, &tickets, &draw, now)?;
        cell.winner = Some(winner.clone());
        Ok((winner, true))
    }

    async fn winner_of(&self, raffle_id: Uuid) -> Option<WinnerRecord> {
        let cell = self.cell(raffle_id).await?;
        let winner = cell.lock().await.winner.clone();
        winner
    }

    async fn recent_flags(&self, limit: i64) -> Vec<ReconciliationFlag> {
        let flags = self.flags.lock().await;
        flags
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect()
    }
}

impl Store for MemoryStore {
    fn ping(&self) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(async move { Ok(()) })
    }

    fn upsert_raffle(&self, raffle: Raffle) -> BoxFuture<'_, Result<Raffle, DatabaseError>> {
        Box::pin(self.upsert_raffle_record(raffle))
    }

    fn get_raffle(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Option<Raffle>, DatabaseError>> {
        Box::pin(async move { Ok(self.raffle_snapshot(raffle_id).await) })
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
        Box::pin(async move { Ok(self.raffles_awaiting_draw().await) })
    }

    fn reserve(&self, request: ReservationRequest) -> BoxFuture<'_, Result<ReserveOutcome, LedgerError>> {
        Box::pin(self.reserve_numbers(request))
    }

    fn expire_stale(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<Reservation>, DatabaseError>> {
        Box::pin(async move { Ok(self.expire_all(now).await) })
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
        Box::pin(async move { Ok(self.reservation_snapshot(reservation_id).await) })
    }

    fn list_paid_tickets(&self, raffle_id: Uuid) -> BoxFuture<'_, Result<Vec<Ticket>, DatabaseError>> {
        Box::pin(async move { Ok(self.paid_tickets(raffle_id).await) })
    }

    fn insert_transaction(
        &self,
        transaction: PaymentTransaction,
    ) -> BoxFuture<'_, Result<PaymentTransaction, DatabaseError>> {
        Box::pin(async move { Ok(self.insert_transaction_record(transaction).await) })
    }

    fn find_transaction<'a>(
        &'a self,
        provider: &'a str,
        provider_payment_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<PaymentTransaction>, DatabaseError>> {
        Box::pin(async move { Ok(self.find_transaction_record(provider, provider_payment_id).await) })
    }

    fn transition_transaction(
        &self,
        transaction_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<PaymentTransaction>, DatabaseError>> {
        Box::pin(self.compare_and_set_status(transaction_id, from, to, payload, now))
    }

    fn link_transaction(
        &self,
        transaction_id: Uuid,
        reservation_id: Uuid,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<PaymentTransaction, DatabaseError>> {
        Box::pin(self.link_transaction_record(transaction_id, reservation_id, amount_cents, now))
    }

    fn insert_draw(&self, draw: LotteryDraw) -> BoxFuture<'_, Result<LotteryDraw, DatabaseError>> {
        Box::pin(async move { Ok(self.insert_draw_record(draw).await) })
    }

    fn get_draw(&self, contest_number: i64) -> BoxFuture<'_, Result<Option<LotteryDraw>, DatabaseError>> {
        Box::pin(async move { Ok(self.draws.lock().await.get(&contest_number).cloned()) })
    }

    fn first_draw_on_or_after(&self, date: NaiveDate) -> BoxFuture<'_, Result<Option<LotteryDraw>, DatabaseError>> {
        Box::pin(async move { Ok(self.first_draw_from(date).await) })
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
        Box::pin(async move { Ok(self.winner_of(raffle_id).await) })
    }

    fn insert_flag(&self, flag: ReconciliationFlag) -> BoxFuture<'_, Result<(), DatabaseError>> {
        Box::pin(async move {
            self.push_flag(flag).await;
            Ok(())
        })
    }

    fn list_flags(&self, limit: i64) -> BoxFuture<'_, Result<Vec<ReconciliationFlag>, DatabaseError>> {
        Box::pin(async move { Ok(self.recent_flags(limit).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FlagKind;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 14, 0, 0).unwrap()
    }

    fn raffle(total_tickets: Option<i64>) -> Raffle {
        Raffle {
            id: Uuid::new_v4(),
            title: "Notebook gamer".to_string(),
            goal_cents: 100_000,
            ticket_price_cents: 1_000,
            amount_raised_cents: 0,
            total_tickets,
            status: RaffleStatus::Active,
            draw_date: None,
            goal_reached_at: None,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn request(raffle_id: Uuid, buyer: &str, quantity: i64, now: DateTime<Utc>) -> ReservationRequest {
        ReservationRequest {
            raffle_id,
            buyer_id: buyer.to_string(),
            quantity,
            now,
            expires_at: now + Duration::minutes(15),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overlap() {
        let store = Arc::new(MemoryStore::new());
        let raffle = store.upsert_raffle(raffle(Some(100))).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let raffle_id = raffle.id;
            handles.push(tokio::spawn(async move {
                store
                    .reserve(request(raffle_id, &format!("buyer-{}", i), 5, t0()))
                    .await
            }));
        }

        let mut all_numbers = BTreeSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            for number in outcome.reservation.ticket_numbers {
                assert!(all_numbers.insert(number), "number {} allocated twice", number);
            }
        }
        assert_eq!(all_numbers.len(), 100);
        assert_eq!(all_numbers.iter().copied().max(), Some(100));

        let err = store.reserve(request(raffle.id, "late", 1, t0())).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity { requested: 1, available: 0 }));
    }

    #[tokio::test]
    async fn test_reserve_expires_stale_holds_first() {
        let store = MemoryStore::new();
        let raffle = store.upsert_raffle(raffle(Some(3))).await.unwrap();

        let first = store.reserve(request(raffle.id, "a", 3, t0())).await.unwrap();
        assert_eq!(first.reservation.ticket_numbers, vec![1, 2, 3]);

        let later = t0() + Duration::minutes(16);
        let second = store.reserve(request(raffle.id, "b", 2, later)).await.unwrap();
        assert_eq!(second.reservation.ticket_numbers, vec![1, 2]);
        assert_eq!(second.expired.len(), 1);
        assert_eq!(second.expired[0].state, ReservationState::Expired);

        let stored = store.get_reservation(first.reservation.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ReservationState::Expired);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent_and_credits_once() {
        let store = MemoryStore::new();
        let raffle = store.upsert_raffle(raffle(Some(50))).await.unwrap();
        let held = store.reserve(request(raffle.id, "a", 4, t0())).await.unwrap().reservation;
        let tx = Uuid::new_v4();

        let first = store
            .confirm_paid(held.id, tx, t0(), LatePaymentPolicy::Resurrect)
            .await
            .unwrap();
        let second = store
            .confirm_paid(held.id, tx, t0() + Duration::seconds(5), LatePaymentPolicy::Resurrect)
            .await
            .unwrap();

        assert!(matches!(first, ConfirmOutcome::Confirmed { .. }));
        assert!(matches!(second, ConfirmOutcome::AlreadyConfirmed(_)));

        let stored = store.get_raffle(raffle.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_raised_cents, 4_000);
    }

    #[tokio::test]
    async fn test_late_payment_resurrects_only_free_numbers() {
        let store = MemoryStore::new();
        let raffle = store.upsert_raffle(raffle(Some(2))).await.unwrap();
        let lapsed = store.reserve(request(raffle.id, "a", 2, t0())).await.unwrap().reservation;

        // Number 1 goes to someone else after the hold lapses.
        let later = t0() + Duration::minutes(20);
        store.reserve(request(raffle.id, "b", 1, later)).await.unwrap();

        let outcome = store
            .confirm_paid(lapsed.id, Uuid::new_v4(), later, LatePaymentPolicy::Resurrect)
            .await
            .unwrap();
        match outcome {
            ConfirmOutcome::NeedsReconciliation { flag, .. } => assert_eq!(flag.kind, FlagKind::LatePayment),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.list_flags(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke_returns_numbers_and_debits_raffle() {
        let store = MemoryStore::new();
        let raffle = store.upsert_raffle(raffle(Some(10))).await.unwrap();
        let held = store.reserve(request(raffle.id, "a", 2, t0())).await.unwrap().reservation;
        let tx = Uuid::new_v4();
        store.confirm_paid(held.id, tx, t0(), LatePaymentPolicy::Resurrect).await.unwrap();

        let wrong = store.revoke_paid(held.id, Uuid::new_v4(), t0()).await.unwrap_err();
        assert!(matches!(wrong, LedgerError::InvalidState { action: "revoke", .. }));

        let revoked = store.revoke_paid(held.id, tx, t0()).await.unwrap();
        assert_eq!(revoked.state, ReservationState::Released);

        let stored = store.get_raffle(raffle.id).await.unwrap().unwrap();
        assert_eq!(stored.amount_raised_cents, 0);
        let again = store.reserve(request(raffle.id, "b", 2, t0())).await.unwrap();
        assert_eq!(again.reservation.ticket_numbers, vec![1, 2]);
    }

    fn draw_after(now: DateTime<Utc>, numbers: [u8; 5]) -> LotteryDraw {
        LotteryDraw {
            contest_number: 5_900,
            draw_date: now.date_naive() + Duration::days(1),
            numbers,
            ingested_at: now,
        }
    }

    /// A raffle of 10 numbers whose goal is met by one paid reservation of 2.
    async fn completed_raffle(store: &MemoryStore) -> (Raffle, Reservation, Uuid) {
        let raffle = store
            .upsert_raffle(Raffle { goal_cents: 2_000, ..raffle(Some(10)) })
            .await
            .unwrap();
        let held = store.reserve(request(raffle.id, "a", 2, t0())).await.unwrap().reservation;
        let tx = Uuid::new_v4();
        let outcome = store.confirm_paid(held.id, tx, t0(), LatePaymentPolicy::Resurrect).await.unwrap();
        assert!(outcome.goal_reached());
        (raffle, held, tx)
    }

    #[tokio::test]
    async fn test_insert_if_absent_records() {
        let store = MemoryStore::new();
        let (raffle, held, _) = completed_raffle(&store).await;

        let draw = draw_after(t0(), [0, 0, 0, 0, 1]);
        store.insert_draw(draw.clone()).await.unwrap();
        let other = LotteryDraw { numbers: [9, 9, 9, 9, 9], ..draw.clone() };
        assert_eq!(store.insert_draw(other.clone()).await.unwrap(), draw);

        let (winner, inserted) = store.resolve_winner(raffle.id, draw, t0()).await.unwrap();
        assert!(inserted);
        assert_eq!(winner.target_number, 2);
        assert_eq!(winner.ticket_number, 2);
        assert_eq!(winner.reservation_id, held.id);

        let (stored, inserted_again) = store.resolve_winner(raffle.id, other, t0()).await.unwrap();
        assert!(!inserted_again);
        assert_eq!(stored, winner);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refund_and_resolution_never_interleave() {
        for _ in 0..25 {
            let store = Arc::new(MemoryStore::new());
            let (raffle, held, tx) = completed_raffle(&store).await;
            let draw = draw_after(t0(), [0, 0, 0, 0, 1]);

            let refund = {
                let store = store.clone();
                tokio::spawn(async move { store.revoke_paid(held.id, tx, t0()).await })
            };
            let resolution = {
                let store = store.clone();
                tokio::spawn(async move { store.resolve_winner(raffle.id, draw, t0()).await })
            };
            let refund = refund.await.unwrap();
            let resolution = resolution.await.unwrap();

            let reservation = store.get_reservation(held.id).await.unwrap().unwrap();
            match (refund, resolution) {
                (Ok(_), Err(ResolutionError::NoPaidTickets(_))) => {
                    assert_eq!(reservation.state, ReservationState::Released);
                    assert!(store.get_winner(raffle.id).await.unwrap().is_none());
                }
                (Err(LedgerError::AlreadyDrawn(_)), Ok((winner, true))) => {
                    assert_eq!(reservation.state, ReservationState::Paid);
                    assert_eq!(winner.reservation_id, held.id);
                }
                (refund, resolution) => panic!("inconsistent: {:?} / {:?}", refund, resolution),
            }
        }
    }
}
