//! # Winner Engine Service
//!
//! Decides each completed raffle from a Federal Lottery result, exactly
//! once.
//!
//! ## Resolution Steps
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Existing     │──>│ Raffle is    │──>│ Draw is on/  │──>│ Paid tickets │
//! │ winner? done │   │ completed    │   │ after window │   │ consistent   │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                                                 │
//!        ┌────────────────────────────────────────────────────────┘
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ target =     │──>│ exact, else  │──>│ store under  │──> winner_determined
//! │ K mod P + 1  │   │ nearest above│   │ raffle lock  │    (first insert only)
//! └──────────────┘   │ else lowest  │   └──────────────┘
//!                    └──────────────┘
//! ```
//!
//! Integrity failures (no paid tickets, a number sold twice) never pick a
//! winner; they are logged at error level and recorded as reconciliation
//! flags.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{
    DatabaseError, FlagKind, LotteryDraw, Raffle, RaffleStatus, ReconciliationFlag, WinnerRecord,
};
use crate::events::{DomainEvent, EventBus};
use crate::store::Store;
use crate::utils::Clock;

use super::draw_rules::MAX_DRAW_NUMBER;

/// Errors that can occur during winner resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Raffle not found: {0}")]
    RaffleNotFound(Uuid),

    /// Only `completed` raffles are drawn.
    #[error("Raffle {raffle_id} is not awaiting a draw (status: {status})")]
    NotAwaitingDraw { raffle_id: Uuid, status: RaffleStatus },

    /// No ingested draw is dated inside the raffle's draw window yet.
    #[error("No qualifying draw yet for raffle {raffle_id} (draws from {earliest})")]
    DrawNotYetAvailable { raffle_id: Uuid, earliest: NaiveDate },

    #[error("Draw not found: contest {0}")]
    DrawNotFound(i64),

    /// Integrity violation: a completed raffle with nothing sold.
    #[error("Raffle {0} has no paid tickets")]
    NoPaidTickets(Uuid),

    /// Integrity violation: two paid reservations hold the same number.
    #[error("Number {number} of raffle {raffle_id} is held by two paid reservations")]
    DoubleAllocation { raffle_id: Uuid, number: i64 },

    #[error("Malformed draw: {0}")]
    MalformedDraw(String),

    /// A different result was already stored for this contest.
    #[error("Contest {0} was already ingested with different numbers")]
    DrawConflict(i64),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl ResolutionError {
    /// Broken invariants an operator has to repair.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            ResolutionError::NoPaidTickets(_) | ResolutionError::DoubleAllocation { .. }
        )
    }
}

/// Result of resolving a raffle.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// This call decided the raffle.
    Resolved(WinnerRecord),
    /// The raffle was decided before; the stored record is returned.
    AlreadyResolved(WinnerRecord),
}

impl Resolution {
    pub fn winner(&self) -> &WinnerRecord {
        match self {
            Resolution::Resolved(w) | Resolution::AlreadyResolved(w) => w,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

/// What a [`WinnerEngine::resolve_pending`] pass did.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub examined: usize,
    pub resolved: usize,
    pub waiting_for_draw: usize,
    pub failed: usize,
}

/// Winner resolution engine.
#[derive(Clone)]
pub struct WinnerEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl WinnerEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self { store, clock, events }
    }

    // ==========================================
    // DRAWS
    // ==========================================

    /// Store a Federal Lottery result.
    ///
    /// ## Arguments
    ///
    /// * `contest_number` - Positive contest number
    /// * `draw_date` - Date the lottery was drawn
    /// * `numbers` - The five published numbers, each `0..=99`, in order
    ///
    /// ## Returns
    ///
    /// The stored draw. Ingesting identical data again is a no-op;
    /// different data for a known contest is `DrawConflict`.
    pub async fn ingest_draw(
        &self,
        contest_number: i64,
        draw_date: NaiveDate,
        numbers: &[i64],
    ) -> Result<LotteryDraw, ResolutionError> {
        if contest_number <= 0 {
            return Err(ResolutionError::MalformedDraw(format!(
                "contest number must be positive, got {}",
                contest_number
            )));
        }
        let numbers: [i64; 5] = numbers.try_into().map_err(|_| {
            ResolutionError::MalformedDraw(format!("expected 5 numbers, got {}", numbers.len()))
        })?;

        let mut parsed = [0_u8; 5];
        for (slot, n) in parsed.iter_mut().zip(numbers) {
            *slot = u8::try_from(n)
                .ok()
                .filter(|n| *n <= MAX_DRAW_NUMBER)
                .ok_or_else(|| ResolutionError::MalformedDraw(format!("number {} outside 0..=99", n)))?;
        }

        let draw = LotteryDraw {
            contest_number,
            draw_date,
            numbers: parsed,
            ingested_at: self.clock.now(),
        };
        let stored = self.store.insert_draw(draw.clone()).await?;

        if !stored.same_result(&draw) {
            warn!(
                "Contest {} re-ingested with {:?} on {}, stored {:?} on {}",
                contest_number, draw.numbers, draw.draw_date, stored.numbers, stored.draw_date
            );
            return Err(ResolutionError::DrawConflict(contest_number));
        }

        if stored.ingested_at == draw.ingested_at {
            info!("Ingested contest {} ({}): {:?}", contest_number, draw_date, parsed);
        } else {
            debug!("Contest {} already ingested", contest_number);
        }
        Ok(stored)
    }

    pub async fn get_draw(&self, contest_number: i64) -> Result<LotteryDraw, ResolutionError> {
        self.store
            .get_draw(contest_number)
            .await?
            .ok_or(ResolutionError::DrawNotFound(contest_number))
    }

    // ==========================================
    // RESOLUTION
    // ==========================================

    /// Decide `raffle_id` from `draw`.
    ///
    /// Idempotent: once a winner exists every call returns it unchanged,
    /// whatever draw is passed. The paid tickets are read and the winner
    /// stored in one unit under the raffle lock.
    pub async fn resolve(&self, raffle_id: Uuid, draw: &LotteryDraw) -> Result<Resolution, ResolutionError> {
        if let Some(existing) = self.store.get_winner(raffle_id).await? {
            return Ok(Resolution::AlreadyResolved(existing));
        }

        let (winner, inserted) = match self.store.resolve_winner(raffle_id, draw.clone(), self.clock.now()).await {
            Ok(decided) => decided,
            Err(e) if e.is_integrity_violation() => return Err(self.integrity_violation(raffle_id, draw, e).await),
            Err(e) => return Err(e),
        };
        if !inserted {
            debug!("Raffle {} was resolved concurrently", raffle_id);
            return Ok(Resolution::AlreadyResolved(winner));
        }

        info!(
            "Raffle {} resolved by contest {}: target {} of {}, ticket {} ({}) for {}",
            raffle_id,
            winner.contest_number,
            winner.target_number,
            winner.pool_size,
            winner.ticket_number,
            winner.match_kind,
            winner.buyer_id
        );
        self.events.publish(DomainEvent::WinnerDetermined(winner.clone()));
        Ok(Resolution::Resolved(winner))
    }

    /// Resolve with a chosen contest, or the earliest qualifying ingested draw.
    pub async fn resolve_with_contest(
        &self,
        raffle_id: Uuid,
        contest_number: Option<i64>,
    ) -> Result<Resolution, ResolutionError> {
        if let Some(existing) = self.store.get_winner(raffle_id).await? {
            return Ok(Resolution::AlreadyResolved(existing));
        }

        let draw = match contest_number {
            Some(contest) => self.get_draw(contest).await?,
            None => {
                let raffle = self.awaiting_raffle(raffle_id).await?;
                let earliest = raffle.earliest_draw_date();
                self.store
                    .first_draw_on_or_after(earliest)
                    .await?
                    .ok_or(ResolutionError::DrawNotYetAvailable { raffle_id, earliest })?
            }
        };

        self.resolve(raffle_id, &draw).await
    }

    /// Try every completed raffle that has no winner yet.
    ///
    /// A failing raffle never stops the pass.
    pub async fn resolve_pending(&self) -> Result<PendingSummary, ResolutionError> {
        let raffles = self.store.list_awaiting_draw().await?;
        let mut summary = PendingSummary {
            examined: raffles.len(),
            ..PendingSummary::default()
        };

        for raffle in raffles {
            match self.resolve_with_contest(raffle.id, None).await {
                Ok(_) => summary.resolved += 1,
                Err(ResolutionError::DrawNotYetAvailable { earliest, .. }) => {
                    debug!("Raffle {} waits for a draw on or after {}", raffle.id, earliest);
                    summary.waiting_for_draw += 1;
                }
                Err(e) if e.is_integrity_violation() => summary.failed += 1,
                Err(e) => {
                    error!("Failed to resolve raffle {}: {}", raffle.id, e);
                    summary.failed += 1;
                }
            }
        }

        if summary.resolved > 0 || summary.failed > 0 {
            info!(
                "Resolution pass: {} examined, {} resolved, {} waiting, {} failed",
                summary.examined, summary.resolved, summary.waiting_for_draw, summary.failed
            );
        }
        Ok(summary)
    }

    /// The stored winner, `None` while the raffle is undecided.
    pub async fn get_winner(&self, raffle_id: Uuid) -> Result<Option<WinnerRecord>, ResolutionError> {
        if self.store.get_raffle(raffle_id).await?.is_none() {
            return Err(ResolutionError::RaffleNotFound(raffle_id));
        }
        Ok(self.store.get_winner(raffle_id).await?)
    }

    async fn awaiting_raffle(&self, raffle_id: Uuid) -> Result<Raffle, ResolutionError> {
        let raffle = self
            .store
            .get_raffle(raffle_id)
            .await?
            .ok_or(ResolutionError::RaffleNotFound(raffle_id))?;

        if raffle.status != RaffleStatus::Completed {
            return Err(ResolutionError::NotAwaitingDraw {
                raffle_id,
                status: raffle.status,
            });
        }
        Ok(raffle)
    }

    /// Log and flag a broken invariant, handing the error back.
    async fn integrity_violation(
        &self,
        raffle_id: Uuid,
        draw: &LotteryDraw,
        violation: ResolutionError,
    ) -> ResolutionError {
        error!(
            "Integrity violation resolving raffle {} with contest {}: {}",
            raffle_id, draw.contest_number, violation
        );

        let amount_raised = match self.store.get_raffle(raffle_id).await {
            Ok(raffle) => raffle.map(|r| r.amount_raised_cents),
            Err(e) => {
                error!("Failed to load raffle {} for its integrity flag: {}", raffle_id, e);
                None
            }
        };
        let flag = ReconciliationFlag::new(FlagKind::IntegrityViolation, violation.to_string(), self.clock.now())
            .with_raffle(raffle_id)
            .with_context(serde_json::json!({
                "contestNumber": draw.contest_number,
                "amountRaisedCents": amount_raised,
            }));

        if let Err(e) = self.store.insert_flag(flag).await {
            error!("Failed to record integrity flag for raffle {}: {}", raffle_id, e);
        }
        violation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{MatchKind, RaffleStatus};
    use crate::db::{Reservation, ReservationState};
    use crate::services::draw_rules::TARGET_RULE;
    use crate::services::reservation_ledger::{RaffleDraft, ReservationLedger};
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    struct Fixture {
        engine: WinnerEngine,
        ledger: ReservationLedger,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        events: EventBus,
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, day, hour, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, day).unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(at(5, 8)));
        let events = EventBus::new();
        let config = AppConfig {
            reservation_ttl_secs: 10_800,
            ..AppConfig::default()
        };
        let ledger = ReservationLedger::new(store.clone(), config, clock.clone(), events.clone());
        let engine = WinnerEngine::new(store.clone(), clock.clone(), events.clone());
        Fixture { engine, ledger, store, clock, events }
    }

    async fn raffle(f: &Fixture, goal_cents: i64, total_tickets: Option<i64>) -> Uuid {
        f.ledger
            .upsert_raffle(RaffleDraft {
                id: None,
                title: "Honda Biz".to_string(),
                goal_cents,
                ticket_price_cents: 1_000,
                total_tickets,
                status: RaffleStatus::Active,
                draw_date: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn buy(f: &Fixture, raffle_id: Uuid, buyer: &str, quantity: i64) -> Vec<i64> {
        let held = f.ledger.reserve(raffle_id, buyer, quantity).await.unwrap();
        f.ledger.confirm_paid(held.id, Uuid::new_v4()).await.unwrap();
        held.ticket_numbers
    }

    #[tokio::test]
    async fn test_exact_match_on_bounded_pool() {
        let f = fixture();
        let raffle_id = raffle(&f, 3_000, Some(10)).await;
        assert_eq!(buy(&f, raffle_id, "ana", 3).await, vec![1, 2, 3]);

        // K = 1, K mod 10 + 1 = 2
        let draw = f.engine.ingest_draw(6_001, date(6), &[0, 0, 0, 0, 1]).await.unwrap();
        let resolution = f.engine.resolve(raffle_id, &draw).await.unwrap();

        let winner = resolution.winner();
        assert!(resolution.is_new());
        assert_eq!(winner.target_number, 2);
        assert_eq!(winner.ticket_number, 2);
        assert_eq!(winner.match_kind, MatchKind::Exact);
        assert_eq!(winner.rule, TARGET_RULE);
    }

    #[tokio::test]
    async fn test_nearest_above_ignores_purchase_order() {
        let f = fixture();
        let raffle_id = raffle(&f, 2_000, Some(100)).await;

        let filler_a = f.ledger.reserve(raffle_id, "filler", 34).await.unwrap();
        let b = f.ledger.reserve(raffle_id, "bia", 1).await.unwrap();
        let filler_c = f.ledger.reserve(raffle_id, "filler", 4).await.unwrap();
        let d = f.ledger.reserve(raffle_id, "davi", 1).await.unwrap();
        assert_eq!((b.ticket_numbers[0], d.ticket_numbers[0]), (35, 40));
        f.ledger.release(filler_a.id).await.unwrap();
        f.ledger.release(filler_c.id).await.unwrap();

        f.clock.set(at(5, 9));
        f.ledger.confirm_paid(d.id, Uuid::new_v4()).await.unwrap();
        f.clock.set(at(5, 10));
        f.ledger.confirm_paid(b.id, Uuid::new_v4()).await.unwrap();

        // K mod 100 = 32, target 33
        let draw = f.engine.ingest_draw(6_002, date(6), &[0, 0, 0, 0, 32]).await.unwrap();
        let winner = f.engine.resolve(raffle_id, &draw).await.unwrap().winner().clone();

        assert_eq!(winner.target_number, 33);
        assert_eq!(winner.ticket_number, 35);
        assert_eq!(winner.buyer_id, "bia");
        assert_eq!(winner.match_kind, MatchKind::NearestAbove);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_and_announces_once() {
        let f = fixture();
        let raffle_id = raffle(&f, 5_000, None).await;
        buy(&f, raffle_id, "caio", 5).await;
        let mut rx = f.events.subscribe();

        let first_draw = f.engine.ingest_draw(6_003, date(6), &[10, 20, 30, 40, 50]).await.unwrap();
        let other_draw = f.engine.ingest_draw(6_004, date(9), &[1, 2, 3, 4, 5]).await.unwrap();

        let first = f.engine.resolve(raffle_id, &first_draw).await.unwrap();
        let second = f.engine.resolve(raffle_id, &other_draw).await.unwrap();
        let third = f.engine.resolve_with_contest(raffle_id, None).await.unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.winner(), second.winner());
        assert_eq!(first.winner(), third.winner());

        let announced = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, DomainEvent::WinnerDetermined(_)))
            .count();
        assert_eq!(announced, 1);
    }

    #[tokio::test]
    async fn test_draw_window_and_status_checks() {
        let f = fixture();
        let active = raffle(&f, 100_000, Some(50)).await;
        buy(&f, active, "duda", 1).await;

        let early = f.engine.ingest_draw(6_005, date(4), &[1, 1, 1, 1, 1]).await.unwrap();
        assert!(matches!(
            f.engine.resolve(active, &early).await,
            Err(ResolutionError::NotAwaitingDraw { status: RaffleStatus::Active, .. })
        ));

        let done = raffle(&f, 1_000, Some(50)).await;
        buy(&f, done, "edu", 1).await;
        assert!(matches!(
            f.engine.resolve(done, &early).await,
            Err(ResolutionError::DrawNotYetAvailable { earliest, .. }) if earliest == date(6)
        ));
        assert!(matches!(
            f.engine.resolve_with_contest(done, None).await,
            Err(ResolutionError::DrawNotYetAvailable { .. })
        ));
        assert!(matches!(
            f.engine.resolve_with_contest(done, Some(404)).await,
            Err(ResolutionError::DrawNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_completed_without_sales_is_flagged() {
        let f = fixture();
        let raffle_id = raffle(&f, 10_000, Some(20)).await;
        f.ledger.set_raffle_status(raffle_id, RaffleStatus::Completed).await.unwrap();
        f.engine.ingest_draw(6_006, date(6), &[9, 9, 9, 9, 9]).await.unwrap();

        let err = f.engine.resolve_with_contest(raffle_id, None).await.unwrap_err();
        assert!(err.is_integrity_violation());
        assert!(f.engine.get_winner(raffle_id).await.unwrap().is_none());

        // Retrying does not duplicate the flag.
        f.engine.resolve_with_contest(raffle_id, None).await.unwrap_err();
        let flags = f.store.list_flags(10).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::IntegrityViolation);
    }

    #[tokio::test]
    async fn test_result_published_before_sales_closed_never_decides() {
        let f = fixture();
        let raffle_id = raffle(&f, 2_000, Some(10)).await;

        // The day's result is already public when the last numbers sell.
        let same_day = f.engine.ingest_draw(6_007, date(5), &[0, 0, 0, 0, 1]).await.unwrap();
        f.clock.set(at(5, 23));
        buy(&f, raffle_id, "iara", 2).await;

        assert!(matches!(
            f.engine.resolve(raffle_id, &same_day).await,
            Err(ResolutionError::DrawNotYetAvailable { earliest, .. }) if earliest == date(6)
        ));
        assert!(matches!(
            f.engine.resolve_with_contest(raffle_id, None).await,
            Err(ResolutionError::DrawNotYetAvailable { .. })
        ));

        f.engine.ingest_draw(6_008, date(6), &[0, 0, 0, 0, 1]).await.unwrap();
        let resolution = f.engine.resolve_with_contest(raffle_id, None).await.unwrap();
        assert_eq!(resolution.winner().contest_number, 6_008);
    }

    #[tokio::test]
    async fn test_number_sold_twice_is_flagged_without_winner() {
        let f = fixture();
        let raffle_id = raffle(&f, 2_000, Some(10)).await;
        assert_eq!(buy(&f, raffle_id, "joao", 2).await, vec![1, 2]);

        let now = f.clock.now();
        f.store
            .insert_unclaimed_paid(Reservation {
                id: Uuid::new_v4(),
                raffle_id,
                buyer_id: "karla".to_string(),
                quantity: 1,
                ticket_numbers: vec![2],
                amount_cents: 1_000,
                state: ReservationState::Paid,
                created_at: now,
                expires_at: now,
                paid_at: Some(now),
                transaction_ref: Some(Uuid::new_v4()),
                updated_at: now,
            })
            .await;

        let draw = f.engine.ingest_draw(6_009, date(6), &[0, 0, 0, 0, 1]).await.unwrap();
        let err = f.engine.resolve(raffle_id, &draw).await.unwrap_err();
        assert!(matches!(err, ResolutionError::DoubleAllocation { number: 2, .. }));
        assert!(f.engine.get_winner(raffle_id).await.unwrap().is_none());

        let flags = f.store.list_flags(10).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::IntegrityViolation);
        assert_eq!(flags[0].raffle_id, Some(raffle_id));
    }

    #[tokio::test]
    async fn test_ingest_validation_and_immutability() {
        let f = fixture();

        for (contest, numbers) in [(0, vec![1, 2, 3, 4, 5]), (7, vec![1, 2, 3, 4]), (7, vec![1, 2, 3, 4, 100])] {
            assert!(matches!(
                f.engine.ingest_draw(contest, date(5), &numbers).await,
                Err(ResolutionError::MalformedDraw(_))
            ));
        }

        let stored = f.engine.ingest_draw(7, date(5), &[5, 4, 3, 2, 1]).await.unwrap();
        f.clock.advance(Duration::hours(1));
        let again = f.engine.ingest_draw(7, date(5), &[5, 4, 3, 2, 1]).await.unwrap();
        assert_eq!(stored, again);

        assert!(matches!(
            f.engine.ingest_draw(7, date(5), &[1, 2, 3, 4, 5]).await,
            Err(ResolutionError::DrawConflict(7))
        ));
    }

    #[tokio::test]
    async fn test_resolve_pending_pass() {
        let f = fixture();
        let ready = raffle(&f, 1_000, Some(10)).await;
        buy(&f, ready, "fabi", 1).await;
        let waiting = raffle(&f, 1_000, Some(10)).await;
        f.ledger
            .upsert_raffle(RaffleDraft {
                id: Some(waiting),
                title: "Honda Biz".to_string(),
                goal_cents: 1_000,
                ticket_price_cents: 1_000,
                total_tickets: Some(10),
                status: RaffleStatus::Active,
                draw_date: Some(date(20)),
            })
            .await
            .unwrap();
        buy(&f, waiting, "gil", 1).await;
        f.engine.ingest_draw(6_010, date(6), &[0, 0, 0, 0, 0]).await.unwrap();

        let summary = f.engine.resolve_pending().await.unwrap();
        assert_eq!(
            summary,
            PendingSummary { examined: 2, resolved: 1, waiting_for_draw: 1, failed: 0 }
        );
        assert!(f.engine.get_winner(ready).await.unwrap().is_some());
        assert!(f.engine.get_winner(waiting).await.unwrap().is_none());
    }
}
