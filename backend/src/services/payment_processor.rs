//! # Payment Processor Service
//!
//! Turns payment provider notifications into ledger effects. Each payment
//! record follows a small state machine:
//!
//! ```text
//!            ┌──────> paid ──────> refunded
//!  pending ──┤
//!            └──────> failed
//! ```
//!
//! ## Delivery Guarantees
//!
//! Providers deliver at least once, out of order, and sometimes before
//! checkout has told us about the charge. The processor therefore:
//!
//! - never drops an event for an unknown payment (a provisional record is
//!   created and linked later by [`PaymentProcessor::register_payment`])
//! - moves a record with compare-and-set on its previous status
//! - treats a repeated `paid` or `refunded` status as a no-op that still
//!   re-drives the ledger, so a crash between recording the status and
//!   confirming or revoking the reservation heals on the next delivery
//!
//! ## Flow Example: PIX Payment
//!
//! ```text
//! 1. Checkout issues a PIX charge → register_payment (pending)
//!                ↓
//! 2. Provider webhook: RECEIVED
//!                ↓
//! 3. pending → paid (compare-and-set)
//!                ↓
//! 4. ReservationLedger::confirm_paid
//!                ↓
//! 5. payment_confirmed published
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{DatabaseError, FlagKind, PaymentProvider, PaymentStatus, PaymentTransaction, ReconciliationFlag};
use crate::store::Store;
use crate::utils::Clock;

use super::reservation_ledger::{LedgerError, ReservationLedger};

/// Compare-and-set retries before giving up on a hot record.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Errors that can occur while processing payments.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Provider not recognised or not enabled.
    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    /// Event or request could not be understood.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Amount mismatch: expected {expected} centavos, received {received}")]
    AmountMismatch { expected: i64, received: i64 },

    /// The payment is already bound to something else.
    #[error("Payment conflict: {0}")]
    PaymentConflict(String),

    /// Other writers kept moving the record.
    #[error("Transaction {0} changed concurrently, retry the delivery")]
    Contention(Uuid),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// What a provider event did.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// The record changed status and its effect ran.
    Applied(PaymentTransaction),
    /// The record was already in the event's status.
    Duplicate(PaymentTransaction),
    /// The event asked for a transition the state machine forbids.
    Ignored {
        transaction: PaymentTransaction,
        reason: String,
    },
}

impl EventOutcome {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            EventOutcome::Applied(t) | EventOutcome::Duplicate(t) => t,
            EventOutcome::Ignored { transaction, .. } => transaction,
        }
    }

    /// `applied`, `duplicate` or `ignored`.
    pub fn label(&self) -> &'static str {
        match self {
            EventOutcome::Applied(_) => "applied",
            EventOutcome::Duplicate(_) => "duplicate",
            EventOutcome::Ignored { .. } => "ignored",
        }
    }
}

/// Applies provider payment events to the reservation ledger.
#[derive(Clone)]
pub struct PaymentProcessor {
    store: Arc<dyn Store>,
    ledger: ReservationLedger,
    config: AppConfig,
    clock: Arc<dyn Clock>,
}

impl PaymentProcessor {
    pub fn new(store: Arc<dyn Store>, ledger: ReservationLedger, config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, ledger, config, clock }
    }

    /// Resolve an enabled provider by name.
    fn provider(&self, name: &str) -> Result<PaymentProvider, PaymentError> {
        name.trim()
            .to_ascii_lowercase()
            .parse::<PaymentProvider>()
            .ok()
            .filter(|p| self.config.payment_providers.contains(p))
            .ok_or_else(|| PaymentError::UnknownProvider(name.to_string()))
    }

    // ==========================================
    // CHECKOUT
    // ==========================================

    /// Record the charge checkout just issued for a reservation.
    ///
    /// ## Arguments
    ///
    /// * `reservation_id` - The reservation being paid
    /// * `provider` - Provider name, e.g. `asaas`
    /// * `provider_payment_id` - The provider's id for the charge
    /// * `amount_cents` - Charged amount; must equal the reservation amount
    ///
    /// ## Returns
    ///
    /// The stored record. Registering the same charge again returns the
    /// existing record. A provisional record left by an early webhook is
    /// linked here, and if it was already paid the reservation is
    /// confirmed on the spot.
    pub async fn register_payment(
        &self,
        reservation_id: Uuid,
        provider: &str,
        provider_payment_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentTransaction, PaymentError> {
        let provider = self.provider(provider)?;
        let payment_id = provider_payment_id.trim();
        if payment_id.is_empty() {
            return Err(PaymentError::InvalidPayload("providerPaymentId must not be empty".to_string()));
        }

        let reservation = self.ledger.get_reservation(reservation_id).await?;
        if amount_cents != reservation.amount_cents {
            return Err(PaymentError::AmountMismatch {
                expected: reservation.amount_cents,
                received: amount_cents,
            });
        }

        let now = self.clock.now();
        let mut stored = self
            .store
            .insert_transaction(PaymentTransaction {
                id: Uuid::new_v4(),
                reservation_id: Some(reservation_id),
                provider: provider.as_str().to_string(),
                provider_payment_id: payment_id.to_string(),
                amount_cents: Some(amount_cents),
                status: PaymentStatus::Pending,
                raw_payload: None,
                created_at: now,
                updated_at: now,
                confirmed_at: None,
            })
            .await?;

        if stored.reservation_id.is_none() {
            info!(
                "Linking provisional {} payment {} to reservation {}",
                provider, payment_id, reservation_id
            );
            stored = self
                .store
                .link_transaction(stored.id, reservation_id, amount_cents, now)
                .await?;
        }

        if stored.reservation_id != Some(reservation_id) {
            return Err(PaymentError::PaymentConflict(format!(
                "{} payment {} already belongs to another reservation",
                provider, payment_id
            )));
        }
        if let Some(recorded) = stored.amount_cents.filter(|a| *a != amount_cents) {
            return Err(PaymentError::AmountMismatch {
                expected: recorded,
                received: amount_cents,
            });
        }

        if stored.status == PaymentStatus::Paid {
            self.ledger.confirm_paid(reservation_id, stored.id).await?;
        }

        debug!("Payment {} registered ({})", stored.id, stored.status);
        Ok(stored)
    }

    // ==========================================
    // PROVIDER EVENTS
    // ==========================================

    /// Apply one provider notification.
    ///
    /// ## Arguments
    ///
    /// * `provider` - Provider name from the webhook route
    /// * `provider_payment_id` - The provider's payment id
    /// * `event_status` - Status in the provider's own vocabulary
    /// * `raw_payload` - Full event body, stored for audit
    ///
    /// ## Returns
    ///
    /// * `Ok(EventOutcome)` - Applied, duplicate or ignored; all are acknowledged
    /// * `Err(PaymentError)` - Rejected input or a failure worth a redelivery
    pub async fn handle_provider_event(
        &self,
        provider: &str,
        provider_payment_id: &str,
        event_status: &str,
        raw_payload: &Value,
    ) -> Result<EventOutcome, PaymentError> {
        let provider = match self.provider(provider) {
            Ok(p) => p,
            Err(e) => {
                error!("Rejected event from unknown provider '{}': {}", provider, raw_payload);
                return Err(e);
            }
        };

        let payment_id = provider_payment_id.trim();
        if payment_id.is_empty() || !raw_payload.is_object() {
            error!("Rejected malformed {} event: {}", provider, raw_payload);
            return Err(PaymentError::InvalidPayload("missing payment id or non-object payload".to_string()));
        }

        let status = match provider.normalize_status(event_status) {
            Some(s) => s,
            None => {
                error!("Rejected {} event with unknown status '{}': {}", provider, event_status, raw_payload);
                return Err(PaymentError::InvalidPayload(format!("unrecognised status '{}'", event_status)));
            }
        };

        let mut transaction = self.load_or_create(provider, payment_id).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            if transaction.status == status {
                warn!(
                    "Duplicate {} event for payment {} ({})",
                    provider, payment_id, status
                );
                match status {
                    PaymentStatus::Paid | PaymentStatus::Refunded => self.apply_effect(&transaction).await?,
                    PaymentStatus::Pending | PaymentStatus::Failed => {}
                }
                return Ok(EventOutcome::Duplicate(transaction));
            }

            if !transaction.status.can_transition_to(status) {
                let reason = format!("cannot move payment from {} to {}", transaction.status, status);
                warn!("Ignoring {} event for payment {}: {}", provider, payment_id, reason);

                if status == PaymentStatus::Paid
                    && matches!(transaction.status, PaymentStatus::Failed | PaymentStatus::Refunded)
                {
                    self.flag(&transaction, format!("paid event received for a {} payment", transaction.status))
                        .await?;
                }
                return Ok(EventOutcome::Ignored { transaction, reason });
            }

            let now = self.clock.now();
            match self
                .store
                .transition_transaction(transaction.id, transaction.status, status, Some(raw_payload.clone()), now)
                .await?
            {
                Some(updated) => {
                    info!(
                        "Payment {} ({} {}) moved to {}",
                        updated.id, provider, payment_id, status
                    );
                    self.apply_effect(&updated).await?;
                    return Ok(EventOutcome::Applied(updated));
                }
                None => {
                    transaction = self
                        .store
                        .find_transaction(provider.as_str(), payment_id)
                        .await?
                        .ok_or_else(|| DatabaseError::NotFound(format!("{} payment {}", provider, payment_id)))?;
                }
            }
        }

        Err(PaymentError::Contention(transaction.id))
    }

    /// The stored record, or a new provisional one.
    async fn load_or_create(
        &self,
        provider: PaymentProvider,
        payment_id: &str,
    ) -> Result<PaymentTransaction, PaymentError> {
        if let Some(existing) = self.store.find_transaction(provider.as_str(), payment_id).await? {
            return Ok(existing);
        }

        info!(
            "No record for {} payment {}; creating a provisional one",
            provider, payment_id
        );
        let now = self.clock.now();
        let stored = self
            .store
            .insert_transaction(PaymentTransaction {
                id: Uuid::new_v4(),
                reservation_id: None,
                provider: provider.as_str().to_string(),
                provider_payment_id: payment_id.to_string(),
                amount_cents: None,
                status: PaymentStatus::Pending,
                raw_payload: None,
                created_at: now,
                updated_at: now,
                confirmed_at: None,
            })
            .await?;
        Ok(stored)
    }

    async fn apply_effect(&self, transaction: &PaymentTransaction) -> Result<(), PaymentError> {
        match transaction.status {
            PaymentStatus::Paid => self.on_paid(transaction).await,
            PaymentStatus::Refunded => self.on_refunded(transaction).await,
            PaymentStatus::Failed => {
                // The hold stays reserved until it expires; the buyer may retry.
                info!("Payment {} failed", transaction.id);
                Ok(())
            }
            PaymentStatus::Pending => Ok(()),
        }
    }

    async fn on_paid(&self, transaction: &PaymentTransaction) -> Result<(), PaymentError> {
        match transaction.reservation_id {
            Some(reservation_id) => {
                self.ledger.confirm_paid(reservation_id, transaction.id).await?;
            }
            None => info!(
                "Payment {} is paid but not yet registered; confirmation waits for checkout",
                transaction.id
            ),
        }
        Ok(())
    }

    async fn on_refunded(&self, transaction: &PaymentTransaction) -> Result<(), PaymentError> {
        let Some(reservation_id) = transaction.reservation_id else {
            return Ok(());
        };

        match self.ledger.revoke_paid(reservation_id, transaction.id).await {
            Ok(_) => Ok(()),
            Err(LedgerError::AlreadyDrawn(raffle_id)) => {
                warn!(
                    "Refund of payment {} arrived after raffle {} was drawn",
                    transaction.id, raffle_id
                );
                self.flag(transaction, "refund received after the raffle was drawn".to_string())
                    .await
            }
            Err(LedgerError::InvalidState { state, .. }) => {
                warn!(
                    "Refund of payment {} left reservation {} untouched ({})",
                    transaction.id, reservation_id, state
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn flag(&self, transaction: &PaymentTransaction, detail: String) -> Result<(), PaymentError> {
        let mut flag = ReconciliationFlag::new(FlagKind::PaymentConflict, detail, self.clock.now())
            .with_transaction(transaction.id)
            .with_context(serde_json::json!({
                "provider": transaction.provider,
                "providerPaymentId": transaction.provider_payment_id,
                "status": transaction.status.as_str(),
            }));

        if let Some(reservation_id) = transaction.reservation_id {
            flag = flag.with_reservation(reservation_id);
            if let Some(reservation) = self.store.get_reservation(reservation_id).await? {
                flag = flag.with_raffle(reservation.raffle_id);
            }
        }

        warn!("Flagged payment {}: {}", transaction.id, flag.detail);
        self.store.insert_flag(flag).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RaffleStatus, ReservationState};
    use crate::events::EventBus;
    use crate::services::reservation_ledger::RaffleDraft;
    use crate::services::WinnerEngine;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        processor: PaymentProcessor,
        ledger: ReservationLedger,
        engine: WinnerEngine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 8, 3, 14, 0, 0).unwrap()));
        let config = AppConfig {
            payment_providers: vec![PaymentProvider::Asaas, PaymentProvider::Manual],
            ..AppConfig::default()
        };
        let events = EventBus::new();
        let ledger = ReservationLedger::new(store.clone(), config.clone(), clock.clone(), events.clone());
        let engine = WinnerEngine::new(store.clone(), clock.clone(), events);
        let processor = PaymentProcessor::new(store.clone(), ledger.clone(), config, clock.clone());
        Fixture { processor, ledger, engine, store, clock }
    }

    async fn reserved(f: &Fixture, quantity: i64) -> (Uuid, Uuid) {
        let raffle = f
            .ledger
            .upsert_raffle(RaffleDraft {
                id: None,
                title: "iPhone 16".to_string(),
                goal_cents: 100_000,
                ticket_price_cents: 2_500,
                total_tickets: Some(1_000),
                status: RaffleStatus::Active,
                draw_date: None,
            })
            .await
            .unwrap();
        let reservation = f.ledger.reserve(raffle.id, "buyer-1", quantity).await.unwrap();
        (raffle.id, reservation.id)
    }

    /// A drawn raffle of 10 numbers: "buyer-1" paid 2 and won, "buyer-2"
    /// still holds one number taken before the goal was reached.
    async fn drawn(f: &Fixture) -> (Uuid, Uuid, Uuid) {
        let raffle = f
            .ledger
            .upsert_raffle(RaffleDraft {
                id: None,
                title: "PlayStation 5".to_string(),
                goal_cents: 5_000,
                ticket_price_cents: 2_500,
                total_tickets: Some(10),
                status: RaffleStatus::Active,
                draw_date: None,
            })
            .await
            .unwrap();
        let winning = f.ledger.reserve(raffle.id, "buyer-1", 2).await.unwrap();
        let straggler = f.ledger.reserve(raffle.id, "buyer-2", 1).await.unwrap();

        f.processor
            .register_payment(winning.id, "manual", "manual-w", 5_000)
            .await
            .unwrap();
        f.processor
            .handle_provider_event("manual", "manual-w", "paid", &json!({ "status": "paid" }))
            .await
            .unwrap();

        let next_day = NaiveDate::from_ymd_opt(2026, 8, 4).unwrap();
        f.engine.ingest_draw(6_300, next_day, &[0, 0, 0, 0, 1]).await.unwrap();
        let resolution = f.engine.resolve_with_contest(raffle.id, Some(6_300)).await.unwrap();
        assert_eq!(resolution.winner().reservation_id, winning.id);

        (raffle.id, winning.id, straggler.id)
    }

    fn body(id: &str, status: &str) -> Value {
        json!({ "event": "PAYMENT_RECEIVED", "payment": { "id": id, "status": status } })
    }

    #[tokio::test]
    async fn test_repeated_paid_event_confirms_once() {
        let f = fixture();
        let (raffle_id, reservation_id) = reserved(&f, 2).await;
        f.processor
            .register_payment(reservation_id, "asaas", "pay_001", 5_000)
            .await
            .unwrap();

        let first = f
            .processor
            .handle_provider_event("asaas", "pay_001", "RECEIVED", &body("pay_001", "RECEIVED"))
            .await
            .unwrap();
        assert!(matches!(first, EventOutcome::Applied(_)));

        for _ in 0..3 {
            let again = f
                .processor
                .handle_provider_event("asaas", "pay_001", "CONFIRMED", &body("pay_001", "CONFIRMED"))
                .await
                .unwrap();
            assert_eq!(again.label(), "duplicate");
        }

        let reservation = f.ledger.get_reservation(reservation_id).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Paid);
        assert_eq!(reservation.transaction_ref, Some(first.transaction().id));
        assert_eq!(f.ledger.get_raffle(raffle_id).await.unwrap().amount_raised_cents, 5_000);
    }

    #[tokio::test]
    async fn test_early_webhook_creates_provisional_record() {
        let f = fixture();
        let (_, reservation_id) = reserved(&f, 1).await;

        let outcome = f
            .processor
            .handle_provider_event("asaas", "pay_early", "RECEIVED", &body("pay_early", "RECEIVED"))
            .await
            .unwrap();
        assert_eq!(outcome.transaction().reservation_id, None);
        assert_eq!(outcome.transaction().status, PaymentStatus::Paid);

        let linked = f
            .processor
            .register_payment(reservation_id, "asaas", "pay_early", 2_500)
            .await
            .unwrap();
        assert_eq!(linked.id, outcome.transaction().id);
        assert_eq!(linked.reservation_id, Some(reservation_id));

        let reservation = f.ledger.get_reservation(reservation_id).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Paid);
    }

    #[tokio::test]
    async fn test_paid_after_failed_is_ignored_and_flagged() {
        let f = fixture();
        let (_, reservation_id) = reserved(&f, 1).await;
        f.processor
            .register_payment(reservation_id, "asaas", "pay_late", 2_500)
            .await
            .unwrap();

        f.processor
            .handle_provider_event("asaas", "pay_late", "OVERDUE", &body("pay_late", "OVERDUE"))
            .await
            .unwrap();
        let outcome = f
            .processor
            .handle_provider_event("asaas", "pay_late", "RECEIVED", &body("pay_late", "RECEIVED"))
            .await
            .unwrap();

        assert_eq!(outcome.label(), "ignored");
        assert_eq!(outcome.transaction().status, PaymentStatus::Failed);
        assert_eq!(
            f.ledger.get_reservation(reservation_id).await.unwrap().state,
            ReservationState::Reserved
        );

        let flags = f.store.list_flags(10).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::PaymentConflict);
    }

    #[tokio::test]
    async fn test_refund_revokes_tickets() {
        let f = fixture();
        let (raffle_id, reservation_id) = reserved(&f, 4).await;
        f.processor
            .register_payment(reservation_id, "manual", "manual-7", 10_000)
            .await
            .unwrap();

        f.processor
            .handle_provider_event("manual", "manual-7", "paid", &json!({ "status": "paid" }))
            .await
            .unwrap();
        assert_eq!(f.ledger.get_raffle(raffle_id).await.unwrap().amount_raised_cents, 10_000);

        let outcome = f
            .processor
            .handle_provider_event("manual", "manual-7", "refunded", &json!({ "status": "refunded" }))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Applied(_)));

        assert_eq!(
            f.ledger.get_reservation(reservation_id).await.unwrap().state,
            ReservationState::Released
        );
        assert_eq!(f.ledger.get_raffle(raffle_id).await.unwrap().amount_raised_cents, 0);
    }

    #[tokio::test]
    async fn test_refund_redelivery_completes_interrupted_revocation() {
        let f = fixture();
        let (raffle_id, reservation_id) = reserved(&f, 2).await;
        let registered = f
            .processor
            .register_payment(reservation_id, "asaas", "pay_r", 5_000)
            .await
            .unwrap();
        f.processor
            .handle_provider_event("asaas", "pay_r", "RECEIVED", &body("pay_r", "RECEIVED"))
            .await
            .unwrap();

        // The status moved but the process stopped before touching the reservation.
        f.store
            .transition_transaction(registered.id, PaymentStatus::Paid, PaymentStatus::Refunded, None, f.clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            f.ledger.get_reservation(reservation_id).await.unwrap().state,
            ReservationState::Paid
        );

        let outcome = f
            .processor
            .handle_provider_event("asaas", "pay_r", "REFUNDED", &body("pay_r", "REFUNDED"))
            .await
            .unwrap();
        assert_eq!(outcome.label(), "duplicate");
        assert_eq!(
            f.ledger.get_reservation(reservation_id).await.unwrap().state,
            ReservationState::Released
        );
        assert_eq!(f.ledger.get_raffle(raffle_id).await.unwrap().amount_raised_cents, 0);
    }

    #[tokio::test]
    async fn test_refund_after_draw_is_flagged_and_keeps_tickets() {
        let f = fixture();
        let (raffle_id, winning, _) = drawn(&f).await;

        for expected in ["applied", "duplicate"] {
            let outcome = f
                .processor
                .handle_provider_event("manual", "manual-w", "refunded", &json!({ "status": "refunded" }))
                .await
                .unwrap();
            assert_eq!(outcome.label(), expected);
            assert_eq!(outcome.transaction().status, PaymentStatus::Refunded);
        }

        let reservation = f.ledger.get_reservation(winning).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Paid);
        assert_eq!(f.ledger.get_raffle(raffle_id).await.unwrap().amount_raised_cents, 5_000);
        assert_eq!(f.engine.get_winner(raffle_id).await.unwrap().unwrap().reservation_id, winning);

        let flags = f.store.list_flags(10).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::PaymentConflict);
        assert_eq!(flags[0].reservation_id, Some(winning));
        assert_eq!(flags[0].raffle_id, Some(raffle_id));
    }

    #[tokio::test]
    async fn test_payment_after_draw_is_flagged_not_sold() {
        let f = fixture();
        let (raffle_id, _, straggler) = drawn(&f).await;

        f.processor
            .register_payment(straggler, "manual", "manual-s", 2_500)
            .await
            .unwrap();
        let outcome = f
            .processor
            .handle_provider_event("manual", "manual-s", "paid", &json!({ "status": "paid" }))
            .await
            .unwrap();
        assert_eq!(outcome.label(), "applied");

        assert_eq!(
            f.ledger.get_reservation(straggler).await.unwrap().state,
            ReservationState::Reserved
        );
        assert_eq!(f.ledger.get_raffle(raffle_id).await.unwrap().amount_raised_cents, 5_000);

        let flags = f.store.list_flags(10).await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::PaymentConflict);
        assert_eq!(flags[0].reservation_id, Some(straggler));
    }

    #[tokio::test]
    async fn test_rejected_input() {
        let f = fixture();
        let (_, reservation_id) = reserved(&f, 1).await;

        assert!(matches!(
            f.processor
                .handle_provider_event("mercadopago", "1", "approved", &json!({}))
                .await,
            Err(PaymentError::UnknownProvider(_))
        ));
        assert!(matches!(
            f.processor.handle_provider_event("asaas", "pay_x", "RECEIVED", &json!("text")).await,
            Err(PaymentError::InvalidPayload(_))
        ));
        assert!(matches!(
            f.processor.handle_provider_event("asaas", "pay_x", "SOMETHING", &json!({})).await,
            Err(PaymentError::InvalidPayload(_))
        ));
        assert!(matches!(
            f.processor.register_payment(reservation_id, "asaas", "pay_y", 999).await,
            Err(PaymentError::AmountMismatch { expected: 2_500, received: 999 })
        ));
        assert!(f.store.find_transaction("asaas", "pay_x").await.unwrap().is_none());
    }
}
