//! # Events Module
//!
//! Domain events the backend emits after a state change commits. They feed
//! the WebSocket registry and any external dispatcher (e-mail, push) that
//! subscribes to the bus.
//!
//! ## Event Flow
//!
//! ```text
//! Payment webhook confirms a reservation
//!        ↓
//! Ledger commits the paid state
//!        ↓
//! Service publishes PaymentConfirmed on the EventBus
//!        ↓
//! WebSocket forwarder pushes it to the buyer and the raffle's watchers
//!        ↓
//! Notification dispatcher sends the receipt e-mail
//! ```
//!
//! Publishing never fails a request: an event with no subscribers is
//! simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Reservation, WinnerRecord};

/// Buffered events per subscriber before it starts lagging.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Ticket hold snapshot carried by reservation events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationEvent {
    pub reservation_id: Uuid,
    pub raffle_id: Uuid,
    pub buyer_id: String,
    pub ticket_numbers: Vec<i64>,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationEvent {
    fn from(r: &Reservation) -> Self {
        Self {
            reservation_id: r.id,
            raffle_id: r.raffle_id,
            buyer_id: r.buyer_id.clone(),
            ticket_numbers: r.ticket_numbers.clone(),
            state: r.state.to_string(),
            expires_at: r.expires_at,
        }
    }
}

/// Emitted when a payment turns a reservation into sold tickets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirmedEvent {
    pub transaction_id: Uuid,
    pub reservation_id: Uuid,
    pub raffle_id: Uuid,
    pub buyer_id: String,
    pub ticket_numbers: Vec<i64>,
    pub amount_cents: i64,
}

/// Emitted once, when a raffle's funding goal is reached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalReachedEvent {
    pub raffle_id: Uuid,
    pub reached_at: DateTime<Utc>,
}

/// Everything the backend announces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    ReservationCreated(ReservationEvent),
    ReservationExpired(ReservationEvent),
    ReservationReleased(ReservationEvent),
    PaymentConfirmed(PaymentConfirmedEvent),
    RaffleGoalReached(GoalReachedEvent),
    /// Exactly once per raffle; replays of `resolve` do not re-emit it.
    WinnerDetermined(WinnerRecord),
}

impl DomainEvent {
    /// Wire name, matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ReservationCreated(_) => "reservation_created",
            DomainEvent::ReservationExpired(_) => "reservation_expired",
            DomainEvent::ReservationReleased(_) => "reservation_released",
            DomainEvent::PaymentConfirmed(_) => "payment_confirmed",
            DomainEvent::RaffleGoalReached(_) => "raffle_goal_reached",
            DomainEvent::WinnerDetermined(_) => "winner_determined",
        }
    }

    /// Subjects interested in this event: the buyer (if any) and the raffle.
    pub fn audience(&self) -> Vec<String> {
        match self {
            DomainEvent::ReservationCreated(e)
            | DomainEvent::ReservationExpired(e)
            | DomainEvent::ReservationReleased(e) => {
                vec![e.buyer_id.clone(), e.raffle_id.to_string()]
            }
            DomainEvent::PaymentConfirmed(e) => vec![e.buyer_id.clone(), e.raffle_id.to_string()],
            DomainEvent::RaffleGoalReached(e) => vec![e.raffle_id.to_string()],
            DomainEvent::WinnerDetermined(w) => vec![w.buyer_id.clone(), w.raffle_id.to_string()],
        }
    }
}

/// In-process broadcast bus for [`DomainEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publish to every current subscriber.
    pub fn publish(&self, event: DomainEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!("Published {} to {} subscriber(s)", name, receivers),
            Err(_) => debug!("Published {} with no subscribers", name),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let raffle_id = Uuid::new_v4();
        let event = DomainEvent::RaffleGoalReached(GoalReachedEvent {
            raffle_id,
            reached_at: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "raffle_goal_reached");
        assert_eq!(json["data"]["raffleId"], raffle_id.to_string());
        assert_eq!(event.name(), "raffle_goal_reached");
        assert_eq!(event.audience(), vec![raffle_id.to_string()]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let raffle_id = Uuid::new_v4();

        bus.publish(DomainEvent::RaffleGoalReached(GoalReachedEvent {
            raffle_id,
            reached_at: Utc::now(),
        }));

        match rx.recv().await.unwrap() {
            DomainEvent::RaffleGoalReached(e) => assert_eq!(e.raffle_id, raffle_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
