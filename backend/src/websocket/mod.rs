//! # WebSocket Module
//!
//! This module pushes domain events to connected clients in real time.
//!
//! ## Subjects
//!
//! A client subscribes to one subject per connection:
//!
//! - a buyer id, to follow their own reservations, payments and prizes
//! - a raffle id, to follow a raffle's sales, goal and draw
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/{subject}
//!              ↓
//! 2. Server registers the session under the subject
//!              ↓
//! 3. The event forwarder routes every DomainEvent to its audience:
//!    - reservation_created / reservation_expired / reservation_released
//!    - payment_confirmed
//!    - raffle_goal_reached
//!    - winner_determined
//! ```
//!
//! ## Message Format
//!
//! ```json
//! {
//!     "event": "payment_confirmed",
//!     "data": {
//!         "reservationId": "5b0c…",
//!         "ticketNumbers": [7, 8, 9],
//!         "amountCents": 3000
//!     },
//!     "timestamp": "2026-07-01T12:00:00Z"
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{DomainEvent, EventBus};
use crate::AppState;

/// Messages buffered per connection.
const SESSION_BUFFER: usize = 100;

/// WebSocket message wrapper.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage<T> {
    /// Event name.
    pub event: String,
    pub data: T,
    pub timestamp: chrono::DateTime<Utc>,
}

impl<T: Serialize> WsMessage<T> {
    pub fn new(event: impl Into<String>, data: T) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl WsMessage<Value> {
    /// Wrap a domain event, keeping its payload as `data`.
    pub fn from_event(event: &DomainEvent) -> Result<Self, serde_json::Error> {
        let data = match serde_json::to_value(event)? {
            Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
            other => other,
        };
        Ok(Self::new(event.name(), data))
    }
}

/// WebSocket connection registry.
///
/// Tracks active sessions per subject. A subject may have several
/// connections (tabs, devices).
#[derive(Clone, Default)]
pub struct WsRegistry {
    sessions: Arc<Mutex<HashMap<String, Vec<broadcast::Sender<String>>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the receiver gets every message for `subject`.
    pub async fn register(&self, subject: String) -> broadcast::Receiver<String> {
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(SESSION_BUFFER);

        let senders = sessions.entry(subject.clone()).or_default();
        senders.push(tx);
        info!(
            "Registered WebSocket for subject: {} (total connections: {})",
            subject,
            senders.len()
        );

        rx
    }

    /// Drop connections of `subject` whose receivers are gone.
    pub async fn unregister(&self, subject: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(senders) = sessions.get_mut(subject) {
            senders.retain(|tx| tx.receiver_count() > 0);

            if senders.is_empty() {
                sessions.remove(subject);
                info!("Unregistered all WebSocket connections for subject: {}", subject);
            }
        }
    }

    /// Send a serialized message to every connection of `subject`.
    ///
    /// Returns how many connections received it. A subject with no
    /// connections is not an error.
    pub async fn send_to_subject(&self, subject: &str, json: &str) -> usize {
        let mut sessions = self.sessions.lock().await;
        let Some(senders) = sessions.get_mut(subject) else {
            return 0;
        };

        senders.retain(|tx| tx.receiver_count() > 0);
        let sent = senders
            .iter()
            .filter(|tx| tx.send(json.to_string()).is_ok())
            .count();

        if senders.is_empty() {
            sessions.remove(subject);
        }
        sent
    }

    /// Route a domain event to its audience.
    pub async fn dispatch(&self, event: &DomainEvent) -> usize {
        let json = match WsMessage::from_event(event).and_then(|m| m.to_json()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} for WebSocket: {}", event.name(), e);
                return 0;
            }
        };

        let mut delivered = 0;
        for subject in event.audience() {
            delivered += self.send_to_subject(&subject, &json).await;
        }

        if delivered > 0 {
            debug!("Forwarded {} to {} connection(s)", event.name(), delivered);
        }
        delivered
    }

    pub async fn connection_count(&self, subject: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(subject).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn total_connections(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|v| v.len()).sum()
    }
}

/// Forward every event published on `events` to the registry.
pub fn spawn_event_forwarder(events: &EventBus, registry: WsRegistry) -> JoinHandle<()> {
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    registry.dispatch(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket forwarder lagged, {} event(s) dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping WebSocket forwarder");
                    break;
                }
            }
        }
    })
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{subject}", web::get().to(websocket_handler));
}

/// WebSocket connection handler.
///
/// ## Endpoint
///
/// `GET /ws/{subject}`
///
/// ## Example (JavaScript)
///
/// ```javascript
/// const ws = new WebSocket('ws://localhost:8080/ws/' + raffleId);
///
/// ws.onmessage = (event) => {
///     const message = JSON.parse(event.data);
///     if (message.event === 'winner_determined') showWinner(message.data);
/// };
/// ```
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let subject = path.into_inner();
    info!("WebSocket connection request for subject: {}", subject);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let registry = state.ws_registry.clone();
    let mut rx = registry.register(subject.clone()).await;

    actix_rt::spawn(async move {
        let welcome = WsMessage::new(
            "connected",
            serde_json::json!({ "subject": subject }),
        );
        if let Ok(json) = welcome.to_json() {
            if let Err(e) = session.text(json).await {
                error!("Failed to send welcome message: {}", e);
            }
        }

        // Registry → socket
        let mut outbound = session.clone();
        let forward_subject = subject.clone();
        let forward_registry = registry.clone();
        actix_rt::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let Err(e) = outbound.text(msg).await {
                    debug!("WebSocket session closed for {}: {}", forward_subject, e);
                    break;
                }
            }
            drop(rx);
            forward_registry.unregister(&forward_subject).await;
        });

        // Socket → server
        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Pong(_) => {}
                Message::Text(text) => {
                    debug!("Received text from {}: {}", subject, text);
                    let ack = WsMessage::new("pong", serde_json::json!({ "received": text.to_string() }));
                    if let Ok(json) = ack.to_json() {
                        let _ = session.text(json).await;
                    }
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from {}", subject);
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for {}: {:?}", subject, reason);
                    break;
                }
                _ => {}
            }
        }

        let _ = session.close(None).await;
        registry.unregister(&subject).await;
        info!("WebSocket disconnected for subject: {}", subject);
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GoalReachedEvent;
    use uuid::Uuid;

    fn goal_reached(raffle_id: Uuid) -> DomainEvent {
        DomainEvent::RaffleGoalReached(GoalReachedEvent {
            raffle_id,
            reached_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_the_audience() {
        let registry = WsRegistry::new();
        let raffle_id = Uuid::new_v4();
        let mut watcher = registry.register(raffle_id.to_string()).await;
        let mut bystander = registry.register("someone-else".to_string()).await;

        assert_eq!(registry.dispatch(&goal_reached(raffle_id)).await, 1);

        let message: Value = serde_json::from_str(&watcher.recv().await.unwrap()).unwrap();
        assert_eq!(message["event"], "raffle_goal_reached");
        assert_eq!(message["data"]["raffleId"], raffle_id.to_string());
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_sessions_are_pruned() {
        let registry = WsRegistry::new();
        let rx = registry.register("buyer-1".to_string()).await;
        let _kept = registry.register("buyer-1".to_string()).await;
        assert_eq!(registry.connection_count("buyer-1").await, 2);

        drop(rx);
        registry.unregister("buyer-1").await;
        assert_eq!(registry.connection_count("buyer-1").await, 1);
        assert_eq!(registry.total_connections().await, 1);
    }

    #[tokio::test]
    async fn test_forwarder_relays_bus_events() {
        let bus = EventBus::new();
        let registry = WsRegistry::new();
        let raffle_id = Uuid::new_v4();
        let mut rx = registry.register(raffle_id.to_string()).await;
        let handle = spawn_event_forwarder(&bus, registry.clone());

        bus.publish(goal_reached(raffle_id));

        let json = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(json.contains("raffle_goal_reached"));
        handle.abort();
    }
}
