//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts request data
//! 2. Calls the appropriate service
//! 3. Maps the service error, if any, onto an HTTP status and error code
//! 4. Returns a formatted response
//!
//! ## Error Mapping
//!
//! | Error | Status | Code |
//! |-------|--------|------|
//! | Sold out, raffle closed, wrong state | 409 | `INSUFFICIENT_CAPACITY`, `RAFFLE_NOT_ACTIVE`, … |
//! | Unknown raffle / reservation / draw | 404 | `*_NOT_FOUND` |
//! | Bad external input | 400 | `INVALID_PAYLOAD`, `UNKNOWN_PROVIDER`, `MALFORMED_DRAW`, `DRAW_CONFLICT` |
//! | Draw not published yet | 425 | `DRAW_NOT_YET_AVAILABLE` |
//! | Integrity violation, storage failure | 500 | generic message, details in the logs |
//!
//! Idempotent replays (duplicate webhook, second resolve) are `200`.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::StorageBackend;
use crate::db::RaffleStatus;
use crate::models::{
    ApiResponse, ExpireResponse, FlagQuery, HealthResponse, IngestDrawRequest, PaymentEventResponse,
    RaffleResponse, RaffleStatusRequest, RegisterPaymentRequest, ReservationResponse, ReserveRequest,
    ResolutionResponse, ResolveRequest, UpsertRaffleRequest, WebhookFields,
};
use crate::services::{EventOutcome, LedgerError, PaymentError, RaffleDraft, Resolution, ResolutionError};
use crate::AppState;

// ============================================
// ERROR MAPPING
// ============================================

/// Build an error envelope.
fn error_response(status: StatusCode, code: &str, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ApiResponse::<()>::error(code, message))
}

/// Storage failures never leak details to the caller.
fn internal_error(context: &str, e: &dyn std::fmt::Display) -> HttpResponse {
    error!("{} failed: {}", context, e);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal error, please retry later",
    )
}

fn ledger_failure(context: &str, e: &LedgerError) -> HttpResponse {
    let (status, code) = match e {
        LedgerError::InvalidQuantity { .. } => (StatusCode::BAD_REQUEST, "INVALID_QUANTITY"),
        LedgerError::InvalidRaffle(_) => (StatusCode::BAD_REQUEST, "INVALID_RAFFLE"),
        LedgerError::RaffleNotFound(_) => (StatusCode::NOT_FOUND, "RAFFLE_NOT_FOUND"),
        LedgerError::RaffleNotActive { .. } => (StatusCode::CONFLICT, "RAFFLE_NOT_ACTIVE"),
        LedgerError::InsufficientCapacity { available, .. } => {
            let message = if *available == 0 {
                "Sold out: no tickets left".to_string()
            } else {
                format!("Sold out: only {} ticket(s) left, try fewer tickets", available)
            };
            return error_response(StatusCode::CONFLICT, "INSUFFICIENT_CAPACITY", &message);
        }
        LedgerError::ReservationNotFound(_) => (StatusCode::NOT_FOUND, "RESERVATION_NOT_FOUND"),
        LedgerError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
        LedgerError::InvalidTransition(_) => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
        LedgerError::AlreadyDrawn(_) => (StatusCode::CONFLICT, "ALREADY_DRAWN"),
        LedgerError::Database(db) => return internal_error(context, db),
    };

    warn!("{} rejected: {}", context, e);
    error_response(status, code, &e.to_string())
}

fn payment_failure(context: &str, e: &PaymentError) -> HttpResponse {
    let (status, code) = match e {
        PaymentError::UnknownProvider(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_PROVIDER"),
        PaymentError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
        PaymentError::AmountMismatch { .. } => (StatusCode::BAD_REQUEST, "AMOUNT_MISMATCH"),
        PaymentError::PaymentConflict(_) => (StatusCode::CONFLICT, "PAYMENT_CONFLICT"),
        // Provider redelivers on 5xx.
        PaymentError::Contention(_) => (StatusCode::SERVICE_UNAVAILABLE, "RETRY_LATER"),
        PaymentError::Ledger(inner) => return ledger_failure(context, inner),
        PaymentError::Database(db) => return internal_error(context, db),
    };

    warn!("{} rejected: {}", context, e);
    error_response(status, code, &e.to_string())
}

fn resolution_failure(context: &str, e: &ResolutionError) -> HttpResponse {
    let (status, code) = match e {
        ResolutionError::RaffleNotFound(_) => (StatusCode::NOT_FOUND, "RAFFLE_NOT_FOUND"),
        ResolutionError::NotAwaitingDraw { .. } => (StatusCode::CONFLICT, "NOT_AWAITING_DRAW"),
        ResolutionError::DrawNotYetAvailable { .. } => (
            StatusCode::from_u16(425).unwrap_or(StatusCode::CONFLICT),
            "DRAW_NOT_YET_AVAILABLE",
        ),
        ResolutionError::DrawNotFound(_) => (StatusCode::NOT_FOUND, "DRAW_NOT_FOUND"),
        ResolutionError::MalformedDraw(_) => (StatusCode::BAD_REQUEST, "MALFORMED_DRAW"),
        ResolutionError::DrawConflict(_) => (StatusCode::BAD_REQUEST, "DRAW_CONFLICT"),
        ResolutionError::NoPaidTickets(_) | ResolutionError::DoubleAllocation { .. } => {
            // Already logged and flagged by the engine.
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTEGRITY_VIOLATION",
                "This raffle needs manual review before it can be drawn",
            );
        }
        ResolutionError::Database(db) => return internal_error(context, db),
    };

    warn!("{} rejected: {}", context, e);
    error_response(status, code, &e.to_string())
}

// ============================================
// SYSTEM
// ============================================

/// API information endpoint (root).
///
/// ## Endpoint
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Ganhavel Draw API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Ticket reservations, payment confirmation and winner resolution",
        "endpoints": {
            "health": { "method": "GET", "path": "/health" },
            "raffles": {
                "upsert": { "method": "POST", "path": "/raffles" },
                "get": { "method": "GET", "path": "/raffles/{id}" },
                "status": { "method": "POST", "path": "/raffles/{id}/status" },
                "reserve": { "method": "POST", "path": "/raffles/{id}/reservations" },
                "resolve": { "method": "POST", "path": "/raffles/{id}/resolve" },
                "winner": { "method": "GET", "path": "/raffles/{id}/winner" }
            },
            "reservations": {
                "get": { "method": "GET", "path": "/reservations/{id}" },
                "release": { "method": "POST", "path": "/reservations/{id}/release" }
            },
            "payments": {
                "register": { "method": "POST", "path": "/payments" },
                "webhook": { "method": "POST", "path": "/webhooks/{provider}" }
            },
            "draws": {
                "ingest": { "method": "POST", "path": "/draws" },
                "get": { "method": "GET", "path": "/draws/{contest}" }
            },
            "maintenance": {
                "expire": { "method": "POST", "path": "/maintenance/expire" },
                "resolve": { "method": "POST", "path": "/maintenance/resolve" }
            },
            "reconciliation": { "method": "GET", "path": "/reconciliation" },
            "websocket": { "method": "GET", "path": "/ws/{subject}" }
        }
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// ## Endpoint
///
/// `GET /health`
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "status": "healthy",
///         "storage": true,
///         "storageBackend": "postgres",
///         "websocketConnections": 3,
///         "version": "0.1.0",
///         "timestamp": "2026-10-16T12:00:00Z"
///     }
/// }
/// ```
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let storage_healthy = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            error!("Storage health check failed: {}", e);
            false
        }
    };

    let response = HealthResponse {
        status: if storage_healthy { "healthy" } else { "unhealthy" }.to_string(),
        storage: storage_healthy,
        storage_backend: match state.config.storage_backend {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Memory => "memory",
        }
        .to_string(),
        websocket_connections: state.ws_registry.total_connections().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    let status_code = if storage_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

// ============================================
// RAFFLES
// ============================================

/// Create or update a raffle.
///
/// ## Endpoint
///
/// `POST /raffles`
///
/// Integration glue for the organizer platform. Updating an existing raffle
/// only touches title, goal, ticket price and draw date.
pub async fn upsert_raffle(
    state: web::Data<Arc<AppState>>,
    body: web::Json<UpsertRaffleRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let draft = RaffleDraft {
        id: req.id,
        title: req.title,
        goal_cents: req.goal_cents,
        ticket_price_cents: req.ticket_price_cents,
        total_tickets: req.total_tickets,
        status: req.status.unwrap_or(RaffleStatus::Active),
        draw_date: req.draw_date,
    };

    match state.ledger.upsert_raffle(draft).await {
        Ok(raffle) => HttpResponse::Ok().json(ApiResponse::success(RaffleResponse::from(raffle))),
        Err(e) => ledger_failure("Upsert raffle", &e),
    }
}

/// Raffle read model.
///
/// ## Endpoint
///
/// `GET /raffles/{id}`
pub async fn get_raffle(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    match state.ledger.get_raffle(path.into_inner()).await {
        Ok(raffle) => HttpResponse::Ok().json(ApiResponse::success(RaffleResponse::from(raffle))),
        Err(e) => ledger_failure("Get raffle", &e),
    }
}

/// Move a raffle through its lifecycle.
///
/// ## Endpoint
///
/// `POST /raffles/{id}/status`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/raffles/$RAFFLE/status \
///   -H "Content-Type: application/json" \
///   -d '{"status": "suspended"}'
/// ```
pub async fn set_raffle_status(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<RaffleStatusRequest>,
) -> HttpResponse {
    let raffle_id = path.into_inner();
    info!("Status change for raffle {}: {}", raffle_id, body.status);

    match state.ledger.set_raffle_status(raffle_id, body.status).await {
        Ok(raffle) => HttpResponse::Ok().json(ApiResponse::success(RaffleResponse::from(raffle))),
        Err(e) => ledger_failure("Raffle status change", &e),
    }
}

// ============================================
// RESERVATIONS
// ============================================

/// Reserve tickets.
///
/// ## Endpoint
///
/// `POST /raffles/{id}/reservations`
///
/// ## Example
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/raffles/$RAFFLE/reservations \
///   -H "Content-Type: application/json" \
///   -d '{"buyerId": "user_2x8", "quantity": 3}'
/// ```
///
/// ## Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "id": "5b0c…",
///         "ticketNumbers": [14, 15, 16],
///         "state": "reserved",
///         "awaitingPayment": true,
///         "formattedAmount": "R$ 15,00",
///         "expiresAt": "2026-10-16T12:15:00Z"
///     }
/// }
/// ```
pub async fn reserve_tickets(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<ReserveRequest>,
) -> HttpResponse {
    let raffle_id = path.into_inner();

    match state.ledger.reserve(raffle_id, &body.buyer_id, body.quantity).await {
        Ok(reservation) => {
            HttpResponse::Created().json(ApiResponse::success(ReservationResponse::from(reservation)))
        }
        Err(e) => ledger_failure("Reserve", &e),
    }
}

/// Reservation status.
///
/// ## Endpoint
///
/// `GET /reservations/{id}`
pub async fn get_reservation(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    match state.ledger.get_reservation(path.into_inner()).await {
        Ok(reservation) => HttpResponse::Ok().json(ApiResponse::success(ReservationResponse::from(reservation))),
        Err(e) => ledger_failure("Get reservation", &e),
    }
}

/// Give up a pending hold.
///
/// ## Endpoint
///
/// `POST /reservations/{id}/release`
pub async fn release_reservation(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    match state.ledger.release(path.into_inner()).await {
        Ok(reservation) => HttpResponse::Ok().json(ApiResponse::success(ReservationResponse::from(reservation))),
        Err(e) => ledger_failure("Release", &e),
    }
}

// ============================================
// PAYMENTS
// ============================================

/// Register the charge checkout issued.
///
/// ## Endpoint
///
/// `POST /payments`
pub async fn register_payment(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RegisterPaymentRequest>,
) -> HttpResponse {
    let req = body.into_inner();

    match state
        .payments
        .register_payment(req.reservation_id, &req.provider, &req.provider_payment_id, req.amount_cents)
        .await
    {
        Ok(transaction) => HttpResponse::Ok().json(ApiResponse::success(transaction)),
        Err(e) => payment_failure("Register payment", &e),
    }
}

/// Provider webhook.
///
/// ## Endpoint
///
/// `POST /webhooks/{provider}`
///
/// The body is taken raw so malformed deliveries can be logged verbatim.
/// Duplicates and ignored transitions are acknowledged with `200` so the
/// provider stops redelivering.
pub async fn payment_webhook(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let provider = path.into_inner();

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            error!(
                "Unparseable {} webhook ({}): {}",
                provider,
                e,
                String::from_utf8_lossy(&body)
            );
            return error_response(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", "Body is not valid JSON");
        }
    };

    let Some(fields) = WebhookFields::extract(&payload) else {
        error!("{} webhook without payment id or status: {}", provider, payload);
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_PAYLOAD",
            "Missing payment id or status",
        );
    };

    match state
        .payments
        .handle_provider_event(&provider, &fields.payment_id, &fields.status, &payload)
        .await
    {
        Ok(outcome) => {
            let response = PaymentEventResponse {
                outcome: outcome.label().to_string(),
                reason: match &outcome {
                    EventOutcome::Ignored { reason, .. } => Some(reason.clone()),
                    _ => None,
                },
                transaction: outcome.transaction().clone(),
            };
            HttpResponse::Ok().json(ApiResponse::success(response))
        }
        Err(e) => payment_failure("Payment webhook", &e),
    }
}

// ============================================
// DRAWS & WINNERS
// ============================================

/// Ingest a Federal Lottery result.
///
/// ## Endpoint
///
/// `POST /draws`
pub async fn ingest_draw(state: web::Data<Arc<AppState>>, body: web::Json<IngestDrawRequest>) -> HttpResponse {
    match state
        .engine
        .ingest_draw(body.contest_number, body.draw_date, &body.numbers)
        .await
    {
        Ok(draw) => HttpResponse::Ok().json(ApiResponse::success(draw)),
        Err(e) => resolution_failure("Ingest draw", &e),
    }
}

/// Draw read model.
///
/// ## Endpoint
///
/// `GET /draws/{contest}`
pub async fn get_draw(state: web::Data<Arc<AppState>>, path: web::Path<i64>) -> HttpResponse {
    match state.engine.get_draw(path.into_inner()).await {
        Ok(draw) => HttpResponse::Ok().json(ApiResponse::success(draw)),
        Err(e) => resolution_failure("Get draw", &e),
    }
}

/// Resolve a raffle.
///
/// ## Endpoint
///
/// `POST /raffles/{id}/resolve`
///
/// An empty body resolves against the earliest qualifying ingested draw.
pub async fn resolve_raffle(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: Option<web::Json<ResolveRequest>>,
) -> HttpResponse {
    let raffle_id = path.into_inner();
    let contest = body.and_then(|b| b.contest_number);

    match state.engine.resolve_with_contest(raffle_id, contest).await {
        Ok(resolution) => {
            let response = ResolutionResponse {
                already_resolved: matches!(resolution, Resolution::AlreadyResolved(_)),
                winner: resolution.winner().clone(),
            };
            HttpResponse::Ok().json(ApiResponse::success(response))
        }
        Err(e) => resolution_failure("Resolve raffle", &e),
    }
}

/// Winner read model.
///
/// ## Endpoint
///
/// `GET /raffles/{id}/winner`
pub async fn get_winner(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    let raffle_id = path.into_inner();

    match state.engine.get_winner(raffle_id).await {
        Ok(Some(winner)) => HttpResponse::Ok().json(ApiResponse::success(winner)),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "WINNER_NOT_FOUND",
            &format!("Raffle {} has not been drawn yet", raffle_id),
        ),
        Err(e) => resolution_failure("Get winner", &e),
    }
}

// ============================================
// MAINTENANCE
// ============================================

/// Expire stale reservations now.
///
/// ## Endpoint
///
/// `POST /maintenance/expire`
pub async fn expire_stale(state: web::Data<Arc<AppState>>) -> HttpResponse {
    match state.ledger.expire_stale().await {
        Ok(expired) => HttpResponse::Ok().json(ApiResponse::success(ExpireResponse { expired })),
        Err(e) => ledger_failure("Expire stale", &e),
    }
}

/// Resolve every raffle that has a qualifying draw.
///
/// ## Endpoint
///
/// `POST /maintenance/resolve`
pub async fn resolve_pending(state: web::Data<Arc<AppState>>) -> HttpResponse {
    match state.engine.resolve_pending().await {
        Ok(summary) => HttpResponse::Ok().json(ApiResponse::success(summary)),
        Err(e) => resolution_failure("Resolve pending", &e),
    }
}

/// Open reconciliation flags, newest first.
///
/// ## Endpoint
///
/// `GET /reconciliation?limit=50`
pub async fn list_flags(state: web::Data<Arc<AppState>>, query: web::Query<FlagQuery>) -> HttpResponse {
    match state.store.list_flags(query.limit()).await {
        Ok(flags) => HttpResponse::Ok().json(ApiResponse::success(flags)),
        Err(e) => internal_error("List flags", &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::config::AppConfig;
    use crate::store::MemoryStore;
    use crate::utils::SystemClock;
    use actix_web::{test, App};
    use chrono::DateTime;

    fn state() -> Arc<AppState> {
        let config = AppConfig {
            max_tickets_per_reservation: 20,
            ..AppConfig::default()
        };
        Arc::new(AppState::new(Arc::new(MemoryStore::new()), config, Arc::new(SystemClock)))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .configure(configure_routes),
            )
            .await
        };
    }

    macro_rules! create_raffle {
        ($app:expr, $goal:expr, $total:expr) => {{
            let req = test::TestRequest::post()
                .uri("/raffles")
                .set_json(json!({
                    "title": "Bike elétrica",
                    "goalCents": $goal,
                    "ticketPriceCents": 1000,
                    "totalTickets": $total
                }))
                .to_request();
            let body: Value = test::call_and_read_body_json(&$app, req).await;
            body["data"]["id"].as_str().unwrap().to_string()
        }};
    }

    #[actix_web::test]
    async fn test_reserve_and_read_back() {
        let state = state();
        let app = app!(state);
        let raffle_id = create_raffle!(app, 50_000, 10);

        let req = test::TestRequest::post()
            .uri(&format!("/raffles/{}/reservations", raffle_id))
            .set_json(json!({ "buyerId": "user_1", "quantity": 3 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["ticketNumbers"], json!([1, 2, 3]));
        assert_eq!(body["data"]["awaitingPayment"], true);

        let id = body["data"]["id"].as_str().unwrap();
        let req = test::TestRequest::get().uri(&format!("/reservations/{}", id)).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["state"], "reserved");
        assert_eq!(body["data"]["formattedAmount"], "R$ 30,00");
    }

    #[actix_web::test]
    async fn test_sold_out_is_conflict() {
        let state = state();
        let app = app!(state);
        let raffle_id = create_raffle!(app, 50_000, 4);

        let req = test::TestRequest::post()
            .uri(&format!("/raffles/{}/reservations", raffle_id))
            .set_json(json!({ "buyerId": "user_1", "quantity": 5 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "INSUFFICIENT_CAPACITY");
        assert!(body["error"]["message"].as_str().unwrap().contains("try fewer tickets"));
    }

    #[actix_web::test]
    async fn test_unknown_ids_are_not_found() {
        let state = state();
        let app = app!(state);

        let req = test::TestRequest::get()
            .uri(&format!("/raffles/{}", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/draws/77").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["error"]["code"], "DRAW_NOT_FOUND");
    }

    #[actix_web::test]
    async fn test_webhook_rejects_bad_input() {
        let state = state();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/webhooks/asaas")
            .set_payload("not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/webhooks/paypal")
            .set_json(json!({ "paymentId": "x", "status": "paid" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["error"]["code"], "UNKNOWN_PROVIDER");
    }

    #[actix_web::test]
    async fn test_paid_webhook_then_draw_and_winner() {
        let state = state();
        let app = app!(state);
        let raffle_id = create_raffle!(app, 2_000, 10);

        let req = test::TestRequest::post()
            .uri(&format!("/raffles/{}/reservations", raffle_id))
            .set_json(json!({ "buyerId": "user_9", "quantity": 2 }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let reservation_id = body["data"]["id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post()
            .uri("/payments")
            .set_json(json!({
                "reservationId": reservation_id,
                "provider": "mercadopago",
                "providerPaymentId": "998877",
                "amountCents": 2000
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        for expected in ["applied", "duplicate"] {
            let req = test::TestRequest::post()
                .uri("/webhooks/mercadopago")
                .set_json(json!({ "id": 998877, "status": "approved" }))
                .to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["data"]["outcome"], expected);
        }

        let req = test::TestRequest::get().uri(&format!("/raffles/{}", raffle_id)).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["status"], "completed");
        assert_eq!(body["data"]["amountRaisedCents"], 2000);
        let goal_reached_at: DateTime<Utc> = serde_json::from_value(body["data"]["goalReachedAt"].clone()).unwrap();
        let closed_on = goal_reached_at.date_naive();

        // Nothing ingested yet.
        let req = test::TestRequest::post()
            .uri(&format!("/raffles/{}/resolve", raffle_id))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 425);

        // A result from the day sales closed does not qualify.
        let req = test::TestRequest::post()
            .uri("/draws")
            .set_json(json!({ "contestNumber": 6199, "drawDate": closed_on, "numbers": [0, 0, 0, 0, 1] }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        let req = test::TestRequest::post()
            .uri(&format!("/raffles/{}/resolve", raffle_id))
            .set_json(json!({ "contestNumber": 6199 }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 425);

        let next_day = closed_on.succ_opt().unwrap();
        let req = test::TestRequest::post()
            .uri("/draws")
            .set_json(json!({ "contestNumber": 6200, "drawDate": next_day, "numbers": [0, 0, 0, 0, 1] }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri(&format!("/raffles/{}/resolve", raffle_id))
            .set_json(json!({ "contestNumber": 6200 }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["alreadyResolved"], false);
        assert_eq!(body["data"]["winner"]["ticketNumber"], 2);

        let req = test::TestRequest::get()
            .uri(&format!("/raffles/{}/winner", raffle_id))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["buyerId"], "user_9");
    }

    #[actix_web::test]
    async fn test_malformed_draw_is_bad_request() {
        let state = state();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/draws")
            .set_json(json!({ "contestNumber": 1, "drawDate": "2026-10-10", "numbers": [1, 2, 3] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "MALFORMED_DRAW");
    }
}
