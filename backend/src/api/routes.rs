//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// This function is called from main.rs to set up
/// all the endpoint routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                      GET  - Storage health
/// ├── /raffles                     POST - Create / update raffle
/// │   └── /{id}                    GET  - Raffle read model
/// │       ├── /status              POST - Status transition
/// │       ├── /reservations        POST - Reserve tickets
/// │       ├── /resolve             POST - Resolve winner
/// │       └── /winner              GET  - Winner read model
/// ├── /reservations/{id}           GET  - Reservation status
/// │   └── /release                 POST - Release hold
/// ├── /payments                    POST - Register checkout charge
/// ├── /webhooks/{provider}         POST - Provider events
/// ├── /draws                       POST - Ingest lottery result
/// │   └── /{contest}               GET  - Draw read model
/// ├── /maintenance
/// │   ├── /expire                  POST - Expire stale holds
/// │   └── /resolve                 POST - Resolve pending raffles
/// └── /reconciliation              GET  - Open flags
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Root endpoint - API information
        .route("/", web::get().to(handlers::api_info))

        // Health check endpoint
        .route("/health", web::get().to(handlers::health_check))

        // Raffle endpoints
        .service(
            web::scope("/raffles")
                .route("", web::post().to(handlers::upsert_raffle))
                .route("/{id}", web::get().to(handlers::get_raffle))
                .route("/{id}/status", web::post().to(handlers::set_raffle_status))
                .route("/{id}/reservations", web::post().to(handlers::reserve_tickets))
                .route("/{id}/resolve", web::post().to(handlers::resolve_raffle))
                .route("/{id}/winner", web::get().to(handlers::get_winner)),
        )

        // Reservation endpoints
        .service(
            web::scope("/reservations")
                .route("/{id}", web::get().to(handlers::get_reservation))
                .route("/{id}/release", web::post().to(handlers::release_reservation)),
        )

        // Payment endpoints
        .route("/payments", web::post().to(handlers::register_payment))
        .route("/webhooks/{provider}", web::post().to(handlers::payment_webhook))

        // Lottery draws
        .service(
            web::scope("/draws")
                .route("", web::post().to(handlers::ingest_draw))
                .route("/{contest}", web::get().to(handlers::get_draw)),
        )

        // Operator triggers
        .service(
            web::scope("/maintenance")
                .route("/expire", web::post().to(handlers::expire_stale))
                .route("/resolve", web::post().to(handlers::resolve_pending)),
        )
        .route("/reconciliation", web::get().to(handlers::list_flags));
}
