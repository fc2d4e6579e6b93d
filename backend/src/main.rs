//! # Ganhavel Draw Backend Service
//!
//! This is the main entry point for the service behind Ganhavel raffles
//! ("ganháveis"). It provides:
//!
//! - REST API for reservations, payments, draws and winners
//! - Payment provider webhooks
//! - WebSocket connections for real-time updates
//! - A background sweeper that expires holds and resolves raffles
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BACKEND SERVICE                           │
//! │                                                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │   Background Services   │  │
//! │  │  (Actix)    │  │  /ws        │  │  • Sweeper              │  │
//! │  │             │  │             │  │  • Event forwarder      │  │
//! │  │  /raffles   │  │             │  │                         │  │
//! │  │  /webhooks  │  │             │  │                         │  │
//! │  │  /draws     │  │             │  │                         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │         │                ▲                     │                 │
//! │         │                │ EventBus            │                 │
//! │  ┌──────┴────────────────┴─────────────────────┴─────────────┐  │
//! │  │                    SERVICE LAYER                           │  │
//! │  │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────┐   │  │
//! │  │  │ReservationLed│ │PaymentProcess│ │WinnerEngine      │   │  │
//! │  │  └──────────────┘ └──────────────┘ └──────────────────┘   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                                       │
//! │                   ┌──────┴──────┐                                │
//! │                   │    Store    │  PostgreSQL or memory          │
//! │                   └─────────────┘                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Set up PostgreSQL and create the database
//! 2. Put `DATABASE_URL` (and any overrides) in `.env`
//! 3. Start the server: `cargo run`; migrations run on startup
//!
//! `STORAGE_BACKEND=memory` runs without a database.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod config;
mod db;
mod events;
mod models;
mod services;
mod store;
mod utils;
mod websocket;

use config::{AppConfig, StorageBackend};
use db::Database;
use events::EventBus;
use services::{PaymentProcessor, ReservationLedger, Sweeper, WinnerEngine};
use store::{MemoryStore, PgStore, Store};
use utils::{Clock, SystemClock};
use websocket::WsRegistry;

/// Application state shared across all handlers.
///
/// Every service holds the same `Arc<dyn Store>` and publishes on the same
/// [`EventBus`].
pub struct AppState {
    /// Persistence backend
    pub store: Arc<dyn Store>,

    /// Ticket reservations and payment confirmation
    pub ledger: ReservationLedger,

    /// Payment provider events
    pub payments: PaymentProcessor,

    /// Draw ingestion and winner resolution
    pub engine: WinnerEngine,

    /// Application configuration
    pub config: AppConfig,

    /// WebSocket connection registry for real-time updates
    pub ws_registry: WsRegistry,

    /// Domain events published after each commit
    pub events: EventBus,
}

impl AppState {
    /// Wire the services around one store, clock and event bus.
    pub fn new(store: Arc<dyn Store>, config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::new();
        let ledger = ReservationLedger::new(store.clone(), config.clone(), clock.clone(), events.clone());
        let payments = PaymentProcessor::new(store.clone(), ledger.clone(), config.clone(), clock.clone());
        let engine = WinnerEngine::new(store.clone(), clock, events.clone());

        Self {
            store,
            ledger,
            payments,
            engine,
            config,
            ws_registry: WsRegistry::new(),
            events,
        }
    }
}

/// Main entry point for the backend service.
///
/// This function:
/// 1. Initializes logging
/// 2. Loads configuration from environment
/// 3. Opens the configured store
/// 4. Starts the sweeper and the WebSocket forwarder
/// 5. Launches the HTTP server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Load .env and Initialize Logging
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    // RUST_LOG overrides the default, e.g. RUST_LOG=ganhavel_backend=debug
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("🚀 Starting Ganhavel Draw Backend Service");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    let config = AppConfig::from_env()
        .expect("Failed to load configuration");

    info!("📋 Configuration loaded");
    info!("   Reservation hold: {}s", config.reservation_ttl_secs);
    info!("   Late payment policy: {:?}", config.late_payment_policy);
    info!("   Payment providers: {:?}", config.payment_providers);

    // =========================================
    // STEP 3: Open Store
    // =========================================
    let store: Arc<dyn Store> = match config.storage_backend {
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .expect("DATABASE_URL is required for the postgres backend");

            let db = Database::connect(url, config.database_pool_size)
                .await
                .expect("Failed to connect to database");
            info!("🗄️  Database connected");

            db.run_migrations()
                .await
                .expect("Failed to run migrations");
            info!("📦 Database migrations complete");

            Arc::new(PgStore::new(db))
        }
        StorageBackend::Memory => {
            info!("🧪 Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // =========================================
    // STEP 4: Initialize Services
    // =========================================
    let app_state = Arc::new(AppState::new(store, config.clone(), Arc::new(SystemClock)));
    info!("🔧 Services initialized");

    // =========================================
    // STEP 5: Start Background Services
    // =========================================
    websocket::spawn_event_forwarder(&app_state.events, app_state.ws_registry.clone());
    info!("🔌 WebSocket event forwarder started");

    let sweeper = Sweeper::new(
        app_state.ledger.clone(),
        app_state.engine.clone(),
        config.clone(),
    );
    tokio::spawn(async move {
        sweeper.start_loop().await;
    });
    info!("🧹 Sweeper started");

    // =========================================
    // STEP 6: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    HttpServer::new(move || {
        App::new()
            // Attach shared application state
            .app_data(web::Data::new(app_state.clone()))

            // Browser clients call from the storefront origin
            .wrap(Cors::permissive())

            // Add logging middleware
            .wrap(middleware::Logger::default())

            // Configure API routes
            .configure(api::configure_routes)

            // Configure WebSocket routes
            .configure(websocket::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .run()
    .await
}
