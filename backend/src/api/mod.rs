//! # REST API Module
//!
//! This module defines all HTTP endpoints of the draw backend.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/raffles` | Create or update a raffle |
//! | GET | `/raffles/:id` | Raffle and funding progress |
//! | POST | `/raffles/:id/reservations` | Reserve tickets |
//! | GET | `/reservations/:id` | Reservation status |
//! | POST | `/payments` | Register a checkout charge |
//! | POST | `/webhooks/:provider` | Payment provider events |
//! | POST | `/draws` | Ingest a Federal Lottery result |
//! | POST | `/raffles/:id/resolve` | Resolve the winner |
//! | GET | `/raffles/:id/winner` | Winner of a raffle |
//! | GET | `/health` | Health check |
//!
//! See [`routes`] for the full tree.
//!
//! ## Request/Response Format
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "RAFFLE_NOT_ACTIVE",
//!         "message": "Raffle … is not accepting purchases (status: completed)"
//!     }
//! }
//! ```

pub mod handlers;
pub mod routes;

pub use routes::configure_routes;
