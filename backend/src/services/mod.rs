//! # Services Module
//!
//! This module contains the core business logic of the draw backend.
//! Each service handles a specific domain.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `ReservationLedger` | Ticket holds, expiry, payment confirmation |
//! | `PaymentProcessor` | Provider events, payment state machine |
//! | `WinnerEngine` | Draw ingestion, winner resolution |
//! | `Sweeper` | Periodic expiry and resolution |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌────────────────┐      ┌──────────────────────────────────┐   │
//! │  │PaymentProcessor│─────>│        ReservationLedger          │   │
//! │  │                │      │  • reserve()    • confirm_paid()  │   │
//! │  │ webhooks       │      │  • release()    • revoke_paid()   │   │
//! │  └────────────────┘      └──────────────────────────────────┘   │
//! │                                    │ ticket_pool                 │
//! │  ┌────────────────┐                ▼                             │
//! │  │  WinnerEngine  │      ┌──────────────────────────────────┐   │
//! │  │ draw_rules     │─────>│           Store                   │   │
//! │  └────────────────┘      │   (PostgreSQL or memory)          │   │
//! │          ▲               └──────────────────────────────────┘   │
//! │          │                                                       │
//! │  ┌────────────────┐                                              │
//! │  │    Sweeper     │ expire_stale() + resolve_pending()           │
//! │  └────────────────┘                                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod draw_rules;
pub mod payment_processor;
pub mod reservation_ledger;
pub mod sweeper;
pub mod ticket_pool;
pub mod winner_engine;

pub use payment_processor::{EventOutcome, PaymentError, PaymentProcessor};
pub use reservation_ledger::{LedgerError, RaffleDraft, ReservationLedger};
pub use sweeper::Sweeper;
pub use ticket_pool::ConfirmOutcome;
pub use winner_engine::{PendingSummary, Resolution, ResolutionError, WinnerEngine};
