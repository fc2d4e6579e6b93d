//! # Sweeper Service
//!
//! Periodic housekeeping hosted by the server binary. The ledger and the
//! engine own no threads; the sweeper is the external trigger that keeps
//! them moving when no request does.
//!
//! ```text
//! Every SWEEP_INTERVAL_SECS:
//! 1. Expire holds whose payment window lapsed
//!               ↓
//! 2. Resolve completed raffles that have a qualifying draw
//! ```
//!
//! A failing step is logged and retried on the next tick.

use std::time::Duration;

use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::AppConfig;

use super::reservation_ledger::ReservationLedger;
use super::winner_engine::{PendingSummary, WinnerEngine};

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired: usize,
    pub resolution: PendingSummary,
}

/// Background expiry and resolution loop.
///
/// ## Usage
///
/// ```rust,ignore
/// let sweeper = Sweeper::new(ledger, engine, config);
/// tokio::spawn(async move {
///     sweeper.start_loop().await;
/// });
/// ```
#[derive(Clone)]
pub struct Sweeper {
    ledger: ReservationLedger,
    engine: WinnerEngine,
    config: AppConfig,
}

impl Sweeper {
    pub fn new(ledger: ReservationLedger, engine: WinnerEngine, config: AppConfig) -> Self {
        Self { ledger, engine, config }
    }

    /// Run forever, one sweep per `config.sweep_interval_secs`.
    pub async fn start_loop(&self) {
        info!(
            "Starting sweeper loop (interval: {}s)",
            self.config.sweep_interval_secs
        );

        let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs));

        loop {
            ticker.tick().await;
            let report = self.run_once().await;
            debug!(
                "Sweep done: {} expired, {} resolved",
                report.expired, report.resolution.resolved
            );
        }
    }

    /// A single sweep. Errors are logged, never returned.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.ledger.expire_stale().await {
            Ok(expired) => report.expired = expired,
            Err(e) => error!("Expiry sweep failed: {}", e),
        }

        match self.engine.resolve_pending().await {
            Ok(summary) => report.resolution = summary,
            Err(e) => error!("Resolution sweep failed: {}", e),
        }

        report
    }
}
