//! # Utilities Module
//!
//! Helpers used across the backend: the clock abstraction services read
//! time from, and formatting of centavo amounts for API responses.

use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// Services never call `Utc::now()` directly so expiry and resolution can be
/// tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock tests move by hand.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: std::sync::Mutex::new(start) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Format centavos as Brazilian reais.
///
/// ## Examples
///
/// ```rust,ignore
/// assert_eq!(format_brl(123_456), "R$ 1.234,56");
/// assert_eq!(format_brl(500), "R$ 5,00");
/// ```
pub fn format_brl(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let whole = (cents / 100).to_string();
    let frac = cents % 100;

    // Thousands separator is '.', decimal separator is ','
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }

    format!("{}R$ {},{:02}", sign, grouped, frac)
}

/// Share of the goal already raised, in percent, capped at 100.
pub fn funding_progress(raised_cents: i64, goal_cents: i64) -> f64 {
    if goal_cents <= 0 {
        return 100.0;
    }
    let pct = raised_cents.max(0) as f64 / goal_cents as f64 * 100.0;
    (pct * 100.0).round().min(10_000.0) / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_format_brl() {
        assert_eq!(format_brl(0), "R$ 0,00");
        assert_eq!(format_brl(500), "R$ 5,00");
        assert_eq!(format_brl(123_456), "R$ 1.234,56");
        assert_eq!(format_brl(100_000_000), "R$ 1.000.000,00");
        assert_eq!(format_brl(-250), "-R$ 2,50");
    }

    #[test]
    fn test_funding_progress() {
        assert_eq!(funding_progress(0, 10_000), 0.0);
        assert_eq!(funding_progress(3_333, 10_000), 33.33);
        assert_eq!(funding_progress(25_000, 10_000), 100.0);
    }

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(16));
        assert_eq!(clock.now(), start + Duration::minutes(16));
    }
}
