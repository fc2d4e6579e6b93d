//! # Database Queries
//!
//! This module contains all the SQL queries for interacting with the database.
//! Each function performs a specific database operation.
//!
//! ## Query Organization
//!
//! Queries are grouped by the table they operate on:
//! - `raffle_*` / `lock_raffle` - Raffle table operations
//! - `reservation_*` / `*_claims` - Reservations and live number claims
//! - `transaction_*` - Payment transaction operations
//! - `draw_*` / `winner_*` - Lottery draws and resolved winners
//! - `flag_*` - Reconciliation flags
//!
//! Functions taking a `&Pool` run on their own connection. Functions taking
//! a `&Transaction` run inside the caller's unit of work; the caller holds
//! the raffle row lock and commits.
//!
//! ## Error Handling
//!
//! All queries return `Result<T, DatabaseError>`. Common errors:
//! - `NotFound` - Record doesn't exist
//! - `QueryError` - SQL execution failed
//! - `CorruptRow` - A stored status or array could not be decoded

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Pool, Transaction};
use serde_json::Value;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::DatabaseError;

const RAFFLE_COLUMNS: &str = "id, title, goal_cents, ticket_price_cents, amount_raised_cents, \
     total_tickets, status, draw_date, goal_reached_at, created_at, updated_at";

const RESERVATION_COLUMNS: &str = "id, raffle_id, buyer_id, quantity, ticket_numbers, amount_cents, \
     state, created_at, expires_at, paid_at, transaction_ref, updated_at";

const TRANSACTION_COLUMNS: &str = "id, reservation_id, provider, provider_payment_id, amount_cents, \
     status, raw_payload, created_at, updated_at, confirmed_at";

const WINNER_COLUMNS: &str = "raffle_id, ticket_number, target_number, match_kind, buyer_id, \
     reservation_id, contest_number, pool_size, rule, resolved_at";

// ============================================
// HELPER FUNCTIONS
// ============================================

/// Decode a text column into one of the status enums.
fn text_column<T>(row: &Row, column: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse()
        .map_err(|e| DatabaseError::CorruptRow(format!("{}: {}", column, e)))
}

/// Helper to convert a database row to Raffle
fn row_to_raffle(row: &Row) -> Result<Raffle, DatabaseError> {
    Ok(Raffle {
        id: row.get("id"),
        title: row.get("title"),
        goal_cents: row.get("goal_cents"),
        ticket_price_cents: row.get("ticket_price_cents"),
        amount_raised_cents: row.get("amount_raised_cents"),
        total_tickets: row.get("total_tickets"),
        status: text_column(row, "status")?,
        draw_date: row.get("draw_date"),
        goal_reached_at: row.get("goal_reached_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Helper to convert a database row to Reservation
fn row_to_reservation(row: &Row) -> Result<Reservation, DatabaseError> {
    Ok(Reservation {
        id: row.get("id"),
        raffle_id: row.get("raffle_id"),
        buyer_id: row.get("buyer_id"),
        quantity: row.get("quantity"),
        ticket_numbers: row.get("ticket_numbers"),
        amount_cents: row.get("amount_cents"),
        state: text_column(row, "state")?,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        paid_at: row.get("paid_at"),
        transaction_ref: row.get("transaction_ref"),
        updated_at: row.get("updated_at"),
    })
}

/// Helper to convert a database row to PaymentTransaction
fn row_to_transaction(row: &Row) -> Result<PaymentTransaction, DatabaseError> {
    Ok(PaymentTransaction {
        id: row.get("id"),
        reservation_id: row.get("reservation_id"),
        provider: row.get("provider"),
        provider_payment_id: row.get("provider_payment_id"),
        amount_cents: row.get("amount_cents"),
        status: text_column(row, "status")?,
        raw_payload: row.get("raw_payload"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        confirmed_at: row.get("confirmed_at"),
    })
}

/// Helper to convert a database row to LotteryDraw
fn row_to_draw(row: &Row) -> Result<LotteryDraw, DatabaseError> {
    let contest_number: i64 = row.get("contest_number");
    let stored: Vec<i32> = row.get("numbers");

    let numbers: [u8; 5] = stored
        .iter()
        .map(|n| u8::try_from(*n).ok())
        .collect::<Option<Vec<u8>>>()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| {
            DatabaseError::CorruptRow(format!("contest {} has invalid numbers {:?}", contest_number, stored))
        })?;

    Ok(LotteryDraw {
        contest_number,
        draw_date: row.get("draw_date"),
        numbers,
        ingested_at: row.get("ingested_at"),
    })
}

/// Helper to convert a database row to WinnerRecord
fn row_to_winner(row: &Row) -> Result<WinnerRecord, DatabaseError> {
    Ok(WinnerRecord {
        raffle_id: row.get("raffle_id"),
        ticket_number: row.get("ticket_number"),
        target_number: row.get("target_number"),
        match_kind: text_column(row, "match_kind")?,
        buyer_id: row.get("buyer_id"),
        reservation_id: row.get("reservation_id"),
        contest_number: row.get("contest_number"),
        pool_size: row.get("pool_size"),
        rule: row.get("rule"),
        resolved_at: row.get("resolved_at"),
    })
}

/// Helper to convert a database row to ReconciliationFlag
fn row_to_flag(row: &Row) -> Result<ReconciliationFlag, DatabaseError> {
    Ok(ReconciliationFlag {
        id: row.get("id"),
        kind: text_column(row, "kind")?,
        raffle_id: row.get("raffle_id"),
        reservation_id: row.get("reservation_id"),
        transaction_id: row.get("transaction_id"),
        detail: row.get("detail"),
        context: row.get("context"),
        created_at: row.get("created_at"),
    })
}

fn rows_to<T>(rows: &[Row], convert: fn(&Row) -> Result<T, DatabaseError>) -> Result<Vec<T>, DatabaseError> {
    rows.iter().map(convert).collect()
}

// ============================================
// RAFFLE QUERIES
// ============================================

/// Insert a raffle, or update the descriptive fields of an existing one.
pub async fn upsert_raffle(pool: &Pool, raffle: &Raffle) -> Result<Raffle, DatabaseError> {
    debug!("Upserting raffle: {}", raffle.id);

    let client = pool.get().await?;

    let row = client.query_one(
        &*format!(
            r#"
            INSERT INTO raffles (
                id, title, goal_cents, ticket_price_cents, amount_raised_cents,
                total_tickets, status, draw_date, goal_reached_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                goal_cents = EXCLUDED.goal_cents,
                ticket_price_cents = EXCLUDED.ticket_price_cents,
                draw_date = EXCLUDED.draw_date,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            RAFFLE_COLUMNS
        ),
        &[
            &raffle.id,
            &raffle.title,
            &raffle.goal_cents,
            &raffle.ticket_price_cents,
            &raffle.amount_raised_cents,
            &raffle.total_tickets,
            &raffle.status.as_str(),
            &raffle.draw_date,
            &raffle.goal_reached_at,
            &raffle.created_at,
            &raffle.updated_at,
        ],
    ).await?;

    info!("Raffle upserted: {}", raffle.id);
    row_to_raffle(&row)
}

/// Get a raffle by id.
pub async fn get_raffle(pool: &Pool, raffle_id: Uuid) -> Result<Option<Raffle>, DatabaseError> {
    debug!("Fetching raffle: {}", raffle_id);

    let client = pool.get().await?;

    let rows = client.query(
        &*format!("SELECT {} FROM raffles WHERE id = $1", RAFFLE_COLUMNS),
        &[&raffle_id],
    ).await?;

    rows.first().map(row_to_raffle).transpose()
}

/// Lock a raffle row for the rest of the transaction.
///
/// Every mutation of a raffle's reservations goes through this lock, which
/// serializes allocation per raffle without blocking other raffles.
pub async fn lock_raffle(tx: &Transaction<'_>, raffle_id: Uuid) -> Result<Option<Raffle>, DatabaseError> {
    let rows = tx.query(
        &*format!("SELECT {} FROM raffles WHERE id = $1 FOR UPDATE", RAFFLE_COLUMNS),
        &[&raffle_id],
    ).await?;

    rows.first().map(row_to_raffle).transpose()
}

/// Persist status and funding fields of a locked raffle.
pub async fn update_raffle(tx: &Transaction<'_>, raffle: &Raffle) -> Result<(), DatabaseError> {
    let rows_affected = tx.execute(
        r#"
        UPDATE raffles
        SET
            status = $2,
            amount_raised_cents = $3,
            goal_reached_at = $4,
            updated_at = $5
        WHERE id = $1
        "#,
        &[
            &raffle.id,
            &raffle.status.as_str(),
            &raffle.amount_raised_cents,
            &raffle.goal_reached_at,
            &raffle.updated_at,
        ],
    ).await?;

    if rows_affected == 0 {
        return Err(DatabaseError::NotFound(format!("Raffle not found: {}", raffle.id)));
    }
    Ok(())
}

/// Completed raffles without a winner, oldest goal first.
pub async fn list_awaiting_draw(pool: &Pool) -> Result<Vec<Raffle>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        &*format!(
            r#"
            SELECT {}
            FROM raffles r
            WHERE r.status = 'completed'
              AND NOT EXISTS (SELECT 1 FROM winners w WHERE w.raffle_id = r.id)
            ORDER BY r.goal_reached_at ASC NULLS LAST
            "#,
            RAFFLE_COLUMNS
        ),
        &[],
    ).await?;

    rows_to(&rows, row_to_raffle)
}

// ============================================
// RESERVATION QUERIES
// ============================================

/// Record a new reservation.
pub async fn insert_reservation(tx: &Transaction<'_>, reservation: &Reservation) -> Result<(), DatabaseError> {
    debug!(
        "Creating reservation {} for raffle {} ({} tickets)",
        reservation.id, reservation.raffle_id, reservation.quantity
    );

    tx.execute(
        r#"
        INSERT INTO reservations (
            id, raffle_id, buyer_id, quantity, ticket_numbers, amount_cents,
            state, created_at, expires_at, paid_at, transaction_ref, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
        &[
            &reservation.id,
            &reservation.raffle_id,
            &reservation.buyer_id,
            &reservation.quantity,
            &reservation.ticket_numbers,
            &reservation.amount_cents,
            &reservation.state.as_str(),
            &reservation.created_at,
            &reservation.expires_at,
            &reservation.paid_at,
            &reservation.transaction_ref,
            &reservation.updated_at,
        ],
    ).await?;

    Ok(())
}

/// Persist the mutable fields of a reservation.
pub async fn update_reservation(tx: &Transaction<'_>, reservation: &Reservation) -> Result<(), DatabaseError> {
    let rows_affected = tx.execute(
        r#"
        UPDATE reservations
        SET
            state = $2,
            paid_at = $3,
            transaction_ref = $4,
            updated_at = $5
        WHERE id = $1
        "#,
        &[
            &reservation.id,
            &reservation.state.as_str(),
            &reservation.paid_at,
            &reservation.transaction_ref,
            &reservation.updated_at,
        ],
    ).await?;

    if rows_affected == 0 {
        return Err(DatabaseError::NotFound(format!("Reservation not found: {}", reservation.id)));
    }
    Ok(())
}

/// Get a reservation by id.
pub async fn get_reservation(pool: &Pool, reservation_id: Uuid) -> Result<Option<Reservation>, DatabaseError> {
    debug!("Fetching reservation: {}", reservation_id);

    let client = pool.get().await?;

    let rows = client.query(
        &*format!("SELECT {} FROM reservations WHERE id = $1", RESERVATION_COLUMNS),
        &[&reservation_id],
    ).await?;

    rows.first().map(row_to_reservation).transpose()
}

/// Re-read a reservation inside a transaction, after the raffle lock is held.
pub async fn fetch_reservation(tx: &Transaction<'_>, reservation_id: Uuid) -> Result<Option<Reservation>, DatabaseError> {
    let rows = tx.query(
        &*format!("SELECT {} FROM reservations WHERE id = $1", RESERVATION_COLUMNS),
        &[&reservation_id],
    ).await?;

    rows.first().map(row_to_reservation).transpose()
}

/// Raffle of a reservation, read without locks to know which raffle to lock.
pub async fn reservation_raffle(pool: &Pool, reservation_id: Uuid) -> Result<Option<Uuid>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        "SELECT raffle_id FROM reservations WHERE id = $1",
        &[&reservation_id],
    ).await?;

    Ok(rows.first().map(|row| row.get("raffle_id")))
}

/// Raffles that currently have stale `reserved` holds.
pub async fn raffles_with_stale_reservations(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        r#"
        SELECT DISTINCT raffle_id
        FROM reservations
        WHERE state = 'reserved' AND expires_at <= $1
        "#,
        &[&now],
    ).await?;

    Ok(rows.iter().map(|row| row.get("raffle_id")).collect())
}

/// Expire a locked raffle's stale holds and drop their claims.
pub async fn expire_stale_for_raffle(
    tx: &Transaction<'_>,
    raffle_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<Reservation>, DatabaseError> {
    let rows = tx.query(
        &*format!(
            r#"
            WITH stale AS (
                UPDATE reservations
                SET state = 'expired', updated_at = $2
                WHERE raffle_id = $1 AND state = 'reserved' AND expires_at <= $2
                RETURNING {}
            ), freed AS (
                DELETE FROM reservation_tickets t
                USING stale
                WHERE t.reservation_id = stale.id
            )
            SELECT * FROM stale ORDER BY created_at
            "#,
            RESERVATION_COLUMNS
        ),
        &[&raffle_id, &now],
    ).await?;

    if !rows.is_empty() {
        info!("Expired {} stale reservation(s) in raffle {}", rows.len(), raffle_id);
    }
    rows_to(&rows, row_to_reservation)
}

/// Numbers held by live reservations of a locked raffle.
pub async fn claimed_numbers(tx: &Transaction<'_>, raffle_id: Uuid) -> Result<BTreeSet<i64>, DatabaseError> {
    let rows = tx.query(
        "SELECT number FROM reservation_tickets WHERE raffle_id = $1",
        &[&raffle_id],
    ).await?;

    Ok(rows.iter().map(|row| row.get::<_, i64>("number")).collect())
}

/// Current owners of the given numbers.
pub async fn claim_owners(
    tx: &Transaction<'_>,
    raffle_id: Uuid,
    numbers: &[i64],
) -> Result<HashMap<i64, Uuid>, DatabaseError> {
    let rows = tx.query(
        r#"
        SELECT number, reservation_id
        FROM reservation_tickets
        WHERE raffle_id = $1 AND number = ANY($2)
        "#,
        &[&raffle_id, &numbers],
    ).await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("number"), row.get("reservation_id")))
        .collect())
}

/// Claim numbers for a reservation.
///
/// The `(raffle_id, number)` primary key rejects a number that is already
/// live, so a double allocation fails the whole transaction.
pub async fn insert_claims(
    tx: &Transaction<'_>,
    raffle_id: Uuid,
    reservation_id: Uuid,
    numbers: &[i64],
) -> Result<(), DatabaseError> {
    tx.execute(
        r#"
        INSERT INTO reservation_tickets (raffle_id, number, reservation_id)
        SELECT $1, t.number, $2
        FROM UNNEST($3::BIGINT[]) AS t(number)
        "#,
        &[&raffle_id, &reservation_id, &numbers],
    ).await?;

    Ok(())
}

/// Return a reservation's numbers to the pool.
pub async fn free_claims(tx: &Transaction<'_>, reservation_id: Uuid) -> Result<u64, DatabaseError> {
    let freed = tx.execute(
        "DELETE FROM reservation_tickets WHERE reservation_id = $1",
        &[&reservation_id],
    ).await?;

    Ok(freed)
}

const PAID_TICKETS_SQL: &str = r#"
    SELECT
        t.number AS number,
        r.id AS reservation_id,
        r.buyer_id AS buyer_id,
        COALESCE(r.paid_at, r.updated_at) AS purchased_at
    FROM reservations r
    CROSS JOIN LATERAL UNNEST(r.ticket_numbers) AS t(number)
    WHERE r.raffle_id = $1 AND r.state = 'paid'
    ORDER BY t.number ASC, purchased_at ASC
"#;

fn row_to_ticket(row: &Row) -> Ticket {
    Ticket {
        number: row.get("number"),
        reservation_id: row.get("reservation_id"),
        buyer_id: row.get("buyer_id"),
        purchased_at: row.get("purchased_at"),
    }
}

/// Every number sold by a `paid` reservation.
pub async fn list_paid_tickets(pool: &Pool, raffle_id: Uuid) -> Result<Vec<Ticket>, DatabaseError> {
    debug!("Fetching paid tickets for raffle: {}", raffle_id);

    let client = pool.get().await?;
    let rows = client.query(PAID_TICKETS_SQL, &[&raffle_id]).await?;

    Ok(rows.iter().map(row_to_ticket).collect())
}

/// Paid tickets of a locked raffle, as the draw sees them.
pub async fn locked_paid_tickets(tx: &Transaction<'_>, raffle_id: Uuid) -> Result<Vec<Ticket>, DatabaseError> {
    let rows = tx.query(PAID_TICKETS_SQL, &[&raffle_id]).await?;
    Ok(rows.iter().map(row_to_ticket).collect())
}

// ============================================
// PAYMENT TRANSACTION QUERIES
// ============================================

/// Record a payment unless `(provider, provider_payment_id)` exists.
///
/// Returns the stored record, which is the existing one on conflict.
pub async fn insert_transaction(
    pool: &Pool,
    transaction: &PaymentTransaction,
) -> Result<PaymentTransaction, DatabaseError> {
    debug!(
        "Recording {} payment {} (reservation: {:?})",
        transaction.provider, transaction.provider_payment_id, transaction.reservation_id
    );

    let client = pool.get().await?;

    let inserted = client.execute(
        r#"
        INSERT INTO payment_transactions (
            id, reservation_id, provider, provider_payment_id, amount_cents,
            status, raw_payload, created_at, updated_at, confirmed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (provider, provider_payment_id) DO NOTHING
        "#,
        &[
            &transaction.id,
            &transaction.reservation_id,
            &transaction.provider,
            &transaction.provider_payment_id,
            &transaction.amount_cents,
            &transaction.status.as_str(),
            &transaction.raw_payload,
            &transaction.created_at,
            &transaction.updated_at,
            &transaction.confirmed_at,
        ],
    ).await?;

    if inserted == 0 {
        debug!("Payment {} already recorded", transaction.provider_payment_id);
    }

    let rows = client.query(
        &*format!(
            "SELECT {} FROM payment_transactions WHERE provider = $1 AND provider_payment_id = $2",
            TRANSACTION_COLUMNS
        ),
        &[&transaction.provider, &transaction.provider_payment_id],
    ).await?;

    rows.first()
        .map(row_to_transaction)
        .transpose()?
        .ok_or_else(|| DatabaseError::NotFound(format!("Payment {}", transaction.provider_payment_id)))
}

/// Find a payment by its provider key.
pub async fn find_transaction(
    pool: &Pool,
    provider: &str,
    provider_payment_id: &str,
) -> Result<Option<PaymentTransaction>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        &*format!(
            "SELECT {} FROM payment_transactions WHERE provider = $1 AND provider_payment_id = $2",
            TRANSACTION_COLUMNS
        ),
        &[&provider, &provider_payment_id],
    ).await?;

    rows.first().map(row_to_transaction).transpose()
}

/// Compare-and-set the status of a payment.
///
/// Returns `None` when the record is no longer in `from`.
pub async fn transition_transaction(
    pool: &Pool,
    transaction_id: Uuid,
    from: PaymentStatus,
    to: PaymentStatus,
    payload: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<Option<PaymentTransaction>, DatabaseError> {
    debug!("Updating transaction {} status: {} → {}", transaction_id, from, to);

    let client = pool.get().await?;

    let confirmed_at = if to == PaymentStatus::Paid { Some(now) } else { None };

    let rows = client.query(
        &*format!(
            r#"
            UPDATE payment_transactions
            SET
                status = $3,
                raw_payload = COALESCE($4, raw_payload),
                confirmed_at = COALESCE($5, confirmed_at),
                updated_at = $6
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ),
        &[&transaction_id, &from.as_str(), &to.as_str(), &payload, &confirmed_at, &now],
    ).await?;

    if let Some(row) = rows.first() {
        return row_to_transaction(row).map(Some);
    }

    let exists = client.query(
        "SELECT 1 FROM payment_transactions WHERE id = $1",
        &[&transaction_id],
    ).await?;
    if exists.is_empty() {
        return Err(DatabaseError::NotFound(format!("Transaction not found: {}", transaction_id)));
    }

    warn!("Transaction {} left {} before the update applied", transaction_id, from);
    Ok(None)
}

/// Attach a provisional payment to its reservation; an existing link is kept.
pub async fn link_transaction(
    pool: &Pool,
    transaction_id: Uuid,
    reservation_id: Uuid,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> Result<PaymentTransaction, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        &*format!(
            r#"
            UPDATE payment_transactions
            SET
                reservation_id = COALESCE(reservation_id, $2),
                amount_cents = COALESCE(amount_cents, $3),
                updated_at = CASE WHEN reservation_id IS NULL THEN $4 ELSE updated_at END
            WHERE id = $1
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ),
        &[&transaction_id, &reservation_id, &amount_cents, &now],
    ).await?;

    rows.first()
        .map(row_to_transaction)
        .transpose()?
        .ok_or_else(|| DatabaseError::NotFound(format!("Transaction not found: {}", transaction_id)))
}

// ============================================
// DRAW QUERIES
// ============================================

/// Store a draw unless its contest exists; returns the stored draw.
pub async fn insert_draw(pool: &Pool, draw: &LotteryDraw) -> Result<LotteryDraw, DatabaseError> {
    let client = pool.get().await?;

    let numbers: Vec<i32> = draw.numbers.iter().map(|n| i32::from(*n)).collect();

    let inserted = client.execute(
        r#"
        INSERT INTO lottery_draws (contest_number, draw_date, numbers, ingested_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (contest_number) DO NOTHING
        "#,
        &[&draw.contest_number, &draw.draw_date, &numbers, &draw.ingested_at],
    ).await?;

    if inserted > 0 {
        info!("Ingested contest {} ({})", draw.contest_number, draw.draw_date);
    }

    let rows = client.query(
        "SELECT contest_number, draw_date, numbers, ingested_at FROM lottery_draws WHERE contest_number = $1",
        &[&draw.contest_number],
    ).await?;

    rows.first()
        .map(row_to_draw)
        .transpose()?
        .ok_or_else(|| DatabaseError::NotFound(format!("Contest {}", draw.contest_number)))
}

/// Get a draw by contest number.
pub async fn get_draw(pool: &Pool, contest_number: i64) -> Result<Option<LotteryDraw>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        "SELECT contest_number, draw_date, numbers, ingested_at FROM lottery_draws WHERE contest_number = $1",
        &[&contest_number],
    ).await?;

    rows.first().map(row_to_draw).transpose()
}

/// Earliest draw dated on or after `date`.
pub async fn first_draw_on_or_after(pool: &Pool, date: NaiveDate) -> Result<Option<LotteryDraw>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        r#"
        SELECT contest_number, draw_date, numbers, ingested_at
        FROM lottery_draws
        WHERE draw_date >= $1
        ORDER BY draw_date ASC, contest_number ASC
        LIMIT 1
        "#,
        &[&date],
    ).await?;

    rows.first().map(row_to_draw).transpose()
}

// ============================================
// WINNER QUERIES
// ============================================

/// Store the winner of a locked raffle unless it has one.
///
/// Returns the stored record and whether this call inserted it.
pub async fn insert_winner(tx: &Transaction<'_>, winner: &WinnerRecord) -> Result<(WinnerRecord, bool), DatabaseError> {
    let rows = tx.query(
        &*format!(
            r#"
            INSERT INTO winners (
                raffle_id, ticket_number, target_number, match_kind, buyer_id,
                reservation_id, contest_number, pool_size, rule, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (raffle_id) DO NOTHING
            RETURNING {}
            "#,
            WINNER_COLUMNS
        ),
        &[
            &winner.raffle_id,
            &winner.ticket_number,
            &winner.target_number,
            &winner.match_kind.as_str(),
            &winner.buyer_id,
            &winner.reservation_id,
            &winner.contest_number,
            &winner.pool_size,
            &winner.rule,
            &winner.resolved_at,
        ],
    ).await?;

    if let Some(row) = rows.first() {
        return Ok((row_to_winner(row)?, true));
    }

    let stored = fetch_winner(tx, winner.raffle_id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Winner of raffle {}", winner.raffle_id)))?;
    Ok((stored, false))
}

/// Get the winner of a raffle.
pub async fn get_winner(pool: &Pool, raffle_id: Uuid) -> Result<Option<WinnerRecord>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        &*format!("SELECT {} FROM winners WHERE raffle_id = $1", WINNER_COLUMNS),
        &[&raffle_id],
    ).await?;

    rows.first().map(row_to_winner).transpose()
}

/// Winner of a locked raffle.
pub async fn fetch_winner(tx: &Transaction<'_>, raffle_id: Uuid) -> Result<Option<WinnerRecord>, DatabaseError> {
    let rows = tx.query(
        &*format!("SELECT {} FROM winners WHERE raffle_id = $1", WINNER_COLUMNS),
        &[&raffle_id],
    ).await?;

    rows.first().map(row_to_winner).transpose()
}

/// Whether a locked raffle already has a winner.
pub async fn winner_exists(tx: &Transaction<'_>, raffle_id: Uuid) -> Result<bool, DatabaseError> {
    let rows = tx.query("SELECT 1 FROM winners WHERE raffle_id = $1", &[&raffle_id]).await?;
    Ok(!rows.is_empty())
}

// ============================================
// RECONCILIATION QUERIES
// ============================================

/// Record a reconciliation flag once per (kind, raffle, reservation, transaction).
pub async fn insert_flag(tx: &Transaction<'_>, flag: &ReconciliationFlag) -> Result<bool, DatabaseError> {
    let inserted = tx.execute(
        r#"
        INSERT INTO reconciliation_flags (
            id, kind, raffle_id, reservation_id, transaction_id, detail, context, created_at
        )
        SELECT $1::UUID, $2::TEXT, $3::UUID, $4::UUID, $5::UUID, $6::TEXT, $7::JSONB, $8::TIMESTAMPTZ
        WHERE NOT EXISTS (
            SELECT 1 FROM reconciliation_flags
            WHERE kind = $2
              AND raffle_id IS NOT DISTINCT FROM $3
              AND reservation_id IS NOT DISTINCT FROM $4
              AND transaction_id IS NOT DISTINCT FROM $5
        )
        "#,
        &[
            &flag.id,
            &flag.kind.as_str(),
            &flag.raffle_id,
            &flag.reservation_id,
            &flag.transaction_id,
            &flag.detail,
            &flag.context,
            &flag.created_at,
        ],
    ).await?;

    if inserted > 0 {
        warn!("Reconciliation flag {} recorded: {}", flag.kind, flag.detail);
    }
    Ok(inserted > 0)
}

/// Most recent flags first.
pub async fn list_flags(pool: &Pool, limit: i64) -> Result<Vec<ReconciliationFlag>, DatabaseError> {
    let client = pool.get().await?;

    let rows = client.query(
        r#"
        SELECT id, kind, raffle_id, reservation_id, transaction_id, detail, context, created_at
        FROM reconciliation_flags
        ORDER BY created_at DESC
        LIMIT $1
        "#,
        &[&limit],
    ).await?;

    rows_to(&rows, row_to_flag)
}
