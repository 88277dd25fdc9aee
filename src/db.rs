// src/db.rs
use crate::error::AppError;
use crate::models::{HistoryEntry, Holding, User};
use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;

pub type DbPool = SqlitePool;

/// Cash credited to every new account.
pub const STARTING_CASH: Decimal = dec!(10000.00);

pub async fn init(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .log_statements(log::LevelFilter::Debug);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!("Successfully opened database {}.", database_url);
    Ok(pool)
}

pub async fn migrate(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            hash TEXT NOT NULL,
            cash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Zero-share positions are deleted, never stored.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS holdings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            symbol TEXT NOT NULL,
            name TEXT NOT NULL,
            shares INTEGER NOT NULL CHECK (shares > 0),
            price TEXT NOT NULL,
            total_cost TEXT NOT NULL,
            UNIQUE (user_id, symbol)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            symbol TEXT NOT NULL,
            shares INTEGER NOT NULL CHECK (shares <> 0),
            price TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_user ON history (user_id)")
        .execute(pool)
        .await?;

    Ok(())
}

// Money columns are canonical decimal TEXT.
fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let text: String = row.try_get(column)?;
    Decimal::from_str(&text).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        hash: row.try_get("hash")?,
        cash: decimal(row, "cash")?,
    })
}

fn holding_from_row(row: &SqliteRow) -> Result<Holding, sqlx::Error> {
    Ok(Holding {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        symbol: row.try_get("symbol")?,
        name: row.try_get("name")?,
        shares: row.try_get("shares")?,
        price: decimal(row, "price")?,
        total_cost: decimal(row, "total_cost")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry, sqlx::Error> {
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        shares: row.try_get("shares")?,
        price: decimal(row, "price")?,
        timestamp: row.try_get("timestamp")?,
    })
}

/// Inserts a user with the starting balance. A taken username surfaces as a
/// validation error even when two registrations race.
pub async fn create_user(pool: &DbPool, username: &str, hash: &str) -> Result<i64, AppError> {
    let result = sqlx::query("INSERT INTO users (username, hash, cash) VALUES (?, ?, ?)")
        .bind(username)
        .bind(hash)
        .bind(STARTING_CASH.to_string())
        .execute(pool)
        .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(AppError::validation("username already in use"))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn find_user(pool: &DbPool, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query("SELECT id, username, hash, cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .map(|row| user_from_row(&row))
        .transpose()
}

pub async fn find_user_by_name(
    pool: &DbPool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query("SELECT id, username, hash, cash FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?
        .map(|row| user_from_row(&row))
        .transpose()
}

pub async fn holdings(pool: &DbPool, user_id: i64) -> Result<Vec<Holding>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, user_id, symbol, name, shares, price, total_cost
         FROM holdings WHERE user_id = ? ORDER BY symbol",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(holding_from_row).collect()
}

pub async fn history(pool: &DbPool, user_id: i64) -> Result<Vec<HistoryEntry>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, symbol, shares, price, timestamp FROM history WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(history_from_row).collect()
}

// The helpers below run inside a settlement transaction.

/// No-op write on the user row. Issued first in every settlement so SQLite
/// hands out the write lock before anything is read; a later read-to-write
/// upgrade could otherwise fail with SQLITE_BUSY. Returns false for an
/// unknown user.
pub async fn lock_user(conn: &mut SqliteConnection, user_id: i64) -> Result<bool, sqlx::Error> {
    let done = sqlx::query("UPDATE users SET cash = cash WHERE id = ?")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn user_cash(conn: &mut SqliteConnection, user_id: i64) -> Result<Decimal, sqlx::Error> {
    let row = sqlx::query("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;
    decimal(&row, "cash")
}

pub async fn set_cash(
    conn: &mut SqliteConnection,
    user_id: i64,
    cash: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET cash = ? WHERE id = ?")
        .bind(cash.to_string())
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn find_holding(
    conn: &mut SqliteConnection,
    user_id: i64,
    symbol: &str,
) -> Result<Option<Holding>, sqlx::Error> {
    sqlx::query(
        "SELECT id, user_id, symbol, name, shares, price, total_cost
         FROM holdings WHERE user_id = ? AND symbol = ?",
    )
    .bind(user_id)
    .bind(symbol)
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| holding_from_row(&row))
    .transpose()
}

pub async fn insert_holding(
    conn: &mut SqliteConnection,
    user_id: i64,
    symbol: &str,
    name: &str,
    shares: i64,
    price: Decimal,
    total_cost: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO holdings (user_id, symbol, name, shares, price, total_cost)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(symbol)
    .bind(name)
    .bind(shares)
    .bind(price.to_string())
    .bind(total_cost.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn update_holding(
    conn: &mut SqliteConnection,
    holding_id: i64,
    shares: i64,
    price: Decimal,
    total_cost: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE holdings SET shares = ?, price = ?, total_cost = ? WHERE id = ?")
        .bind(shares)
        .bind(price.to_string())
        .bind(total_cost.to_string())
        .bind(holding_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_holding(conn: &mut SqliteConnection, holding_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM holdings WHERE id = ?")
        .bind(holding_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn append_history(
    conn: &mut SqliteConnection,
    user_id: i64,
    symbol: &str,
    shares: i64,
    price: Decimal,
    timestamp: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO history (user_id, symbol, shares, price, timestamp) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(symbol)
    .bind(shares)
    .bind(price.to_string())
    .bind(timestamp)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Single-connection in-memory database; more connections would each see
/// their own empty database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> DbPool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    migrate(&pool).await.expect("create schema");
    pool
}
