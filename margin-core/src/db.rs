//! Async storage primitives for persisted document stores.
//!
//! Each function moves its owned arguments into a `tokio_rusqlite` call so the
//! blocking SQLite work runs on the connection's own thread. Nothing here
//! parses JSON; bodies are opaque text at this layer.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

/// Opens (or creates) the SQLite database at `path`, configures WAL mode,
/// and applies schema migrations.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the file cannot be opened, WAL configuration
/// fails, or schema DDL fails.
pub async fn open_db(path: &str) -> Result<Connection, tokio_rusqlite::Error> {
    let conn = Connection::open(path).await?;

    conn.call(|db| {
        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        db.busy_timeout(Duration::from_secs(5))?;
        // Fold any WAL left behind by a previous run into the main file.
        db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        crate::schema::migrate(db)?;
        Ok::<_, rusqlite::Error>(())
    })
    .await?;

    Ok(conn)
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Loads the raw JSON body stored for `document_path`, if any.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the query fails.
pub async fn load_store_body(
    conn: &Connection,
    document_path: &str,
) -> Result<Option<String>, tokio_rusqlite::Error> {
    let document_path = document_path.to_owned();

    conn.call(move |db| {
        let body = db
            .query_row(
                "SELECT body FROM annotation_stores WHERE document_path = ?1",
                rusqlite::params![&document_path],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok::<_, rusqlite::Error>(body)
    })
    .await
}

/// Inserts or replaces the body stored for `document_path`.
///
/// Runs inside `BEGIN IMMEDIATE` so a concurrent writer in another process
/// waits on `busy_timeout` instead of failing mid-transaction.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the upsert transaction fails.
pub async fn write_store_body(
    conn: &Connection,
    document_path: &str,
    body: String,
    updated_at: i64,
) -> Result<(), tokio_rusqlite::Error> {
    let document_path = document_path.to_owned();

    conn.call(move |db| {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO annotation_stores (document_path, body, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(document_path)
             DO UPDATE SET body = excluded.body,
                           updated_at = excluded.updated_at",
            rusqlite::params![&document_path, &body, updated_at],
        )?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
    })
    .await
}

/// Moves a stored body from `from` to `to`, replacing its content with `body`.
///
/// Both steps happen in one transaction. Returns `false` when `from` had no row.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the transaction fails, including when a
/// row for `to` already exists.
pub async fn move_store_body(
    conn: &Connection,
    from: &str,
    to: &str,
    body: String,
    updated_at: i64,
) -> Result<bool, tokio_rusqlite::Error> {
    let from = from.to_owned();
    let to = to.to_owned();

    conn.call(move |db| {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM annotation_stores WHERE document_path = ?1",
            rusqlite::params![&from],
        )?;
        if removed == 0 {
            return Ok::<_, rusqlite::Error>(false);
        }
        tx.execute(
            "INSERT INTO annotation_stores (document_path, body, updated_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![&to, &body, updated_at],
        )?;
        tx.commit()?;
        Ok(true)
    })
    .await
}

/// Deletes the stored body for `document_path`. Returns whether a row existed.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the delete fails.
pub async fn delete_store_body(
    conn: &Connection,
    document_path: &str,
) -> Result<bool, tokio_rusqlite::Error> {
    let document_path = document_path.to_owned();

    conn.call(move |db| {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM annotation_stores WHERE document_path = ?1",
            rusqlite::params![&document_path],
        )?;
        tx.commit()?;
        Ok::<_, rusqlite::Error>(removed > 0)
    })
    .await
}

/// Lists every document path that has a stored body, sorted.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the query fails.
pub async fn list_document_paths(conn: &Connection) -> Result<Vec<String>, tokio_rusqlite::Error> {
    conn.call(|db| {
        let mut stmt =
            db.prepare("SELECT document_path FROM annotation_stores ORDER BY document_path")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
}
