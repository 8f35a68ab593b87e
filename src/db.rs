//! Persistence Bootstrap
//! Mission: open the single SQLite file this process uses and hand out one
//! shared, mutex-guarded connection to every store — cache, ledger, and
//! auth alike. No migration framework: every table is created idempotently
//! via `CREATE TABLE IF NOT EXISTS`.

use anyhow::Result;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedConnection = Arc<Mutex<Connection>>;

pub fn open(database_path: &str) -> Result<SharedConnection> {
    let conn = Connection::open(database_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
pub fn open_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    Ok(Arc::new(Mutex::new(conn)))
}
