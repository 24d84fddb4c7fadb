use rusqlite::Connection;

use crate::error::RemoteError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), RemoteError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO _mutq_schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Bookkeeping tables. User tables live alongside them; names starting with
/// `_mutq_` are reserved.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS _mutq_schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _mutq_tables (
    table_id BLOB PRIMARY KEY CHECK (length(table_id) = 16),
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS _mutq_columns (
    column_id BLOB PRIMARY KEY CHECK (length(column_id) = 16),
    table_id BLOB NOT NULL CHECK (length(table_id) = 16),
    name TEXT NOT NULL,
    data_type TEXT NOT NULL,
    nullable INTEGER NOT NULL,
    default_value BLOB,
    position INTEGER NOT NULL,
    UNIQUE (table_id, name)
);

CREATE TABLE IF NOT EXISTS _mutq_rows (
    temp_row_id BLOB PRIMARY KEY CHECK (length(temp_row_id) = 16),
    table_id BLOB NOT NULL CHECK (length(table_id) = 16),
    row_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _mutq_batches (
    batch_id BLOB PRIMARY KEY CHECK (length(batch_id) = 16),
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    op_count INTEGER NOT NULL,
    applied_count INTEGER NOT NULL,
    received_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);

CREATE TABLE IF NOT EXISTS _mutq_applied_ops (
    op_id BLOB PRIMARY KEY CHECK (length(op_id) = 16),
    batch_id BLOB NOT NULL CHECK (length(batch_id) = 16),
    position INTEGER NOT NULL,
    op_type TEXT NOT NULL,
    seq BLOB NOT NULL CHECK (length(seq) = 8)
);
CREATE INDEX IF NOT EXISTS idx_applied_ops_batch ON _mutq_applied_ops (batch_id, position);
";
