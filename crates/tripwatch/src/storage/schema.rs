//! `SQLite` schema definitions for the record buffer.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the encrypted records table.
pub const CREATE_RECORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at INTEGER NOT NULL,
    tier TEXT NOT NULL,
    key_fingerprint TEXT NOT NULL DEFAULT '',
    ciphertext BLOB NOT NULL,
    iv BLOB NOT NULL,
    salt BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create an index for per-tier, time-ordered scans.
pub const CREATE_TIER_TIME_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_tier_time ON records(tier, captured_at)
";

/// SQL statement to create the persisted retry queue.
pub const CREATE_RETRY_BATCHES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS retry_batches (
    key TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    enqueued_at INTEGER NOT NULL,
    payload TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Layout used by schema version 1, before tiers had their own column.
///
/// Only read by the version 2 migration.
pub const LEGACY_POSITIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    captured_at TEXT NOT NULL,
    is_offline INTEGER NOT NULL DEFAULT 0,
    ciphertext BLOB NOT NULL,
    iv BLOB NOT NULL,
    salt BLOB NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_RECORDS_TABLE,
    CREATE_TIER_TIME_INDEX,
    CREATE_RETRY_BATCHES_TABLE,
    CREATE_METADATA_TABLE,
];
