//! v001 -- Initial schema creation.
//!
//! Creates the `kv` table that holds per-bucket history records.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Key-value records
-- key:   conversation.<conversation id>.bucket.<bucket number>
-- value: JSON {"mode": "count"|"hashes", "payload": ...}
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
