//! v001 -- Initial schema creation.
//!
//! Creates `users` (read-only mirror of the profile subsystem's identities)
//! and `messages` (direct chat with the delivered flag).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (owned by the profile subsystem)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY NOT NULL,
    display_name TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, microseconds, UTC
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id   INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    content     TEXT,                          -- NULL for file messages
    file_id     INTEGER,                       -- NULL for text messages
    delivered   INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    created_at  TEXT NOT NULL,

    CHECK ((content IS NULL) <> (file_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_pending
    ON messages(receiver_id, delivered, id);
CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(sender_id, receiver_id, id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
