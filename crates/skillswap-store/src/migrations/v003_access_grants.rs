use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Approved skill connections gate resource access for non-owners
CREATE TABLE IF NOT EXISTS access_grants (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    requester_id INTEGER NOT NULL,
    owner_id     INTEGER NOT NULL,
    skill_name   TEXT NOT NULL,
    message      TEXT NOT NULL DEFAULT '',
    status       TEXT NOT NULL DEFAULT 'pending'
                 CHECK (status IN ('pending', 'approved', 'rejected', 'cancelled')),
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_grants_pair ON access_grants(requester_id, owner_id, skill_name);
CREATE INDEX IF NOT EXISTS idx_grants_owner ON access_grants(owner_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
