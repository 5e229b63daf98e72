use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    title         TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    owner_id      INTEGER NOT NULL,
    file_name     TEXT NOT NULL,               -- name supplied by the uploader
    stored_name   TEXT NOT NULL UNIQUE,        -- file name in the content directory
    mime_type     TEXT,
    file_size     INTEGER NOT NULL,
    file_digest   TEXT NOT NULL,               -- hex SHA-256 of the whole file
    piece_size    INTEGER NOT NULL,
    piece_count   INTEGER NOT NULL,
    piece_digests TEXT NOT NULL,               -- comma-separated hex SHA-256, piece order
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resources_digest ON resources(file_digest);

CREATE TABLE IF NOT EXISTS skill_resources (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    skill_name  TEXT NOT NULL,
    owner_id    INTEGER NOT NULL,
    resource_id INTEGER NOT NULL,
    is_public   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (resource_id) REFERENCES resources(id) ON DELETE CASCADE,
    UNIQUE (skill_name, owner_id, resource_id)
);

CREATE TABLE IF NOT EXISTS peer_participation (
    user_id       INTEGER NOT NULL,
    resource_id   INTEGER NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('seeding', 'leeching', 'completed')),
    progress      REAL NOT NULL DEFAULT 0,
    last_announce TEXT NOT NULL,

    PRIMARY KEY (user_id, resource_id),
    FOREIGN KEY (resource_id) REFERENCES resources(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participation_resource
    ON peer_participation(resource_id, last_announce DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
