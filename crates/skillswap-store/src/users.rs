use chrono::Utc;
use rusqlite::params;

use skillswap_shared::UserId;

use crate::database::{conversion_error, not_found, Database};
use crate::error::Result;
use crate::models::{from_db_timestamp, to_db_timestamp, User};

impl Database {
    /// Record a user id, updating the display name when one is given.
    pub fn upsert_user(&self, id: UserId, display_name: Option<&str>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET
                 display_name = COALESCE(excluded.display_name, users.display_name)",
            params![id.0, display_name, to_db_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, created_at FROM users WHERE id = ?1",
                params![id.0],
                |row| {
                    let ts_str: String = row.get(2)?;
                    Ok(User {
                        id: UserId(row.get(0)?),
                        display_name: row.get(1)?,
                        created_at: from_db_timestamp(&ts_str)
                            .map_err(|e| conversion_error(2, e))?,
                    })
                },
            )
            .map_err(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_name_when_absent() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(UserId(5), Some("grace")).unwrap();
        db.upsert_user(UserId(5), None).unwrap();
        assert_eq!(
            db.get_user(UserId(5)).unwrap().display_name.as_deref(),
            Some("grace")
        );

        db.upsert_user(UserId(5), Some("hopper")).unwrap();
        assert_eq!(
            db.get_user(UserId(5)).unwrap().display_name.as_deref(),
            Some("hopper")
        );
    }
}
