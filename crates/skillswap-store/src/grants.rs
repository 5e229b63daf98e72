use chrono::Utc;
use rusqlite::params;

use skillswap_shared::{GrantStatus, UserId};

use crate::database::{conversion_error, not_found, Database};
use crate::error::{Result, StoreError};
use crate::models::{from_db_timestamp, to_db_timestamp, AccessGrant, SkillConnection};

const GRANT_COLUMNS: &str =
    "id, requester_id, owner_id, skill_name, message, status, created_at, updated_at";

/// Which side of a grant a listing is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDirection {
    Sent,
    Received,
}

impl Database {
    /// Open a pending grant. A second pending request for the same
    /// `(requester, owner, skill)` is a conflict.
    pub fn create_grant(
        &self,
        requester_id: UserId,
        owner_id: UserId,
        skill_name: &str,
        message: &str,
    ) -> Result<AccessGrant> {
        let pending: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM access_grants
             WHERE requester_id = ?1 AND owner_id = ?2 AND skill_name = ?3
               AND status = 'pending'",
            params![requester_id.0, owner_id.0, skill_name],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Err(StoreError::Conflict(format!(
                "a pending request for '{skill_name}' already exists"
            )));
        }

        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO access_grants
                 (requester_id, owner_id, skill_name, message, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![
                requester_id.0,
                owner_id.0,
                skill_name,
                message,
                to_db_timestamp(&now),
            ],
        )?;

        Ok(AccessGrant {
            id: self.conn().last_insert_rowid(),
            requester_id,
            owner_id,
            skill_name: skill_name.to_string(),
            message: message.to_string(),
            status: GrantStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_grant(&self, id: i64) -> Result<AccessGrant> {
        self.conn()
            .query_row(
                &format!("SELECT {GRANT_COLUMNS} FROM access_grants WHERE id = ?1"),
                params![id],
                row_to_grant,
            )
            .map_err(not_found)
    }

    /// Move a pending grant to `to`. Grants that already left `pending`
    /// are a conflict.
    pub fn transition_grant(&self, id: i64, to: GrantStatus) -> Result<AccessGrant> {
        let changed = self.conn().execute(
            "UPDATE access_grants SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, to.as_str(), to_db_timestamp(&Utc::now())],
        )?;

        if changed == 0 {
            let current = self.get_grant(id)?;
            return Err(StoreError::Conflict(format!(
                "grant {id} is already {}",
                current.status
            )));
        }

        self.get_grant(id)
    }

    pub fn list_grants(
        &self,
        user_id: UserId,
        direction: GrantDirection,
    ) -> Result<Vec<AccessGrant>> {
        let column = match direction {
            GrantDirection::Sent => "requester_id",
            GrantDirection::Received => "owner_id",
        };

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GRANT_COLUMNS} FROM access_grants WHERE {column} = ?1 ORDER BY id DESC"
        ))?;

        let rows = stmt.query_map(params![user_id.0], row_to_grant)?;

        let mut grants = Vec::new();
        for row in rows {
            grants.push(row?);
        }
        Ok(grants)
    }

    /// Whether an approved grant for `skill_name` links the two users, in
    /// either direction.
    pub fn approved_grant_exists(&self, a: UserId, b: UserId, skill_name: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM access_grants
             WHERE status = 'approved' AND skill_name = ?3
               AND ((requester_id = ?1 AND owner_id = ?2)
                 OR (requester_id = ?2 AND owner_id = ?1))",
            params![a.0, b.0, skill_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Skills for which `user_id` holds an approved grant on either side,
    /// with the oldest such grant per skill.
    pub fn skill_connections(&self, user_id: UserId) -> Result<Vec<SkillConnection>> {
        let mut stmt = self.conn().prepare(
            "SELECT skill_name, MIN(id) FROM access_grants
             WHERE status = 'approved' AND (requester_id = ?1 OR owner_id = ?1)
             GROUP BY skill_name
             ORDER BY skill_name",
        )?;

        let rows = stmt.query_map(params![user_id.0], |row| {
            Ok(SkillConnection {
                skill_name: row.get(0)?,
                grant_id: row.get(1)?,
            })
        })?;

        let mut connections = Vec::new();
        for row in rows {
            connections.push(row?);
        }
        Ok(connections)
    }
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessGrant> {
    let status: String = row.get(5)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;

    Ok(AccessGrant {
        id: row.get(0)?,
        requester_id: UserId(row.get(1)?),
        owner_id: UserId(row.get(2)?),
        skill_name: row.get(3)?,
        message: row.get(4)?,
        status: status.parse().map_err(|e| conversion_error(5, e))?,
        created_at: from_db_timestamp(&created).map_err(|e| conversion_error(6, e))?,
        updated_at: from_db_timestamp(&updated).map_err(|e| conversion_error(7, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_pending_to_approved() {
        let db = Database::open_in_memory().unwrap();
        let grant = db.create_grant(UserId(2), UserId(1), "guitar", "hi").unwrap();
        assert_eq!(grant.status, GrantStatus::Pending);
        assert!(!db.approved_grant_exists(UserId(2), UserId(1), "guitar").unwrap());

        let approved = db.transition_grant(grant.id, GrantStatus::Approved).unwrap();
        assert_eq!(approved.status, GrantStatus::Approved);
        assert!(db.approved_grant_exists(UserId(1), UserId(2), "guitar").unwrap());
        assert!(!db.approved_grant_exists(UserId(1), UserId(2), "piano").unwrap());

        assert!(matches!(
            db.transition_grant(grant.id, GrantStatus::Rejected),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn connections_grouped_by_skill() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_grant(UserId(2), UserId(1), "guitar", "").unwrap();
        let b = db.create_grant(UserId(1), UserId(3), "guitar", "").unwrap();
        let c = db.create_grant(UserId(4), UserId(1), "welding", "").unwrap();
        db.create_grant(UserId(5), UserId(1), "baking", "").unwrap();
        for id in [a.id, b.id, c.id] {
            db.transition_grant(id, GrantStatus::Approved).unwrap();
        }

        let connections = db.skill_connections(UserId(1)).unwrap();
        assert_eq!(
            connections,
            vec![
                SkillConnection {
                    skill_name: "guitar".into(),
                    grant_id: a.id
                },
                SkillConnection {
                    skill_name: "welding".into(),
                    grant_id: c.id
                },
            ]
        );
        assert!(db.skill_connections(UserId(9)).unwrap().is_empty());
    }

    #[test]
    fn duplicate_pending_conflicts() {
        let db = Database::open_in_memory().unwrap();
        let first = db.create_grant(UserId(2), UserId(1), "guitar", "").unwrap();
        assert!(matches!(
            db.create_grant(UserId(2), UserId(1), "guitar", ""),
            Err(StoreError::Conflict(_))
        ));

        db.transition_grant(first.id, GrantStatus::Cancelled).unwrap();
        db.create_grant(UserId(2), UserId(1), "guitar", "again").unwrap();
    }

    #[test]
    fn list_by_direction() {
        let db = Database::open_in_memory().unwrap();
        db.create_grant(UserId(2), UserId(1), "guitar", "").unwrap();
        db.create_grant(UserId(3), UserId(1), "piano", "").unwrap();

        assert_eq!(db.list_grants(UserId(1), GrantDirection::Received).unwrap().len(), 2);
        assert_eq!(db.list_grants(UserId(1), GrantDirection::Sent).unwrap().len(), 0);
        assert_eq!(db.list_grants(UserId(3), GrantDirection::Sent).unwrap().len(), 1);
    }

    #[test]
    fn transition_unknown_grant_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.transition_grant(99, GrantStatus::Approved),
            Err(StoreError::NotFound)
        ));
    }
}
