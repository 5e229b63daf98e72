use chrono::Utc;
use rusqlite::params;

use skillswap_shared::{ResourceId, UserId};

use crate::database::{conversion_error, Database};
use crate::error::{Result, StoreError};
use crate::models::{from_db_timestamp, to_db_timestamp, SkillLink, SkillResource};
use crate::resources::{row_to_resource, RESOURCE_COLUMNS};

impl Database {
    /// List a resource under one of its owner's skills.
    ///
    /// The same `(skill, owner, resource)` triple may only be linked once.
    pub fn link_skill(
        &self,
        skill_name: &str,
        owner_id: UserId,
        resource_id: ResourceId,
        is_public: bool,
    ) -> Result<SkillLink> {
        let created_at = Utc::now();

        let inserted = self.conn().execute(
            "INSERT INTO skill_resources (skill_name, owner_id, resource_id, is_public, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                skill_name,
                owner_id.0,
                resource_id.0,
                is_public as i32,
                to_db_timestamp(&created_at),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict(format!(
                    "resource {resource_id} already linked to skill '{skill_name}'"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(SkillLink {
            id: self.conn().last_insert_rowid(),
            skill_name: skill_name.to_string(),
            owner_id,
            resource_id,
            is_public,
            created_at,
        })
    }

    /// Distinct skill names a resource is listed under.
    pub fn skills_for_resource(&self, resource_id: ResourceId) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT skill_name FROM skill_resources
             WHERE resource_id = ?1
             ORDER BY skill_name",
        )?;

        let rows = stmt.query_map(params![resource_id.0], |row| row.get::<_, String>(0))?;

        let mut skills = Vec::new();
        for row in rows {
            skills.push(row?);
        }
        Ok(skills)
    }

    /// Resources listed under `skill_name` that `viewer` may browse: their
    /// own links plus public ones, newest resource first.
    pub fn skill_resources(&self, skill_name: &str, viewer: UserId) -> Result<Vec<SkillResource>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT s.skill_name, s.is_public, u.display_name, {RESOURCE_COLUMNS}
             FROM skill_resources s
             JOIN resources r ON r.id = s.resource_id
             LEFT JOIN users u ON u.id = s.owner_id
             WHERE s.skill_name = ?1 AND (s.owner_id = ?2 OR s.is_public = 1)
             ORDER BY r.id DESC"
        ))?;

        let rows = stmt.query_map(params![skill_name, viewer.0], |row| {
            let is_public: i32 = row.get(1)?;
            Ok(SkillResource {
                skill_name: row.get(0)?,
                is_public: is_public != 0,
                owner_name: row.get(2)?,
                resource: row_to_resource(row, 3)?,
            })
        })?;

        let mut listed = Vec::new();
        for row in rows {
            listed.push(row?);
        }
        Ok(listed)
    }

    pub fn skill_links_for_owner(&self, owner_id: UserId) -> Result<Vec<SkillLink>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, skill_name, owner_id, resource_id, is_public, created_at
             FROM skill_resources
             WHERE owner_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![owner_id.0], |row| {
            let is_public: i32 = row.get(4)?;
            let ts_str: String = row.get(5)?;
            Ok(SkillLink {
                id: row.get(0)?,
                skill_name: row.get(1)?,
                owner_id: UserId(row.get(2)?),
                resource_id: ResourceId(row.get(3)?),
                is_public: is_public != 0,
                created_at: from_db_timestamp(&ts_str).map_err(|e| conversion_error(5, e))?,
            })
        })?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }
}
