use chrono::Utc;
use rusqlite::params;

use skillswap_shared::{ResourceId, UserId};

use crate::database::{conversion_error, not_found, Database};
use crate::error::Result;
use crate::models::{from_db_timestamp, to_db_timestamp, NewResource, Resource};

/// Resource columns under the `r` alias, in `row_to_resource` order.
pub(crate) const RESOURCE_COLUMNS: &str = "r.id, r.title, r.description, r.owner_id, \
     r.file_name, r.stored_name, r.mime_type, r.file_size, r.file_digest, r.piece_size, \
     r.piece_count, r.piece_digests, r.created_at";

impl Database {
    /// Insert a resource row. `piece_count` is derived from the digest list.
    pub fn insert_resource(&self, new: &NewResource) -> Result<Resource> {
        let created_at = Utc::now();
        let piece_count = new.piece_digests.len() as i64;

        self.conn().execute(
            "INSERT INTO resources (title, description, owner_id, file_name, stored_name,
                                    mime_type, file_size, file_digest, piece_size,
                                    piece_count, piece_digests, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                new.title,
                new.description,
                new.owner_id.0,
                new.file_name,
                new.stored_name,
                new.mime_type,
                new.file_size,
                new.file_digest,
                new.piece_size,
                piece_count,
                new.piece_digests.join(","),
                to_db_timestamp(&created_at),
            ],
        )?;

        let id = ResourceId(self.conn().last_insert_rowid());
        tracing::debug!(resource_id = %id, pieces = piece_count, "resource row inserted");

        Ok(Resource {
            id,
            title: new.title.clone(),
            description: new.description.clone(),
            owner_id: new.owner_id,
            file_name: new.file_name.clone(),
            stored_name: new.stored_name.clone(),
            mime_type: new.mime_type.clone(),
            file_size: new.file_size,
            file_digest: new.file_digest.clone(),
            piece_size: new.piece_size,
            piece_count,
            piece_digests: new.piece_digests.clone(),
            created_at,
        })
    }

    pub fn get_resource(&self, id: ResourceId) -> Result<Resource> {
        self.conn()
            .query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources r WHERE r.id = ?1"),
                params![id.0],
                |row| row_to_resource(row, 0),
            )
            .map_err(not_found)
    }

    /// Resources `viewer` may see listed, newest first: their own uploads
    /// plus anything linked to a public skill. `owner` narrows the listing
    /// to one uploader.
    pub fn visible_resources(&self, viewer: UserId, owner: Option<UserId>) -> Result<Vec<Resource>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources r
             WHERE (?2 IS NULL OR r.owner_id = ?2)
               AND (r.owner_id = ?1 OR EXISTS (
                   SELECT 1 FROM skill_resources s
                   WHERE s.resource_id = r.id AND s.is_public = 1))
             ORDER BY r.id DESC"
        ))?;

        let rows = stmt.query_map(params![viewer.0, owner.map(|o| o.0)], |row| {
            row_to_resource(row, 0)
        })?;

        let mut resources = Vec::new();
        for row in rows {
            resources.push(row?);
        }
        Ok(resources)
    }

    pub fn count_resources(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Map the [`RESOURCE_COLUMNS`] that start at column `at`.
pub(crate) fn row_to_resource(row: &rusqlite::Row<'_>, at: usize) -> rusqlite::Result<Resource> {
    let digests: String = row.get(at + 11)?;
    let ts_str: String = row.get(at + 12)?;

    let piece_digests = if digests.is_empty() {
        Vec::new()
    } else {
        digests.split(',').map(str::to_string).collect()
    };
    let created_at = from_db_timestamp(&ts_str).map_err(|e| conversion_error(at + 12, e))?;

    Ok(Resource {
        id: ResourceId(row.get(at)?),
        title: row.get(at + 1)?,
        description: row.get(at + 2)?,
        owner_id: UserId(row.get(at + 3)?),
        file_name: row.get(at + 4)?,
        stored_name: row.get(at + 5)?,
        mime_type: row.get(at + 6)?,
        file_size: row.get(at + 7)?,
        file_digest: row.get(at + 8)?,
        piece_size: row.get(at + 9)?,
        piece_count: row.get(at + 10)?,
        piece_digests,
        created_at,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::StoreError;

    pub(crate) fn sample(owner: i64, stored_name: &str) -> NewResource {
        NewResource {
            title: "Rust ownership notes".into(),
            description: "slides".into(),
            owner_id: UserId(owner),
            file_name: "notes.pdf".into(),
            stored_name: stored_name.into(),
            mime_type: Some("application/pdf".into()),
            file_size: 10,
            file_digest: "ab".repeat(32),
            piece_size: 4,
            piece_digests: vec!["01".repeat(32), "02".repeat(32), "03".repeat(32)],
        }
    }

    #[test]
    fn insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let created = db.insert_resource(&sample(7, "a")).unwrap();
        assert_eq!(created.piece_count, 3);

        let loaded = db.get_resource(created.id).unwrap();
        assert_eq!(loaded.piece_digests, created.piece_digests);
        assert_eq!(loaded.stored_name, "a");
        assert_eq!(loaded.owner_id, UserId(7));
        assert_eq!(db.count_resources().unwrap(), 1);
    }

    #[test]
    fn duplicate_stored_name_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_resource(&sample(1, "same")).unwrap();
        assert!(db.insert_resource(&sample(1, "same")).is_err());
    }

    #[test]
    fn listing_shows_own_and_public() {
        let db = Database::open_in_memory().unwrap();
        let mine = db.insert_resource(&sample(3, "x")).unwrap();
        let private = db.insert_resource(&sample(4, "y")).unwrap();
        let public = db.insert_resource(&sample(4, "z")).unwrap();
        db.link_skill("pottery", UserId(4), private.id, false).unwrap();
        db.link_skill("pottery", UserId(4), public.id, true).unwrap();

        let ids = |viewer: i64, owner: Option<i64>| -> Vec<ResourceId> {
            db.visible_resources(UserId(viewer), owner.map(UserId))
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect()
        };

        assert_eq!(ids(3, None), vec![public.id, mine.id]);
        assert_eq!(ids(3, Some(4)), vec![public.id]);
        assert_eq!(ids(4, None), vec![public.id, private.id]);
    }

    #[test]
    fn unknown_resource_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_resource(ResourceId(42)),
            Err(StoreError::NotFound)
        ));
    }
}
