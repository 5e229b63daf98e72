use chrono::{DateTime, Utc};
use rusqlite::params;

use skillswap_shared::{PeerInfo, PeerStatus, ResourceId, SwarmStats, UserId};

use crate::database::{conversion_error, Database};
use crate::error::Result;
use crate::models::{from_db_timestamp, to_db_timestamp, PeerParticipation};

/// Active seeder/leecher counts across every swarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GlobalSwarmCounts {
    pub resources: i64,
    pub active_seeders: i64,
    pub active_leechers: i64,
}

impl Database {
    /// Insert or replace the `(user, resource)` participation row.
    pub fn upsert_participation(&self, p: &PeerParticipation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO peer_participation (user_id, resource_id, status, progress, last_announce)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id, resource_id) DO UPDATE SET
                 status = excluded.status,
                 progress = excluded.progress,
                 last_announce = excluded.last_announce",
            params![
                p.user_id.0,
                p.resource_id.0,
                p.status.as_str(),
                p.progress,
                to_db_timestamp(&p.last_announce),
            ],
        )?;
        Ok(())
    }

    /// Aggregate counts for one resource. With `since`, only participants
    /// whose last announce is at or after the cutoff are counted.
    pub fn swarm_stats(
        &self,
        resource_id: ResourceId,
        since: Option<DateTime<Utc>>,
    ) -> Result<SwarmStats> {
        let cutoff = since.as_ref().map(to_db_timestamp);

        let (seeders, leechers, completed): (i64, i64, i64) = self.conn().query_row(
            "SELECT
                 COALESCE(SUM(status = 'seeding'), 0),
                 COALESCE(SUM(status = 'leeching'), 0),
                 COALESCE(SUM(status = 'completed'), 0)
             FROM peer_participation
             WHERE resource_id = ?1
               AND (?2 IS NULL OR last_announce >= ?2)",
            params![resource_id.0, cutoff],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let total_size: i64 = self
            .conn()
            .query_row(
                "SELECT file_size FROM resources WHERE id = ?1",
                params![resource_id.0],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(other),
            })?;

        Ok(SwarmStats {
            resource_id,
            seeders: seeders as u32,
            leechers: leechers as u32,
            completed: completed as u32,
            total_size,
        })
    }

    /// Participants of a swarm with display names, most recent first.
    pub fn peers_for_resource(&self, resource_id: ResourceId) -> Result<Vec<PeerInfo>> {
        let mut stmt = self.conn().prepare(
            "SELECT p.user_id, u.display_name, p.status, p.progress, p.last_announce
             FROM peer_participation p
             LEFT JOIN users u ON u.id = p.user_id
             WHERE p.resource_id = ?1
             ORDER BY p.last_announce DESC, p.user_id ASC",
        )?;

        let rows = stmt.query_map(params![resource_id.0], |row| {
            let status: String = row.get(2)?;
            let ts_str: String = row.get(4)?;
            Ok(PeerInfo {
                user_id: UserId(row.get(0)?),
                display_name: row.get(1)?,
                status: status
                    .parse::<PeerStatus>()
                    .map_err(|e| conversion_error(2, e))?,
                progress: row.get(3)?,
                last_seen: from_db_timestamp(&ts_str).map_err(|e| conversion_error(4, e))?,
            })
        })?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    /// Counts across all swarms, restricted to participants announced at or
    /// after `since`.
    pub fn global_swarm_counts(&self, since: DateTime<Utc>) -> Result<GlobalSwarmCounts> {
        let cutoff = to_db_timestamp(&since);
        let resources = self.count_resources()?;

        let (active_seeders, active_leechers): (i64, i64) = self.conn().query_row(
            "SELECT
                 COALESCE(SUM(status = 'seeding'), 0),
                 COALESCE(SUM(status = 'leeching'), 0)
             FROM peer_participation
             WHERE last_announce >= ?1",
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(GlobalSwarmCounts {
            resources,
            active_seeders,
            active_leechers,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::resources::tests::sample;

    fn announce(
        db: &Database,
        user: i64,
        resource_id: ResourceId,
        status: PeerStatus,
        at: DateTime<Utc>,
    ) {
        db.upsert_participation(&PeerParticipation {
            user_id: UserId(user),
            resource_id,
            status,
            progress: if status == PeerStatus::Leeching { 40.0 } else { 100.0 },
            last_announce: at,
        })
        .unwrap();
    }

    #[test]
    fn upsert_replaces_previous_role() {
        let db = Database::open_in_memory().unwrap();
        let res = db.insert_resource(&sample(1, "r")).unwrap();
        let now = Utc::now();

        announce(&db, 2, res.id, PeerStatus::Leeching, now);
        announce(&db, 2, res.id, PeerStatus::Seeding, now);

        let stats = db.swarm_stats(res.id, None).unwrap();
        assert_eq!((stats.seeders, stats.leechers), (1, 0));
        assert_eq!(stats.total_size, 10);

        let peers = db.peers_for_resource(res.id).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Seeding);
    }

    #[test]
    fn stale_rows_excluded_with_cutoff() {
        let db = Database::open_in_memory().unwrap();
        let res = db.insert_resource(&sample(1, "r")).unwrap();
        let now = Utc::now();

        announce(&db, 2, res.id, PeerStatus::Seeding, now - Duration::hours(3));
        announce(&db, 3, res.id, PeerStatus::Leeching, now);
        announce(&db, 4, res.id, PeerStatus::Completed, now);

        let all = db.swarm_stats(res.id, None).unwrap();
        assert_eq!((all.seeders, all.leechers, all.completed), (1, 1, 1));

        let active = db
            .swarm_stats(res.id, Some(now - Duration::hours(1)))
            .unwrap();
        assert_eq!((active.seeders, active.leechers), (0, 1));

        let global = db.global_swarm_counts(now - Duration::hours(1)).unwrap();
        assert_eq!(global.resources, 1);
        assert_eq!(global.active_seeders, 0);
        assert_eq!(global.active_leechers, 1);
    }

    #[test]
    fn peers_joined_with_display_names() {
        let db = Database::open_in_memory().unwrap();
        let res = db.insert_resource(&sample(1, "r")).unwrap();
        db.upsert_user(UserId(2), Some("ada")).unwrap();
        let now = Utc::now();

        announce(&db, 2, res.id, PeerStatus::Seeding, now - Duration::minutes(5));
        announce(&db, 3, res.id, PeerStatus::Leeching, now);

        let peers = db.peers_for_resource(res.id).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].user_id, UserId(3));
        assert_eq!(peers[0].display_name, None);
        assert_eq!(peers[1].display_name.as_deref(), Some("ada"));
    }

    #[test]
    fn empty_swarm_is_zero() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.swarm_stats(ResourceId(5), None).unwrap();
        assert_eq!(stats, SwarmStats {
            resource_id: ResourceId(5),
            ..SwarmStats::default()
        });
    }
}
