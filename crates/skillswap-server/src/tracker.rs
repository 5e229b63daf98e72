use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use skillswap_shared::{PeerInfo, PeerStatus, ResourceId, SwarmStats, UserId};
use skillswap_store::{PeerParticipation, StoreError};

use crate::db::{with_db, SharedDb};
use crate::error::ServerError;

/// Totals across every swarm, counting only recently announced peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total_resources: i64,
    pub active_seeders: i64,
    pub active_leechers: i64,
}

#[derive(Clone)]
pub struct SwarmTracker {
    db: SharedDb,
    stale_after: Duration,
}

impl SwarmTracker {
    pub fn new(db: SharedDb, stale_after: Duration) -> Self {
        Self { db, stale_after }
    }

    /// Record a peer's role and progress, then return the fresh counters.
    pub fn announce(
        &self,
        user_id: UserId,
        resource_id: ResourceId,
        status: PeerStatus,
        progress: f64,
    ) -> Result<SwarmStats, ServerError> {
        if !user_id.is_valid() {
            return Err(ServerError::Validation("user_id is required".into()));
        }
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            return Err(ServerError::Validation(format!(
                "progress must be within 0..=100, got {progress}"
            )));
        }

        let stats = with_db(&self.db, |db| {
            match db.get_resource(resource_id) {
                Ok(_) => {}
                Err(StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            }
            db.upsert_participation(&PeerParticipation {
                user_id,
                resource_id,
                status,
                progress,
                last_announce: Utc::now(),
            })?;
            db.swarm_stats(resource_id, None).map(Some)
        })?
        .ok_or_else(|| ServerError::NotFound(format!("resource {resource_id}")))?;

        debug!(
            user = %user_id,
            resource_id = %resource_id,
            %status,
            progress,
            seeders = stats.seeders,
            leechers = stats.leechers,
            "Peer announced"
        );
        Ok(stats)
    }

    pub fn peers_of(&self, resource_id: ResourceId) -> Result<Vec<PeerInfo>, ServerError> {
        with_db(&self.db, |db| db.peers_for_resource(resource_id))
    }

    pub fn stats(&self, resource_id: ResourceId) -> Result<SwarmStats, ServerError> {
        with_db(&self.db, |db| db.swarm_stats(resource_id, None))
    }

    /// Like [`stats`](Self::stats) but ignoring peers past the staleness window.
    pub fn active_stats(&self, resource_id: ResourceId) -> Result<SwarmStats, ServerError> {
        let cutoff = self.cutoff();
        with_db(&self.db, |db| db.swarm_stats(resource_id, Some(cutoff)))
    }

    pub fn global_stats(&self) -> Result<GlobalStats, ServerError> {
        let cutoff = self.cutoff();
        let counts = with_db(&self.db, |db| db.global_swarm_counts(cutoff))?;
        Ok(GlobalStats {
            total_resources: counts.resources,
            active_seeders: counts.active_seeders,
            active_leechers: counts.active_leechers,
        })
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Utc::now() - window
    }
}
