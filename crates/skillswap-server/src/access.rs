//! Resource entitlement checks and the access-grant lifecycle behind them.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use skillswap_shared::{GrantStatus, ResourceId, UserId};
use skillswap_store::{
    AccessGrant, GrantDirection, Resource, SkillConnection, SkillLink, SkillResource, StoreError,
};

use crate::db::{with_db, SharedDb};
use crate::error::ServerError;

/// How many resources an owner lists under one skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillCount {
    pub skill_name: String,
    pub resource_count: usize,
}

#[derive(Clone)]
pub struct AccessGate {
    db: SharedDb,
}

impl AccessGate {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Whether `user_id` may see `resource_id`.
    ///
    /// Owners always may. Anyone else needs an approved grant with the owner
    /// for the single skill the resource is listed under.
    pub fn authorize(&self, user_id: UserId, resource_id: ResourceId) -> Result<bool, ServerError> {
        self.check(user_id, resource_id).map(|(_, allowed)| allowed)
    }

    /// Like [`authorize`](Self::authorize), but denial is an error and the
    /// resource comes back on success.
    pub fn require(&self, user_id: UserId, resource_id: ResourceId) -> Result<Resource, ServerError> {
        match self.check(user_id, resource_id)? {
            (resource, true) => Ok(resource),
            (_, false) => Err(ServerError::Forbidden(format!(
                "no access to resource {resource_id}"
            ))),
        }
    }

    fn check(&self, user_id: UserId, resource_id: ResourceId) -> Result<(Resource, bool), ServerError> {
        with_db(&self.db, |db| {
            let resource = match db.get_resource(resource_id) {
                Ok(r) => r,
                Err(StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            };

            if resource.owner_id == user_id {
                return Ok(Some((resource, true)));
            }

            let skills = db.skills_for_resource(resource_id)?;
            let allowed = match skills.as_slice() {
                [] => false,
                [skill] => db.approved_grant_exists(user_id, resource.owner_id, skill)?,
                many => {
                    warn!(
                        resource_id = %resource_id,
                        skills = many.len(),
                        "Resource linked to several skills, denying non-owner access"
                    );
                    false
                }
            };
            Ok(Some((resource, allowed)))
        })?
        .ok_or_else(|| ServerError::NotFound(format!("resource {resource_id}")))
    }

    /// List a resource under one of its owner's skills.
    pub fn link_skill(
        &self,
        owner_id: UserId,
        skill_name: &str,
        resource_id: ResourceId,
        is_public: bool,
    ) -> Result<SkillLink, ServerError> {
        let skill_name = skill_name.trim();
        if skill_name.is_empty() {
            return Err(ServerError::Validation("skill_name is required".into()));
        }

        let resource = with_db(&self.db, |db| db.get_resource(resource_id))
            .map_err(|e| not_found_as(e, format!("resource {resource_id}")))?;
        if resource.owner_id != owner_id {
            return Err(ServerError::Forbidden(
                "only the owner can link a resource to a skill".into(),
            ));
        }

        let link = with_db(&self.db, |db| {
            db.link_skill(skill_name, owner_id, resource_id, is_public)
        })?;
        info!(resource_id = %resource_id, skill = %skill_name, "Resource linked to skill");
        Ok(link)
    }

    /// Ask `owner_id` for access to their `skill_name` resources.
    pub fn request(
        &self,
        requester_id: UserId,
        owner_id: UserId,
        skill_name: &str,
        message: &str,
    ) -> Result<AccessGrant, ServerError> {
        let skill_name = skill_name.trim();
        if !requester_id.is_valid() || !owner_id.is_valid() || skill_name.is_empty() {
            return Err(ServerError::Validation(
                "requester_id, owner_id and skill_name are required".into(),
            ));
        }
        if requester_id == owner_id {
            return Err(ServerError::Validation(
                "cannot request access from yourself".into(),
            ));
        }

        let grant = with_db(&self.db, |db| {
            db.create_grant(requester_id, owner_id, skill_name, message)
        })?;
        info!(grant = grant.id, requester = %requester_id, owner = %owner_id, "Access requested");
        Ok(grant)
    }

    /// Owner approves or rejects a pending grant.
    pub fn respond(&self, grant_id: i64, user_id: UserId, approve: bool) -> Result<AccessGrant, ServerError> {
        let grant = self.grant(grant_id)?;
        if grant.owner_id != user_id {
            return Err(ServerError::Forbidden(
                "only the owner can respond to this request".into(),
            ));
        }

        let to = if approve {
            GrantStatus::Approved
        } else {
            GrantStatus::Rejected
        };
        let updated = with_db(&self.db, |db| db.transition_grant(grant_id, to))?;
        info!(grant = grant_id, status = %updated.status, "Access request answered");
        Ok(updated)
    }

    /// Requester withdraws a pending grant.
    pub fn cancel(&self, grant_id: i64, user_id: UserId) -> Result<AccessGrant, ServerError> {
        let grant = self.grant(grant_id)?;
        if grant.requester_id != user_id {
            return Err(ServerError::Forbidden(
                "only the requester can cancel this request".into(),
            ));
        }
        with_db(&self.db, |db| db.transition_grant(grant_id, GrantStatus::Cancelled))
    }

    pub fn list(&self, user_id: UserId, direction: GrantDirection) -> Result<Vec<AccessGrant>, ServerError> {
        with_db(&self.db, |db| db.list_grants(user_id, direction))
    }

    /// Resources `viewer` may see in a listing: their own and anything
    /// linked to a public skill. Listing never grants piece access.
    pub fn catalog(&self, viewer: UserId, owner: Option<UserId>) -> Result<Vec<Resource>, ServerError> {
        require_user(viewer)?;
        with_db(&self.db, |db| db.visible_resources(viewer, owner))
    }

    /// `viewer`'s own and everyone's public resources under `skill_name`.
    pub fn skill_resources(&self, skill_name: &str, viewer: UserId) -> Result<Vec<SkillResource>, ServerError> {
        require_user(viewer)?;
        let skill_name = skill_name.trim();
        if skill_name.is_empty() {
            return Err(ServerError::Validation("skill_name is required".into()));
        }
        with_db(&self.db, |db| db.skill_resources(skill_name, viewer))
    }

    /// Per-skill resource counts for one owner, by skill name.
    pub fn skill_counts(&self, owner_id: UserId) -> Result<Vec<SkillCount>, ServerError> {
        require_user(owner_id)?;
        let links = with_db(&self.db, |db| db.skill_links_for_owner(owner_id))?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for link in links {
            *counts.entry(link.skill_name).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(skill_name, resource_count)| SkillCount {
                skill_name,
                resource_count,
            })
            .collect())
    }

    /// Skills `user_id` is connected on through an approved grant.
    pub fn connections(&self, user_id: UserId) -> Result<Vec<SkillConnection>, ServerError> {
        require_user(user_id)?;
        with_db(&self.db, |db| db.skill_connections(user_id))
    }

    /// Whether `user_id` holds any approved grant for `skill_name`.
    pub fn has_connection(&self, user_id: UserId, skill_name: &str) -> Result<bool, ServerError> {
        let skill_name = skill_name.trim();
        if skill_name.is_empty() {
            return Ok(false);
        }
        Ok(self
            .connections(user_id)?
            .iter()
            .any(|c| c.skill_name == skill_name))
    }

    fn grant(&self, grant_id: i64) -> Result<AccessGrant, ServerError> {
        with_db(&self.db, |db| db.get_grant(grant_id))
            .map_err(|e| not_found_as(e, format!("grant {grant_id}")))
    }
}

fn require_user(user_id: UserId) -> Result<(), ServerError> {
    if user_id.is_valid() {
        Ok(())
    } else {
        Err(ServerError::Validation("user_id is required".into()))
    }
}

fn not_found_as(e: ServerError, what: String) -> ServerError {
    match e {
        ServerError::NotFound(_) => ServerError::NotFound(what),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use skillswap_store::{Database, NewResource};

    use super::*;
    use crate::db::shared;

    const OWNER: UserId = UserId(1);
    const LEARNER: UserId = UserId(2);

    fn setup() -> (AccessGate, ResourceId) {
        let db = shared(Database::open_in_memory().unwrap());
        let resource = with_db(&db, |db| {
            db.insert_resource(&NewResource {
                title: "Chord shapes".into(),
                description: String::new(),
                owner_id: OWNER,
                file_name: "chords.pdf".into(),
                stored_name: "chords".into(),
                mime_type: None,
                file_size: 4,
                file_digest: "00".repeat(32),
                piece_size: 4,
                piece_digests: vec!["11".repeat(32)],
            })
        })
        .unwrap();
        (AccessGate::new(db), resource.id)
    }

    #[test]
    fn owner_always_allowed() {
        let (gate, rid) = setup();
        assert!(gate.authorize(OWNER, rid).unwrap());
        assert_eq!(gate.require(OWNER, rid).unwrap().id, rid);
    }

    #[test]
    fn stranger_denied_without_skill_link() {
        let (gate, rid) = setup();
        assert!(!gate.authorize(LEARNER, rid).unwrap());
        assert!(matches!(
            gate.require(LEARNER, rid),
            Err(ServerError::Forbidden(_))
        ));
    }

    #[test]
    fn approved_grant_allows_access() {
        let (gate, rid) = setup();
        gate.link_skill(OWNER, "guitar", rid, false).unwrap();

        let grant = gate.request(LEARNER, OWNER, "guitar", "teach me").unwrap();
        assert!(!gate.authorize(LEARNER, rid).unwrap());

        gate.respond(grant.id, OWNER, true).unwrap();
        assert!(gate.authorize(LEARNER, rid).unwrap());
    }

    #[test]
    fn rejected_or_cancelled_grant_denies() {
        let (gate, rid) = setup();
        gate.link_skill(OWNER, "guitar", rid, false).unwrap();

        let grant = gate.request(LEARNER, OWNER, "guitar", "").unwrap();
        gate.respond(grant.id, OWNER, false).unwrap();
        assert!(!gate.authorize(LEARNER, rid).unwrap());

        let again = gate.request(LEARNER, OWNER, "guitar", "").unwrap();
        gate.cancel(again.id, LEARNER).unwrap();
        assert!(!gate.authorize(LEARNER, rid).unwrap());
    }

    #[test]
    fn multi_skill_resource_denied() {
        let (gate, rid) = setup();
        gate.link_skill(OWNER, "guitar", rid, false).unwrap();
        gate.link_skill(OWNER, "theory", rid, false).unwrap();

        let grant = gate.request(LEARNER, OWNER, "guitar", "").unwrap();
        gate.respond(grant.id, OWNER, true).unwrap();

        assert!(!gate.authorize(LEARNER, rid).unwrap());
        assert!(gate.authorize(OWNER, rid).unwrap());
    }

    #[test]
    fn unknown_resource_not_found() {
        let (gate, _) = setup();
        assert!(matches!(
            gate.authorize(LEARNER, ResourceId(77)),
            Err(ServerError::NotFound(_))
        ));
    }

    #[test]
    fn listings_follow_visibility() {
        let (gate, rid) = setup();
        assert!(gate.catalog(LEARNER, None).unwrap().is_empty());
        assert_eq!(gate.catalog(OWNER, None).unwrap().len(), 1);

        gate.link_skill(OWNER, "guitar", rid, true).unwrap();
        assert_eq!(gate.catalog(LEARNER, Some(OWNER)).unwrap()[0].id, rid);
        assert_eq!(gate.skill_resources("guitar", LEARNER).unwrap().len(), 1);
        assert_eq!(
            gate.skill_counts(OWNER).unwrap(),
            vec![SkillCount {
                skill_name: "guitar".into(),
                resource_count: 1
            }]
        );

        // Being listed publicly does not open the pieces.
        assert!(!gate.authorize(LEARNER, rid).unwrap());
        assert!(matches!(
            gate.catalog(UserId(0), None),
            Err(ServerError::Validation(_))
        ));
    }

    #[test]
    fn connections_track_approved_grants() {
        let (gate, _) = setup();
        let grant = gate.request(LEARNER, OWNER, "guitar", "").unwrap();
        assert!(!gate.has_connection(LEARNER, "guitar").unwrap());

        gate.respond(grant.id, OWNER, true).unwrap();
        assert!(gate.has_connection(LEARNER, "guitar").unwrap());
        assert!(gate.has_connection(OWNER, "guitar").unwrap());
        assert!(!gate.has_connection(LEARNER, "").unwrap());
        assert_eq!(gate.connections(LEARNER).unwrap()[0].grant_id, grant.id);
    }

    #[test]
    fn only_the_right_party_may_act() {
        let (gate, rid) = setup();
        assert!(matches!(
            gate.link_skill(LEARNER, "guitar", rid, false),
            Err(ServerError::Forbidden(_))
        ));

        let grant = gate.request(LEARNER, OWNER, "guitar", "").unwrap();
        assert!(matches!(
            gate.respond(grant.id, LEARNER, true),
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            gate.cancel(grant.id, OWNER),
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            gate.request(OWNER, OWNER, "guitar", ""),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            gate.request(LEARNER, OWNER, "guitar", ""),
            Err(ServerError::Conflict(_))
        ));

        gate.respond(grant.id, OWNER, true).unwrap();
        assert!(matches!(
            gate.respond(grant.id, OWNER, false),
            Err(ServerError::Conflict(_))
        ));
        assert_eq!(gate.list(OWNER, GrantDirection::Received).unwrap().len(), 1);
    }
}
