//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP layer.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use skillswap_shared::{GrantStatus, PeerStatus, ResourceId, UserId};

/// Timestamps are stored as fixed-width RFC-3339 so that text ordering in
/// SQL matches chronological ordering.
pub fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn from_db_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user identity mirrored from the profile subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// What a chat message carries: text, or a reference to an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatPayload {
    Text(String),
    File(i64),
}

/// A direct message between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Autoincrement id; also the per-database creation order.
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub payload: ChatPayload,
    /// Flips to `true` exactly once, when the message reaches a live session.
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A piece-split, content-addressed upload. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub title: String,
    pub description: String,
    pub owner_id: UserId,
    /// File name supplied by the uploader.
    pub file_name: String,
    /// File name inside the content directory.
    #[serde(skip_serializing, default)]
    pub stored_name: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    /// Hex SHA-256 of the whole file.
    pub file_digest: String,
    pub piece_size: i64,
    pub piece_count: i64,
    /// Hex SHA-256 of each piece, in piece order.
    pub piece_digests: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to insert a [`Resource`]; the id comes from SQLite.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub title: String,
    pub description: String,
    pub owner_id: UserId,
    pub file_name: String,
    pub stored_name: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    pub file_digest: String,
    pub piece_size: i64,
    pub piece_digests: Vec<String>,
}

/// A resource listed under one of its owner's skills.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillLink {
    pub id: i64,
    pub skill_name: String,
    pub owner_id: UserId,
    pub resource_id: ResourceId,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

/// A skill listing joined with the resource it points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillResource {
    pub skill_name: String,
    pub is_public: bool,
    pub owner_name: Option<String>,
    #[serde(flatten)]
    pub resource: Resource,
}

// ---------------------------------------------------------------------------
// PeerParticipation
// ---------------------------------------------------------------------------

/// One user's role in one resource's swarm, keyed by `(user_id, resource_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerParticipation {
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub status: PeerStatus,
    /// Percent complete, in `[0, 100]`.
    pub progress: f64,
    pub last_announce: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AccessGrant
// ---------------------------------------------------------------------------

/// A skill connection request between a requester and a resource owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessGrant {
    pub id: i64,
    pub requester_id: UserId,
    pub owner_id: UserId,
    pub skill_name: String,
    pub message: String,
    pub status: GrantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A skill the user is connected on through an approved grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillConnection {
    pub skill_name: String,
    pub grant_id: i64,
}
