//! # skillswap-store
//!
//! SQLite persistence for the SkillSwap real-time core.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for messages, resources,
//! skill links, swarm participation and access grants. Schema changes go
//! through the versioned migrations in [`migrations`].

pub mod database;
pub mod grants;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod participation;
pub mod resources;
pub mod skills;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use grants::GrantDirection;
pub use models::*;
pub use participation::GlobalSwarmCounts;
