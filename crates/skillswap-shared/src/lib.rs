//! # skillswap-shared
//!
//! Types shared by the store and the server: integer identities, the tagged
//! WebSocket frame model, SHA-256 piece digests and protocol constants.

pub mod constants;
pub mod digest;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::SharedError;
pub use protocol::{Frame, PeerInfo, SwarmStats};
pub use types::{GrantStatus, PeerStatus, ResourceId, UserId};
