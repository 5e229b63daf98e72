use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Unknown peer status: {0}")]
    UnknownPeerStatus(String),

    #[error("Unknown grant status: {0}")]
    UnknownGrantStatus(String),

    #[error("Invalid piece size: {0}")]
    InvalidPieceSize(usize),

    #[error("Frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
