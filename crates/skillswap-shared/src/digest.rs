//! SHA-256 content digests for resource pieces.
//!
//! A resource is split into fixed-size pieces; every piece is hashed on its
//! own and the whole byte stream is hashed once more. Digests travel and are
//! stored as lowercase hex strings.

use sha2::{Digest, Sha256};

use crate::error::SharedError;

/// Digests computed for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceDigests {
    /// SHA-256 of the full byte stream (hex).
    pub file_digest: String,
    /// SHA-256 of every piece, in piece order (hex).
    pub piece_digests: Vec<String>,
    /// Piece size the input was split with.
    pub piece_size: usize,
    /// Total input length.
    pub file_size: usize,
}

impl PieceDigests {
    pub fn piece_count(&self) -> usize {
        self.piece_digests.len()
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Returns `true` if `SHA-256(data)` equals the expected hex digest.
pub fn verify_hex(data: &[u8], expected_hex: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected_hex)
}

/// Number of pieces a file of `file_size` bytes splits into.
pub fn piece_count(file_size: usize, piece_size: usize) -> usize {
    if piece_size == 0 {
        return 0;
    }
    file_size.div_ceil(piece_size)
}

/// Length of piece `index`; the last piece may be shorter than `piece_size`.
pub fn piece_len(file_size: usize, piece_size: usize, index: usize) -> Option<usize> {
    let offset = index.checked_mul(piece_size)?;
    if offset >= file_size {
        return None;
    }
    Some(piece_size.min(file_size - offset))
}

/// Split `data` into `piece_size` pieces and hash them, plus the whole stream.
pub fn compute(data: &[u8], piece_size: usize) -> Result<PieceDigests, SharedError> {
    if piece_size == 0 {
        return Err(SharedError::InvalidPieceSize(piece_size));
    }

    let mut file_hasher = Sha256::new();
    let mut piece_digests = Vec::with_capacity(piece_count(data.len(), piece_size));

    for piece in data.chunks(piece_size) {
        file_hasher.update(piece);
        piece_digests.push(sha256_hex(piece));
    }

    Ok(PieceDigests {
        file_digest: hex::encode(file_hasher.finalize()),
        piece_digests,
        piece_size,
        file_size: data.len(),
    })
}
