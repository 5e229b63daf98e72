use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use skillswap_shared::digest;
use skillswap_shared::UserId;
use skillswap_store::{NewResource, PeerParticipation, Resource};

use crate::db::{with_db, SharedDb};
use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    // Canonicalize base; target may not exist yet so normalize manually
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .or_else(|_| target.strip_prefix(&canonical_base))
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::Validation("Path traversal detected".to_string()));
            }
            _ => {} // RootDir, CurDir, Prefix
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::Validation("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub owner_id: UserId,
    pub title: String,
    pub description: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub skill_name: Option<String>,
}

/// Content directory plus the resource rows describing it.
#[derive(Clone)]
pub struct PieceStore {
    base_path: PathBuf,
    max_size: usize,
    default_piece_size: usize,
    db: SharedDb,
}

impl PieceStore {
    pub async fn new(
        base_path: PathBuf,
        max_size: usize,
        default_piece_size: usize,
        db: SharedDb,
    ) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::TransientIo(format!(
                "Failed to create content directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Piece store initialized");

        Ok(Self {
            base_path,
            max_size,
            default_piece_size,
            db,
        })
    }

    /// Split, hash and persist an upload as a new resource.
    ///
    /// The uploader is registered as a seeder of the new resource.
    pub async fn create(
        &self,
        upload: Upload,
        data: &[u8],
        piece_size: Option<usize>,
    ) -> Result<Resource, ServerError> {
        let piece_size = piece_size.unwrap_or(self.default_piece_size);

        if !upload.owner_id.is_valid() {
            return Err(ServerError::Validation("owner_id is required".into()));
        }
        if upload.title.trim().is_empty() {
            return Err(ServerError::Validation("title is required".into()));
        }
        if data.is_empty() {
            return Err(ServerError::Validation("Empty upload".into()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::Validation(format!(
                "Upload too large: {} bytes (max {})",
                data.len(),
                self.max_size
            )));
        }
        if piece_size == 0 {
            return Err(ServerError::Validation("piece_size must be positive".into()));
        }

        let digests = digest::compute(data, piece_size)
            .map_err(|e| ServerError::Validation(e.to_string()))?;

        let stored_name = Uuid::new_v4().to_string();
        let path = self.safe_piece_path(&stored_name)?;

        fs::write(&path, data).await.map_err(|e| {
            ServerError::TransientIo(format!("Failed to write resource {stored_name}: {e}"))
        })?;

        let new = NewResource {
            title: upload.title.trim().to_string(),
            description: upload.description,
            owner_id: upload.owner_id,
            file_name: upload.file_name,
            stored_name: stored_name.clone(),
            mime_type: upload.mime_type,
            file_size: data.len() as i64,
            file_digest: digests.file_digest,
            piece_size: piece_size as i64,
            piece_digests: digests.piece_digests,
        };
        let skill_name = upload
            .skill_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let inserted = with_db(&self.db, |db| {
            let tx = db.conn().unchecked_transaction()?;
            let resource = db.insert_resource(&new)?;
            if let Some(skill) = &skill_name {
                db.link_skill(skill, resource.owner_id, resource.id, false)?;
            }
            db.upsert_participation(&PeerParticipation {
                user_id: resource.owner_id,
                resource_id: resource.id,
                status: skillswap_shared::PeerStatus::Seeding,
                progress: 100.0,
                last_announce: chrono::Utc::now(),
            })?;
            tx.commit()?;
            Ok(resource)
        });

        match inserted {
            Ok(resource) => {
                info!(
                    resource_id = %resource.id,
                    owner = %resource.owner_id,
                    size = resource.file_size,
                    pieces = resource.piece_count,
                    "Resource stored"
                );
                Ok(resource)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&path).await {
                    warn!(file = %stored_name, error = %rm, "Failed to remove orphaned upload");
                }
                Err(e)
            }
        }
    }

    /// Read one piece and verify it against its recorded digest.
    pub async fn read_piece(&self, resource: &Resource, index: u32) -> Result<Vec<u8>, ServerError> {
        let index = index as usize;
        if index >= resource.piece_count as usize {
            return Err(ServerError::NotFound(format!(
                "piece {index} of resource {}",
                resource.id
            )));
        }

        let piece_size = resource.piece_size as usize;
        let expected_len = digest::piece_len(resource.file_size as usize, piece_size, index)
            .ok_or_else(|| {
                ServerError::NotFound(format!("piece {index} of resource {}", resource.id))
            })?;

        let path = self.safe_piece_path(&resource.stored_name)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(resource_id = %resource.id, "Resource file missing from content directory");
                return Err(ServerError::NotFound(format!("resource {} file", resource.id)));
            }
            Err(e) => {
                return Err(ServerError::TransientIo(format!(
                    "Failed to open resource {}: {e}",
                    resource.id
                )))
            }
        };

        file.seek(SeekFrom::Start((index * piece_size) as u64))
            .await
            .map_err(|e| ServerError::TransientIo(format!("Seek failed: {e}")))?;

        let mut buf = vec![0u8; expected_len];
        if let Err(e) = file.read_exact(&mut buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                error!(
                    resource_id = %resource.id,
                    piece = index,
                    "Resource file truncated"
                );
                return Err(ServerError::Integrity(format!(
                    "resource {} piece {index} truncated",
                    resource.id
                )));
            }
            return Err(ServerError::TransientIo(format!("Read failed: {e}")));
        }

        let expected = resource
            .piece_digests
            .get(index)
            .ok_or_else(|| ServerError::Integrity(format!("no digest for piece {index}")))?;
        if !digest::verify_hex(&buf, expected) {
            error!(
                resource_id = %resource.id,
                piece = index,
                "Piece digest mismatch"
            );
            return Err(ServerError::Integrity(format!(
                "resource {} piece {index} digest mismatch",
                resource.id
            )));
        }

        debug!(resource_id = %resource.id, piece = index, len = buf.len(), "Piece served");
        Ok(buf)
    }

    fn safe_piece_path(&self, stored_name: &str) -> Result<PathBuf, ServerError> {
        if stored_name.is_empty()
            || stored_name.contains('/')
            || stored_name.contains('\\')
            || stored_name.contains("..")
        {
            return Err(ServerError::Validation("Path traversal detected".to_string()));
        }
        let raw = self.base_path.join(stored_name);
        ensure_within(&self.base_path, &raw)
    }
}
