//! Opaque file storage used for stage photos and bills.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use entity::stored_file;
use platform_api::{ApiError, ApiResult};
use sea_orm::{ActiveValue::Set, DatabaseConnection, EntityTrait};
use uuid::Uuid;

/// Prefix of every reference handed out by the store. The HTTP layer serves
/// the same path.
pub const REFERENCE_PREFIX: &str = "/files/";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlobKind {
    ProcessPhoto,
    Bill,
}

impl BlobKind {
    pub fn parse(value: &str) -> ApiResult<Self> {
        match value.trim() {
            "process-photos" => Ok(BlobKind::ProcessPhoto),
            "bills" => Ok(BlobKind::Bill),
            other => Err(ApiError::validation(format!(
                "unknown upload kind '{}', expected process-photos or bills",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlobKind::ProcessPhoto => "process-photos",
            BlobKind::Bill => "bills",
        }
    }
}

impl From<BlobKind> for stored_file::Kind {
    fn from(value: BlobKind) -> Self {
        match value {
            BlobKind::ProcessPhoto => stored_file::Kind::ProcessPhoto,
            BlobKind::Bill => stored_file::Kind::Bill,
        }
    }
}

impl From<stored_file::Kind> for BlobKind {
    fn from(value: stored_file::Kind) -> Self {
        match value {
            stored_file::Kind::ProcessPhoto => BlobKind::ProcessPhoto,
            stored_file::Kind::Bill => BlobKind::Bill,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewBlob {
    pub kind: BlobKind,
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobRef {
    pub id: Uuid,
    pub reference: String,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Clone, Debug)]
pub struct Blob {
    pub id: Uuid,
    pub kind: BlobKind,
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, blob: NewBlob) -> ApiResult<BlobRef>;
    async fn retrieve(&self, reference: &str) -> ApiResult<Blob>;
}

pub fn reference_for(id: Uuid) -> String {
    format!("{}{}", REFERENCE_PREFIX, id)
}

/// Accepts either a bare file id or a `/files/{id}` reference.
pub fn parse_reference(reference: &str) -> ApiResult<Uuid> {
    let trimmed = reference.trim();
    let raw = trimmed.strip_prefix(REFERENCE_PREFIX).unwrap_or(trimmed);
    Uuid::parse_str(raw).map_err(|_| ApiError::validation("invalid file reference"))
}

/// Stores file bytes in the `stored_file` table.
#[derive(Clone)]
pub struct DbBlobStore {
    db: Arc<DatabaseConnection>,
}

impl DbBlobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BlobStore for DbBlobStore {
    async fn store(&self, blob: NewBlob) -> ApiResult<BlobRef> {
        if blob.bytes.is_empty() {
            return Err(ApiError::validation("file is empty"));
        }
        let mime_type = if blob.mime_type.trim().is_empty() {
            "application/octet-stream".to_string()
        } else {
            blob.mime_type.trim().to_string()
        };
        let original_name = match blob.original_name.trim() {
            "" => "upload".to_string(),
            name => name.to_string(),
        };
        let id = Uuid::new_v4();
        let size = blob.bytes.len() as i64;
        let active = stored_file::ActiveModel {
            id: Set(id),
            kind: Set(blob.kind.into()),
            original_name: Set(original_name),
            mime_type: Set(mime_type.clone()),
            size_bytes: Set(size),
            data: Set(blob.bytes),
            created_at: Set(Utc::now().into()),
        };
        stored_file::Entity::insert(active)
            .exec_without_returning(self.db.as_ref())
            .await?;
        tracing::info!(file_id = %id, kind = blob.kind.as_str(), size, "stored file");
        Ok(BlobRef {
            id,
            reference: reference_for(id),
            mime_type,
            size,
        })
    }

    async fn retrieve(&self, reference: &str) -> ApiResult<Blob> {
        let id = parse_reference(reference)?;
        let model = stored_file::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ApiError::not_found("file"))?;
        Ok(Blob {
            id: model.id,
            kind: model.kind.into(),
            original_name: model.original_name,
            mime_type: model.mime_type,
            bytes: model.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_upload_folders() {
        assert_eq!(BlobKind::parse("bills").unwrap(), BlobKind::Bill);
        assert_eq!(
            BlobKind::parse(" process-photos ").unwrap(),
            BlobKind::ProcessPhoto
        );
        assert_eq!(BlobKind::parse("avatars").unwrap_err().code(), "VALIDATION");
    }

    #[test]
    fn references_round_through_both_forms() {
        let id = Uuid::new_v4();
        assert_eq!(parse_reference(&reference_for(id)).unwrap(), id);
        assert_eq!(parse_reference(&id.to_string()).unwrap(), id);
        assert!(parse_reference("/files/not-a-uuid").is_err());
    }
}
