//! Uploaded files: blobs on local disk, metadata in the `files` table.

use std::path::{Path, PathBuf};

use chrono::Utc;
use db::{
    DBService,
    models::{
        file_record::{CreateFileRecord, FileRecord},
        user::User,
    },
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "application/pdf",
    "text/plain",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is empty")]
    Empty,
    #[error("file exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
    #[error("file not found")]
    NotFound,
    #[error("not allowed to delete this file")]
    Forbidden,
}

pub struct FileStorageService {
    db: DBService,
    root: PathBuf,
    max_bytes: usize,
}

impl FileStorageService {
    pub fn new(db: DBService, root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            db,
            root: root.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn store(
        &self,
        uploader: &User,
        original_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<FileRecord, StorageError> {
        if bytes.is_empty() {
            return Err(StorageError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(StorageError::TooLarge {
                max_bytes: self.max_bytes,
            });
        }
        let content_type = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(StorageError::UnsupportedType(content_type));
        }

        let storage_key = storage_key(uploader.id, original_name);
        let path = self.root.join(&storage_key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        let data = CreateFileRecord {
            original_name: original_name.to_string(),
            storage_key,
            content_type,
            size_bytes: bytes.len() as i64,
            uploaded_by: uploader.id,
        };
        let record = match FileRecord::create(&self.db.pool, &data, Uuid::new_v4()).await {
            Ok(record) => record,
            Err(e) => {
                remove_blob(&path).await;
                return Err(e.into());
            }
        };

        info!(
            file_id = %record.id,
            user_id = %uploader.id,
            size_bytes = record.size_bytes,
            "File stored"
        );
        Ok(record)
    }

    pub async fn list(&self, uploaded_by: Option<Uuid>) -> Result<Vec<FileRecord>, StorageError> {
        Ok(FileRecord::find_all(&self.db.pool, uploaded_by).await?)
    }

    pub async fn open(&self, id: Uuid) -> Result<(FileRecord, Vec<u8>), StorageError> {
        let record = FileRecord::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(StorageError::NotFound)?;
        let bytes = match tokio::fs::read(self.root.join(&record.storage_key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file_id = %id, "File record has no blob");
                return Err(StorageError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        Ok((record, bytes))
    }

    /// Only the uploader or an admin may delete.
    pub async fn delete(&self, id: Uuid, requester: &User) -> Result<(), StorageError> {
        let record = FileRecord::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(StorageError::NotFound)?;
        if record.uploaded_by != requester.id && !requester.is_admin() {
            return Err(StorageError::Forbidden);
        }

        FileRecord::delete(&self.db.pool, id).await?;
        remove_blob(&self.root.join(&record.storage_key)).await;
        info!(file_id = %id, user_id = %requester.id, "File deleted");
        Ok(())
    }
}

/// `{user_id}/{millis}-{uuid}.{ext}`
fn storage_key(user_id: Uuid, original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string());
    format!(
        "{}/{}-{}.{}",
        user_id,
        Utc::now().timestamp_millis(),
        Uuid::new_v4(),
        ext
    )
}

async fn remove_blob(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), error = %e, "Failed to remove file blob");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use db::models::user::{CreateUser, UserRole};

    use super::*;

    async fn setup(dir: &Path) -> (FileStorageService, User, User) {
        let db = DBService::new_in_memory().await.unwrap();
        let mut users = Vec::new();
        for (phone, role) in [("0911000001", UserRole::Worker), ("0911000002", UserRole::Admin)] {
            users.push(
                User::create(
                    &db.pool,
                    &CreateUser {
                        phone: phone.to_string(),
                        name: phone.to_string(),
                        email: None,
                        global_role: Some(role),
                    },
                    Uuid::new_v4(),
                )
                .await
                .unwrap(),
            );
        }
        let admin = users.pop().unwrap();
        let worker = users.pop().unwrap();
        (FileStorageService::new(db, dir, 1024), worker, admin)
    }

    #[test]
    fn storage_key_keeps_safe_extension() {
        let user = Uuid::new_v4();
        let key = storage_key(user, "before.JPG");
        assert!(key.starts_with(&format!("{}/", user)));
        assert!(key.ends_with(".jpg"));
        assert!(storage_key(user, "../../etc/passwd").ends_with(".bin"));
    }

    #[tokio::test]
    async fn store_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, worker, admin) = setup(dir.path()).await;

        let record = storage
            .store(&worker, "note.txt", "text/plain; charset=utf-8", b"hello")
            .await
            .unwrap();
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.size_bytes, 5);

        let (_, bytes) = storage.open(record.id).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(storage.list(Some(worker.id)).await.unwrap().len(), 1);

        storage.delete(record.id, &admin).await.unwrap();
        assert!(matches!(storage.open(record.id).await, Err(StorageError::NotFound)));
        assert!(!dir.path().join(&record.storage_key).exists());
    }

    #[tokio::test]
    async fn rejects_oversized_and_unsupported_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, worker, _) = setup(dir.path()).await;

        assert!(matches!(
            storage.store(&worker, "big.png", "image/png", &[0u8; 2048]).await,
            Err(StorageError::TooLarge { max_bytes: 1024 })
        ));
        assert!(matches!(
            storage.store(&worker, "x.exe", "application/x-msdownload", b"MZ").await,
            Err(StorageError::UnsupportedType(_))
        ));
        assert!(matches!(
            storage.store(&worker, "empty.txt", "text/plain", b"").await,
            Err(StorageError::Empty)
        ));
    }

    #[tokio::test]
    async fn only_uploader_or_admin_may_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, worker, admin) = setup(dir.path()).await;
        let record = storage
            .store(&admin, "plan.pdf", "application/pdf", b"%PDF-1.4")
            .await
            .unwrap();

        assert!(matches!(
            storage.delete(record.id, &worker).await,
            Err(StorageError::Forbidden)
        ));
        storage.delete(record.id, &admin).await.unwrap();
    }
}
