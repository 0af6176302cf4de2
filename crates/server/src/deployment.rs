use std::{path::Path, sync::Arc};

use db::DBService;
use services::services::{
    auth::AuthService,
    config::Config,
    crm_client::{CrmClient, CrmError, CrmGateway},
    file_storage::FileStorageService,
    site_import::SiteImporter,
    sync_queue::BackgroundSyncService,
};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything a request handler needs, cheap to clone into axum state.
#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<Config>,
    db: DBService,
    auth: Arc<AuthService>,
    storage: Arc<FileStorageService>,
    sync: BackgroundSyncService,
    importer: SiteImporter,
}

impl LocalDeployment {
    pub async fn new(config: Config) -> Result<Self, DeploymentError> {
        if let Some(parent) = sqlite_parent_dir(&config.database_url) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        let db = DBService::new(&config.database_url).await?;
        let crm: Arc<dyn CrmGateway> = Arc::new(CrmClient::new(&config.crm)?);
        Ok(Self::from_parts(config, db, crm))
    }

    /// Wires the services on top of an existing database and CRM gateway.
    pub fn from_parts(config: Config, db: DBService, crm: Arc<dyn CrmGateway>) -> Self {
        let auth = Arc::new(AuthService::new(db.clone(), &config.auth));
        let storage = Arc::new(FileStorageService::new(
            db.clone(),
            config.storage_dir.clone(),
            config.max_upload_bytes,
        ));
        let sync = BackgroundSyncService::new(db.clone(), crm.clone(), config.sync.clone());
        let importer = SiteImporter::new(db.clone(), crm);

        Self {
            config: Arc::new(config),
            db,
            auth,
            storage,
            sync,
            importer,
        }
    }

    /// Starts the sync worker loop.
    pub fn spawn_background_tasks(&self) -> JoinHandle<()> {
        self.sync.spawn()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn storage(&self) -> &FileStorageService {
        &self.storage
    }

    pub fn sync(&self) -> &BackgroundSyncService {
        &self.sync
    }

    pub fn importer(&self) -> &SiteImporter {
        &self.importer
    }
}

fn sqlite_parent_dir(database_url: &str) -> Option<&Path> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_parent_dir_skips_memory_urls() {
        assert_eq!(
            sqlite_parent_dir("sqlite://data/construction.db"),
            Some(Path::new("data"))
        );
        assert_eq!(sqlite_parent_dir("sqlite::memory:"), None);
        assert_eq!(sqlite_parent_dir("sqlite://local.db"), None);
    }
}
