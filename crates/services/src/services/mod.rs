pub mod access;
pub mod auth;
pub mod config;
pub mod crm_client;
pub mod file_storage;
pub mod site_import;
pub mod sync_queue;

#[cfg(any(test, feature = "test-support"))]
pub mod crm_mock;
