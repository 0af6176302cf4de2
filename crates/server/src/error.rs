use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::{
    auth::AuthError, file_storage::StorageError, site_import::SiteImportError,
    sync_queue::SyncError,
};
use thiserror::Error;
use tracing::error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    SiteImport(#[from] SiteImportError),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                StatusCode::CONFLICT
            }
            ApiError::Database(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Auth(e) => match e {
                AuthError::InvalidPhone => StatusCode::BAD_REQUEST,
                AuthError::UserNotFound => StatusCode::NOT_FOUND,
                AuthError::Locked(_) | AuthError::Suspended => StatusCode::FORBIDDEN,
                AuthError::InvalidPassword { .. } | AuthError::InvalidToken => {
                    StatusCode::UNAUTHORIZED
                }
                AuthError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Sync(SyncError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Storage(e) => match e {
                StorageError::Empty | StorageError::UnsupportedType(_) => StatusCode::BAD_REQUEST,
                StorageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                StorageError::NotFound => StatusCode::NOT_FOUND,
                StorageError::Forbidden => StatusCode::FORBIDDEN,
                StorageError::Database(_) | StorageError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::SiteImport(e) => match e {
                SiteImportError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
                SiteImportError::Database(_) | SiteImportError::Crm(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Multipart(e) => e.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

fn error_label(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
        StatusCode::FORBIDDEN => "FORBIDDEN",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "CONFLICT",
        StatusCode::PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
        _ => "INTERNAL_ERROR",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = ApiResponse::<()>::error(error_label(status), message);
        (status, Json(body)).into_response()
    }
}
