use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::header,
    response::{IntoResponse, Json as ResponseJson, Response},
    routing::{get, post},
};
use db::models::file_record::FileRecord;
use serde::Deserialize;
use ts_rs::TS;
use uuid::Uuid;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError, middleware::auth::AuthUser};

/// Room for multipart framing on top of the file itself.
pub(crate) const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize, TS)]
pub struct FileQuery {
    pub uploaded_by: Option<Uuid>,
}

/// The declared part type, or a guess from the file name when the client
/// sent none or a generic one.
pub(crate) fn content_type_for(declared: Option<&str>, file_name: &str) -> String {
    match declared {
        Some(ct) if ct != "application/octet-stream" => ct.to_string(),
        _ => mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// POST /api/v1/files/upload
/// Multipart form with a single `file` field.
pub async fn upload_file(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> Result<ResponseJson<ApiResponse<FileRecord>>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = content_type_for(field.content_type(), &file_name);
        let bytes = field.bytes().await?;

        let record = deployment
            .storage()
            .store(&auth.user, &file_name, &content_type, &bytes)
            .await?;
        return Ok(ResponseJson(ApiResponse::success_with_message(
            record,
            "File uploaded",
        )));
    }
    Err(ApiError::BadRequest("missing `file` field".to_string()))
}

/// GET /api/v1/files
/// Admins may list anyone's uploads; everyone else sees their own.
pub async fn list_files(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Query(query): Query<FileQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<FileRecord>>>, ApiError> {
    let uploaded_by = if auth.user.is_admin() {
        query.uploaded_by
    } else {
        Some(auth.user.id)
    };
    let files = deployment.storage().list(uploaded_by).await?;
    Ok(ResponseJson(ApiResponse::success(files)))
}

/// GET /api/v1/files/{id}
pub async fn download_file(
    State(deployment): State<DeploymentImpl>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let (record, bytes) = deployment.storage().open(id).await?;
    let disposition = format!(
        "inline; filename=\"{}\"",
        record.original_name.replace(['"', '\\', '\r', '\n'], "_")
    );
    Ok((
        [
            (header::CONTENT_TYPE, record.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// DELETE /api/v1/files/{id}
pub async fn delete_file(
    State(deployment): State<DeploymentImpl>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    deployment.storage().delete(id, &auth.user).await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router(deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let body_limit = deployment.storage().max_bytes() + MULTIPART_OVERHEAD_BYTES;
    Router::new().nest(
        "/files",
        Router::new()
            .route(
                "/upload",
                post(upload_file).layer(DefaultBodyLimit::max(body_limit)),
            )
            .route("/", get(list_files))
            .route("/{id}", get(download_file).delete(delete_file)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_content_type_is_guessed_from_name() {
        assert_eq!(content_type_for(Some("application/octet-stream"), "a.jpg"), "image/jpeg");
        assert_eq!(content_type_for(None, "plan.pdf"), "application/pdf");
        assert_eq!(content_type_for(Some("image/png"), "a.jpg"), "image/png");
    }
}
