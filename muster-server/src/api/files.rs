use super::{ApiError, ApiResult, ApiServices, BearerAuth};
use crate::auth::TokenReply;
use muster_common::model::BlobId;
use poem_openapi::param::Path;
use poem_openapi::payload::{Binary, Form, Json};
use poem_openapi::types::multipart::Upload;
use poem_openapi::Multipart;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Multipart)]
pub struct UploadPayload {
    pub files: Vec<Upload>,
    pub is_server_only: Option<bool>,
}

/// The out-of-band blob store endpoints.
pub struct StorageApi {
    pub services: ApiServices,
}

#[poem_openapi::OpenApi]
impl StorageApi {
    /// Blob store authentication; same credential set as the control plane.
    #[oai(path = "/storage-token", method = "post", operation_id = "storage_token")]
    async fn storage_token(
        &self,
        form: Form<super::control::TokenRequest>,
    ) -> ApiResult<Json<super::control::TokenResponse>> {
        let user = self
            .services
            .users
            .authenticate(&form.0.username, &form.0.password)?;
        let token = self.services.tokens.mint(&user.username)?;
        Ok(Json(TokenReply::bearer(token).into()))
    }

    /// Uploads one or more files; returns the blob id per file name.
    #[oai(path = "/file", method = "post", operation_id = "upload_files")]
    async fn upload_files(
        &self,
        auth: BearerAuth,
        payload: UploadPayload,
    ) -> ApiResult<Json<HashMap<String, String>>> {
        let user = self.services.authenticate(&auth.0)?;
        let server_only = payload.is_server_only.unwrap_or(false);

        let mut ids = HashMap::new();
        for upload in payload.files {
            let name = upload
                .file_name()
                .map(|name| name.to_string())
                .unwrap_or_else(|| "file".to_string());
            let content = upload
                .into_vec()
                .await
                .map_err(|err| ApiError::internal(format!("Upload failed: {err}")))?;
            let id = self.services.engine.blobs().put(
                &name,
                content.into(),
                server_only,
                &user.username,
            );
            debug!(blob = %id, name, owner = user.username, server_only, "Blob uploaded");
            ids.insert(name, id.to_string());
        }
        Ok(Json(ids))
    }

    /// Downloads a blob. 404 covers both missing and not-visible.
    #[oai(path = "/file/:blob_id", method = "get", operation_id = "download_file")]
    async fn download_file(
        &self,
        auth: BearerAuth,
        blob_id: Path<Uuid>,
    ) -> ApiResult<Binary<Vec<u8>>> {
        let user = self.services.authenticate(&auth.0)?;
        let bytes = self
            .services
            .engine
            .blobs()
            .fetch(BlobId(blob_id.0), user.role)?;
        Ok(Binary(bytes.to_vec()))
    }

    /// Deletes a blob after consumption.
    #[oai(path = "/file/:blob_id", method = "delete", operation_id = "delete_file")]
    async fn delete_file(&self, auth: BearerAuth, blob_id: Path<Uuid>) -> ApiResult<Json<serde_json::Value>> {
        let user = self.services.authenticate(&auth.0)?;
        self.services
            .engine
            .blobs()
            .delete(BlobId(blob_id.0), user.role)?;
        Ok(Json(serde_json::Value::Null))
    }
}
