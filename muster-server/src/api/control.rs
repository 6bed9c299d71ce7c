use super::{ApiError, ApiResult, ApiServices, BearerAuth};
use crate::auth::TokenReply;
use muster_common::model::UserRole;
use poem_openapi::payload::{Form, Json};
use poem_openapi::Object;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Object, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Object)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

impl From<TokenReply> for TokenResponse {
    fn from(value: TokenReply) -> Self {
        Self {
            access_token: value.access_token,
            token_type: value.token_type,
        }
    }
}

/// The control-plane endpoints: the token handshake, server requests
/// (including the pull tick) and status updates.
pub struct ControlApi {
    pub services: ApiServices,
}

#[poem_openapi::OpenApi]
impl ControlApi {
    /// Exchange credentials for a bearer token. Client workers transition
    /// online as a side effect.
    #[oai(path = "/token", method = "post", operation_id = "token")]
    async fn token(&self, form: Form<TokenRequest>) -> ApiResult<Json<TokenResponse>> {
        let user = self
            .services
            .users
            .authenticate(&form.0.username, &form.0.password)?;
        let token = self.services.tokens.mint(&user.username)?;

        if user.role == UserRole::Client {
            self.services.engine.connect(&user.username).await?;
        }

        Ok(Json(TokenReply::bearer(token).into()))
    }

    /// Typed request/response RPC. The body is `{datatype, data}`; the reply
    /// carries response data plus any produced files as blob ids.
    #[oai(
        path = "/serverrequest",
        method = "post",
        operation_id = "server_request"
    )]
    async fn server_request(
        &self,
        auth: BearerAuth,
        body: Json<serde_json::Value>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let user = self.services.authenticate(&auth.0)?;

        let request: muster_common::message::ServerRequest = serde_json::from_value(body.0)
            .map_err(|err| {
                ApiError::from(muster_common::error::CoreError::InvalidRequest(format!(
                    "Malformed server request: {err}"
                )))
            })?;
        debug!(worker = user.username, request = request.datatype(), "Server request");

        let response = self
            .services
            .engine
            .handle_server_request(request, &user.username)
            .await?;

        // produced file payloads go out of band
        let blob_ids = if response.contains_files() {
            self.services
                .engine
                .blobs()
                .put_all(&response.files, false, "server")
        } else {
            BTreeMap::new()
        };
        let wire = response.unload(blob_ids);

        Ok(Json(serde_json::to_value(wire).map_err(|err| {
            ApiError::internal(format!("Cannot serialize response: {err}"))
        })?))
    }

    /// Status updates from workers. File references are re-materialized from
    /// the blob store (and the blobs deleted) before absorption.
    #[oai(path = "/status", method = "post", operation_id = "status_update")]
    async fn status_update(
        &self,
        auth: BearerAuth,
        body: Json<serde_json::Value>,
    ) -> ApiResult<Json<serde_json::Value>> {
        let user = self.services.authenticate(&auth.0)?;

        let wire: muster_common::message::WireStatusUpdate = serde_json::from_value(body.0)
            .map_err(|err| {
                ApiError::from(muster_common::error::CoreError::InvalidRequest(format!(
                    "Malformed status update: {err}"
                )))
            })?;

        let mut files = BTreeMap::new();
        for (name, blob_id) in wire.blob_ids() {
            let bytes = self
                .services
                .engine
                .blobs()
                .fetch(blob_id, UserRole::Server)?;
            self.services.engine.blobs().delete(blob_id, UserRole::Server)?;
            files.insert(name, bytes);
        }

        let mut update = wire.refill(files)?;
        update.node_name = Some(user.username.clone());

        self.services.engine.handle_status_update(update).await?;
        Ok(Json(serde_json::Value::Null))
    }
}
