// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod control;
mod files;

pub use control::ControlApi;
pub use files::StorageApi;

use crate::auth::{AuthError, TokenIssuer, User, UserStore};
use crate::engine::Engine;
use muster_common::error::CoreError;
use muster_common::SafeDisplay;
use poem::Request;
use poem_openapi::auth::Bearer;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApiService, SecurityScheme};
use std::sync::Arc;

/// The raw bearer token as presented by the caller.
#[derive(Debug, Clone)]
pub struct TokenSecret(pub String);

#[derive(SecurityScheme)]
#[oai(rename = "Token", ty = "bearer", checker = "bearer_checker")]
pub struct BearerAuth(pub TokenSecret);

async fn bearer_checker(_: &Request, bearer: Bearer) -> Option<TokenSecret> {
    Some(TokenSecret(bearer.token))
}

#[derive(Debug, Clone, PartialEq, Object)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Object)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    /// Invalid request, returning with a list of issues detected in the request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Unauthorized request
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Forbidden request
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    /// Entity not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    /// Malformed payload
    #[oai(status = 422)]
    InvalidRequest(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn unauthorized(error: impl Into<String>) -> Self {
        ApiError::Unauthorized(Json(ErrorBody {
            error: error.into(),
        }))
    }

    pub fn internal(error: impl Into<String>) -> Self {
        ApiError::InternalError(Json(ErrorBody {
            error: error.into(),
        }))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        let body = Json(ErrorBody {
            error: value.to_safe_string(),
        });
        match value {
            CoreError::Unauthorized(_) => ApiError::Unauthorized(body),
            CoreError::Forbidden(_) => ApiError::Forbidden(body),
            CoreError::NotFound(_) => ApiError::NotFound(body),
            CoreError::Conflict(_) | CoreError::Topology(_) => ApiError::Conflict(body),
            CoreError::InvalidRequest(_) => ApiError::InvalidRequest(body),
            CoreError::RequestDenied(_) => ApiError::BadRequest(Json(ErrorsBody {
                errors: vec![body.0.error],
            })),
            CoreError::AbstractCommand(_)
            | CoreError::ServerRequest(_)
            | CoreError::Aggregation(_)
            | CoreError::ClientConfiguration(_) => ApiError::InternalError(body),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::Internal(_) => ApiError::internal(value.to_safe_string()),
            _ => ApiError::unauthorized(value.to_safe_string()),
        }
    }
}

/// Shared handles of the API endpoint groups.
#[derive(Clone)]
pub struct ApiServices {
    pub engine: Arc<Engine>,
    pub users: Arc<UserStore>,
    pub tokens: Arc<TokenIssuer>,
}

impl ApiServices {
    /// Resolves a bearer token into the calling user; the username is the
    /// worker identity for all routing.
    pub fn authenticate(&self, token: &TokenSecret) -> Result<User, ApiError> {
        let username = self.tokens.verify(&token.0)?;
        self.users
            .get_user(&username)
            .ok_or_else(|| ApiError::unauthorized("Invalid authentication credentials"))
    }
}

pub struct HealthcheckApi;

#[derive(Debug, Clone, PartialEq, Object)]
pub struct HealthcheckResponse {
    pub status: String,
}

#[poem_openapi::OpenApi]
impl HealthcheckApi {
    #[oai(path = "/healthcheck", method = "get", operation_id = "healthcheck")]
    async fn healthcheck(&self) -> Json<HealthcheckResponse> {
        Json(HealthcheckResponse {
            status: "ok".to_string(),
        })
    }
}

pub type Apis = (ControlApi, StorageApi, HealthcheckApi);

pub fn make_open_api_service(services: &ApiServices) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            ControlApi {
                services: services.clone(),
            },
            StorageApi {
                services: services.clone(),
            },
            HealthcheckApi,
        ),
        "Muster API",
        "1.0",
    )
}
