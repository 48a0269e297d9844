//! JSON request handlers for the `/api/<op>` endpoint set.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cellar_core::error::Error;
use cellar_core::model::{ByteBuf, Version};
use serde_derive::{Deserialize, Serialize};

use crate::{AppState, AuthenticatedCaller};

/// Maps a `cellar_core::Error` onto the HTTP status it is contractually
/// bound to. `ValueNotChanged` carries an empty JSON body; every other
/// error carries its message as plain text.
pub fn error_response(err: Error) -> Response {
    match err {
        Error::ValueNotChanged => {
            (StatusCode::NOT_MODIFIED, Json(serde_json::json!({}))).into_response()
        }
        Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
        Error::AccessDenied(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
        Error::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        Error::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
    }
}

#[derive(Deserialize)]
pub struct InfoRequest {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
pub struct GetRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version", default)]
    version: Version,
    #[serde(rename = "UpdateIfChanged", default)]
    update_if_changed: bool,
}

#[derive(Deserialize)]
pub struct PutRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: ByteBuf,
}

#[derive(Deserialize)]
pub struct ActivateRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version")]
    version: Version,
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
pub struct DeleteVersionRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Version")]
    version: Version,
}

#[derive(Serialize)]
pub struct SecretInfoResponse {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Versions")]
    versions: Vec<Version>,
    #[serde(rename = "ActiveVersion")]
    active_version: Version,
}

impl From<cellar_core::model::SecretInfo> for SecretInfoResponse {
    fn from(info: cellar_core::model::SecretInfo) -> Self {
        SecretInfoResponse {
            name: info.name,
            versions: info.versions,
            active_version: info.active_version,
        }
    }
}

#[derive(Serialize)]
pub struct SecretValueResponse {
    #[serde(rename = "Value")]
    value: ByteBuf,
    #[serde(rename = "Version")]
    version: Version,
}

impl From<cellar_core::model::SecretValue> for SecretValueResponse {
    fn from(value: cellar_core::model::SecretValue) -> Self {
        SecretValueResponse {
            value: ByteBuf(value.value),
            version: value.version,
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
) -> Response {
    match state.db.list(&caller) {
        Ok(infos) => Json(
            infos
                .into_iter()
                .map(SecretInfoResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn info(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(req): Json<InfoRequest>,
) -> Response {
    match state.db.info(&caller, &req.name) {
        Ok(info) => Json(SecretInfoResponse::from(info)).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn get(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(req): Json<GetRequest>,
) -> Response {
    match state
        .db
        .get_conditional(&caller, &req.name, req.version, req.update_if_changed)
    {
        Ok(value) => Json(SecretValueResponse::from(value)).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn put(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(req): Json<PutRequest>,
) -> Response {
    match state.db.put(&caller, &req.name, req.value.0) {
        Ok(version) => Json(version).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn activate(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(req): Json<ActivateRequest>,
) -> Response {
    match state.db.activate(&caller, &req.name, req.version) {
        Ok(()) => Json(serde_json::json!({})).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn delete(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(req): Json<DeleteRequest>,
) -> Response {
    match state.db.delete(&caller, &req.name) {
        Ok(()) => Json(serde_json::json!({})).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn delete_version(
    State(state): State<AppState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(req): Json<DeleteVersionRequest>,
) -> Response {
    match state.db.delete_version(&caller, &req.name, req.version) {
        Ok(()) => Json(serde_json::json!({})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    write_generation: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        write_generation: state.db.write_generation(),
    })
}
