use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Deserialize;

use workfinder_core::types::Application;

use crate::auth::AuthenticatedUser;
use crate::response::{parse_path_id, ApiError, ApiResponse};
use crate::router::AppState;

/// Body of an apply request. A `status` field is accepted and ignored: new
/// applications always start `Pending`.
#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub message: String,
}

pub async fn apply(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(job_id): Path<String>,
    body: Result<Json<ApplyRequest>, JsonRejection>,
) -> Result<ApiResponse<()>, ApiError> {
    let job_id = parse_path_id(&job_id)?;
    let Json(body) = body?;
    state
        .lifecycle()
        .apply(&caller, job_id, &body.message)
        .await?;
    Ok(ApiResponse::ok("success apply job", ()))
}

pub async fn withdraw(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(application_id): Path<String>,
) -> Result<ApiResponse<()>, ApiError> {
    let application_id = parse_path_id(&application_id)?;
    state.lifecycle().withdraw(&caller, application_id).await?;
    Ok(ApiResponse::ok("success withdraw job", ()))
}

pub async fn approve(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(application_id): Path<String>,
) -> Result<ApiResponse<()>, ApiError> {
    let application_id = parse_path_id(&application_id)?;
    state.lifecycle().approve(&caller, application_id).await?;
    Ok(ApiResponse::ok("success approve job", ()))
}

pub async fn find(
    State(state): State<AppState>,
    AuthenticatedUser(_caller): AuthenticatedUser,
    Path(application_id): Path<String>,
) -> Result<ApiResponse<Application>, ApiError> {
    let application_id = parse_path_id(&application_id)?;
    let application = state.lifecycle().find_by_id(application_id).await?;
    Ok(ApiResponse::ok("success find job applicant", application))
}
