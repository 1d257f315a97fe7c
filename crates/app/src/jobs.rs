use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use workfinder_core::guard;
use workfinder_core::types::{Job, Role};
use workfinder_storage::{JobChanges, NewJob};

use crate::auth::AuthenticatedUser;
use crate::response::{parse_path_id, ApiError, ApiResponse};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub salary: f64,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub category_id: Option<Uuid>,
}

/// Content fields a client may change. `closed` is owned by the approval flow.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateJobRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub company: Option<String>,
    pub logo: Option<String>,
    pub status: Option<String>,
    pub salary: Option<f64>,
    pub location: Option<String>,
}

pub async fn list(State(state): State<AppState>) -> Result<ApiResponse<Vec<Job>>, ApiError> {
    let jobs = state.storage().jobs().find_all().await?;
    Ok(ApiResponse::ok("success get all jobs", jobs))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<ApiResponse<Job>, ApiError> {
    let job_id = parse_path_id(&job_id)?;
    let job = state.storage().jobs().find_by_id(job_id).await?;
    Ok(ApiResponse::ok("success get job details", job))
}

pub async fn shared(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
) -> Result<ApiResponse<Vec<Job>>, ApiError> {
    guard::require_role(&caller, &[Role::Client])?;
    let jobs = state.storage().jobs().find_shared(caller.id).await?;
    Ok(ApiResponse::ok("success get shared jobs", jobs))
}

pub async fn applied(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
) -> Result<ApiResponse<Vec<Job>>, ApiError> {
    guard::require_role(&caller, &[Role::Applicant])?;
    let jobs = state.storage().jobs().find_applied(caller.id).await?;
    Ok(ApiResponse::ok("success get applied jobs", jobs))
}

pub async fn create(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<ApiResponse<Job>, ApiError> {
    guard::require_role(&caller, &[Role::Client])?;
    let Json(body) = body?;
    if body.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }

    let job = state
        .storage()
        .jobs()
        .create(&NewJob {
            title: body.title,
            description: body.description,
            company: body.company,
            logo: body.logo,
            status: body.status,
            salary: body.salary,
            location: body.location,
            category_id: body.category_id,
            client_id: caller.id,
        })
        .await?;
    Ok(ApiResponse::ok("success create job", job))
}

pub async fn update(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(job_id): Path<String>,
    body: Result<Json<UpdateJobRequest>, JsonRejection>,
) -> Result<ApiResponse<Job>, ApiError> {
    guard::require_role(&caller, &[Role::Client])?;
    let job_id = parse_path_id(&job_id)?;
    let Json(body) = body?;

    let jobs = state.storage().jobs();
    let current = jobs.find_by_id_uncached(job_id).await?;
    guard::require_owner(caller.id, current.client_id)?;

    let job = jobs
        .update(
            job_id,
            &JobChanges {
                title: body.title,
                description: body.description,
                company: body.company,
                logo: body.logo,
                status: body.status,
                salary: body.salary,
                location: body.location,
            },
        )
        .await?;
    Ok(ApiResponse::ok("success update job", job))
}
