use axum::extract::{Path, State};

use workfinder_core::types::User;

use crate::auth::AuthenticatedUser;
use crate::response::{parse_path_id, ApiError, ApiResponse};
use crate::router::AppState;

pub async fn list(
    State(state): State<AppState>,
    AuthenticatedUser(_caller): AuthenticatedUser,
) -> Result<ApiResponse<Vec<User>>, ApiError> {
    let users = state.storage().users().find_all().await?;
    Ok(ApiResponse::ok("success get all users", users))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<ApiResponse<User>, ApiError> {
    let user_id = parse_path_id(&user_id)?;
    let user = state.storage().users().find_by_id(user_id).await?;
    Ok(ApiResponse::ok("success get user", user))
}

/// Returns the caller's own profile.
pub async fn profile(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
) -> Result<ApiResponse<User>, ApiError> {
    let user = state.storage().users().find_by_id(caller.id).await?;
    Ok(ApiResponse::ok("success get user", user))
}
