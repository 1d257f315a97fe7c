use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use workfinder_core::guard::Denied;
use workfinder_storage::{JobError, UserError};

/// Success envelope: `{code, message, data}`. `data` is serialized even when null.
#[derive(Debug, Serialize)]
struct SuccessBody<T> {
    code: u16,
    message: &'static str,
    data: T,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

pub struct ApiResponse<T> {
    status: StatusCode,
    message: &'static str,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: &'static str, data: T) -> Self {
        Self {
            status: StatusCode::OK,
            message,
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = SuccessBody {
            code: self.status.as_u16(),
            message: self.message,
            data: self.data,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Error envelope whose HTTP status mirrors `code`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// Logs `source` and hides it behind a generic message.
    pub fn internal(source: &dyn std::error::Error) -> Self {
        error!(stage = "app", error = %source, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.status.as_u16(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::bad_request(value.body_text())
    }
}

impl From<Denied> for ApiError {
    fn from(value: Denied) -> Self {
        Self::forbidden(value.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(value: JobError) -> Self {
        match value {
            JobError::NotFound => Self::not_found("job not found"),
            JobError::MissingReference => Self::bad_request(value.to_string()),
            JobError::Database(_) => Self::internal(&value),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(value: UserError) -> Self {
        match value {
            UserError::NotFound => Self::not_found("user not found"),
            UserError::EmailTaken => Self::new(StatusCode::CONFLICT, value.to_string()),
            UserError::Database(_) => Self::internal(&value),
        }
    }
}

/// Parses a path segment as an id, answering 400 in the error envelope.
pub fn parse_path_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("invalid id: {raw}")))
}
