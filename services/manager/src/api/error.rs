//! RFC 7807 problem documents for API errors.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::backupstore::BackupStoreError;
use crate::error::ManagerError;
use crate::runtime::RuntimeError;
use crate::scheduler::SchedulingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://holdfast.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn insufficient_storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INSUFFICIENT_STORAGE, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }
}

fn status_for(error: &ManagerError) -> StatusCode {
    match error {
        ManagerError::NotFound { .. } => StatusCode::NOT_FOUND,
        ManagerError::AlreadyExists { .. }
        | ManagerError::InvalidState(_)
        | ManagerError::IncrementalRestoreInProgress { .. } => StatusCode::CONFLICT,
        ManagerError::InvalidArgument(_)
        | ManagerError::Id(_)
        | ManagerError::BackupTargetNotSet => StatusCode::BAD_REQUEST,
        ManagerError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
        ManagerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ManagerError::Scheduling(e) => match e {
            SchedulingError::NoFit { .. } | SchedulingError::InsufficientForExpansion { .. } => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            SchedulingError::NodeNotFound(_) | SchedulingError::DiskNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
        },
        ManagerError::BackupStore(e) => match e {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            BackupStoreError::InvalidTarget(_) | BackupStoreError::InvalidUrl(_) => {
                StatusCode::BAD_REQUEST
            }
            BackupStoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        ManagerError::Runtime(e) => match e {
            RuntimeError::InstanceNotFound { .. } | RuntimeError::SnapshotNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RuntimeError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
            RuntimeError::NotRunning(_)
            | RuntimeError::NotInEngine { .. }
            | RuntimeError::NoReadableReplica(_) => StatusCode::CONFLICT,
        },
        ManagerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ManagerError> for ApiError {
    fn from(error: ManagerError) -> Self {
        let status = status_for(&error);
        if status.is_server_error() && status != StatusCode::INSUFFICIENT_STORAGE {
            tracing::error!(error = %error, "Request failed");
        }
        let mut api = ApiError::new(status, error.code(), error.to_string());
        api.problem.retryable = status == StatusCode::SERVICE_UNAVAILABLE;
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ManagerError::not_found("volume", "v1"), StatusCode::NOT_FOUND)]
    #[case(ManagerError::invalid_state("attached elsewhere"), StatusCode::CONFLICT)]
    #[case(ManagerError::invalid_argument("size"), StatusCode::BAD_REQUEST)]
    #[case(
        ManagerError::IncrementalRestoreInProgress {
            volume: "v1".into(),
            last_restored: "backup-a".into(),
            last_backup: "backup-b".into(),
        },
        StatusCode::CONFLICT
    )]
    #[case(
        ManagerError::Scheduling(SchedulingError::NoFit { volume: "v1".into(), size: 1 }),
        StatusCode::INSUFFICIENT_STORAGE
    )]
    #[case(
        ManagerError::BackupStore(BackupStoreError::VolumeNotFound("v1".into())),
        StatusCode::NOT_FOUND
    )]
    #[case(ManagerError::Unavailable("v1".into()), StatusCode::SERVICE_UNAVAILABLE)]
    fn test_status_mapping(#[case] error: ManagerError, #[case] expected: StatusCode) {
        let api = ApiError::from(error);
        assert_eq!(api.status, expected);
        assert_eq!(api.problem.status, expected.as_u16());
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::conflict("invalid_state", "busy")
            .with_request_id("req-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
