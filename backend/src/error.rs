use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::{ErrorBody, ErrorKind};
use std::fmt;

use crate::auth::jwt::JwtError;
use crate::inference::{JobError, ModelError};
use crate::storage::{ArtifactError, WorkspaceError};

/// Error returned by every handler; renders as `{"kind": .., "message": ..}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.kind, self.message.clone())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound | ErrorKind::InputNotFound | ErrorKind::ModelNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorKind::PathEscape | ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::InvalidExtension | ErrorKind::InvalidModelFormat | ErrorKind::BadRequest => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NoActiveModel => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ModelLoadError | ErrorKind::InferenceError | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        status_for(self.kind)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("{} {}", status, self);
        } else {
            log::debug!("{} {}", status, self);
        }
        HttpResponse::build(status).json(self.body())
    }
}

macro_rules! from_component_error {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(err: $ty) -> Self {
                    ApiError::new(err.kind(), err.to_string())
                }
            }
        )+
    };
}

from_component_error!(WorkspaceError, ArtifactError, ModelError, JobError);

impl From<JwtError> for ApiError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Encoding(_) => ApiError::internal(err.to_string()),
            _ => ApiError::unauthorized(err.to_string()),
        }
    }
}

impl From<actix_multipart::MultipartError> for ApiError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        ApiError::bad_request(format!("malformed multipart body: {err}"))
    }
}
