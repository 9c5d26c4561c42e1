use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tributary_core::sources::DsRefs;
use tributary_core::{Error as CoreError, ErrorKind};

/// Status used for requests whose work was cancelled.
pub const STATUS_CANCELLED: u16 = 499;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refs: Option<DsRefs>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Core(e) => e.kind(),
            ApiError::InvalidInput(_) => ErrorKind::BadInput,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            // upstream said no after retries
            ApiError::Core(CoreError::HttpStatus { .. }) => StatusCode::BAD_GATEWAY,
            _ => match self.kind() {
                ErrorKind::BadInput => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
                ErrorKind::Cancelled => {
                    StatusCode::from_u16(STATUS_CANCELLED).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }
        let refs = match &self {
            ApiError::Core(CoreError::Referenced { refs, .. }) => Some(refs.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            refs,
        };
        (code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        let cases = [
            (CoreError::InvalidInput("x".into()), 400),
            (CoreError::NotFound("x".into()), 404),
            (CoreError::Conflict("x".into()), 409),
            (CoreError::Unauthorized("x".into()), 401),
            (CoreError::Cancelled("x".into()), 499),
            (
                CoreError::HttpStatus {
                    status: 403,
                    message: "x".into(),
                },
                502,
            ),
            (CoreError::BackendMessage("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).into_response().status().as_u16(), code);
        }
    }
}
