use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for Tollway services
#[derive(Debug, thiserror::Error)]
pub enum TollwayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(String),
}

/// Standard error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl TollwayError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "database")]
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Returns a message that is safe to show to API clients.
    ///
    /// Server errors (5xx) collapse to a generic message; the full error is
    /// only written to the server log.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::Internal(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable, please try again later".to_string(),
            #[cfg(feature = "database")]
            Self::Database(_) => "Database error".to_string(),
        }
    }
}

impl IntoResponse for TollwayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: self.safe_message(),
            error_id,
        });

        (status, body).into_response()
    }
}

/// Result type alias for Tollway operations
pub type Result<T> = std::result::Result<T, TollwayError>;

impl From<serde_json::Error> for TollwayError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TollwayError::BadRequest(format!("JSON error: {}", err))
        } else {
            TollwayError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for TollwayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TollwayError::RequestTimeout
        } else if err.is_connect() {
            TollwayError::ServiceUnavailable(format!("Connection error: {}", err))
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => TollwayError::Unauthorized("Upstream authentication failed".to_string()),
                404 => TollwayError::NotFound("Upstream resource not found".to_string()),
                409 => TollwayError::Conflict("Upstream conflict".to_string()),
                503 => TollwayError::ServiceUnavailable("Upstream service unavailable".to_string()),
                _ => TollwayError::Internal(format!("Upstream error: {}", err)),
            }
        } else {
            TollwayError::Internal(format!("Request error: {}", err))
        }
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for TollwayError {
    fn from(err: sea_orm::DbErr) -> Self {
        TollwayError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TollwayError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(TollwayError::conflict("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            TollwayError::service_unavailable("x").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_safe_message_hides_internal_details() {
        let err = TollwayError::internal("db password leaked in message");
        assert_eq!(err.safe_message(), "Internal server error");

        let err = TollwayError::bad_request("not an upgrade");
        assert!(err.safe_message().contains("not an upgrade"));
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let err: TollwayError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, TollwayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_into_response_status() {
        let response = TollwayError::unauthorized("bad signature").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
