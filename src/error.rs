use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::{json, Map, Value};
use thiserror::Error;
use validator::ValidationErrors;

/// Error returned by every API handler.
///
/// Client errors carry a message that is safe to echo back. Database and
/// internal errors are logged in full and answered with a generic body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Field-keyed errors, rendered as `{"field": ["message"]}`.
    #[error("validation failed")]
    Validation(Value),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Not found.")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Failures talking to an outbound system (OpenEMR, Zoom).
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status} from {resource}")]
    Status { resource: &'static str, status: u16 },

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Config(String),
}

impl ApiError {
    /// Single-field validation error.
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let message: String = message.into();
        let mut fields = Map::new();
        fields.insert(field.to_string(), json!([message]));
        ApiError::Validation(Value::Object(fields))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                ApiError::Conflict("A record with these values already exists".to_string())
            }
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23503") => {
                ApiError::BadRequest("Referenced record does not exist".to_string())
            }
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23514") => {
                ApiError::BadRequest("Value is not a valid choice".to_string())
            }
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("22001") => {
                ApiError::BadRequest("Value is too long for this field".to_string())
            }
            other => ApiError::Database(other),
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        let mut fields = Map::new();
        for (field, errs) in errors.field_errors() {
            let messages: Vec<Value> = errs
                .iter()
                .map(|e| {
                    let msg = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid value ({})", e.code));
                    Value::String(msg)
                })
                .collect();
            fields.insert(field.to_string(), Value::Array(messages));
        }
        ApiError::Validation(Value::Object(fields))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ApiError::Validation(fields) => fields.clone(),
            ApiError::NotFound => json!({"detail": "Not found."}),
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                json!({"error": "Internal server error"})
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                json!({"error": "Internal server error"})
            }
            other => json!({"error": other.to_string()}),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
