use axum::http::StatusCode;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User is disabled")]
    UserDisabled,

    #[error("Application not found")]
    ApplicationNotFound,

    #[error("Application is disabled")]
    ApplicationDisabled,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Verification session not found")]
    SessionNotFound,

    #[error("Verification session expired")]
    SessionExpired,

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Client authentication failed")]
    InvalidClient,

    #[error("Client is not authorized for this grant")]
    UnauthorizedClient,

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("Unsupported response type: {0}")]
    UnsupportedResponseType(String),

    #[error("Redirect URI is not registered for this client")]
    InvalidRedirectUri,

    #[error("Rule not found")]
    RuleNotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out: {0}")]
    StoreTimeout(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidCredentials => "invalid_credentials",
            ServiceError::UserDisabled => "user_disabled",
            ServiceError::ApplicationNotFound => "application_not_found",
            ServiceError::ApplicationDisabled => "application_disabled",
            ServiceError::UserAlreadyExists => "user_already_exists",
            ServiceError::InvalidToken => "invalid_token",
            ServiceError::TokenExpired => "token_expired",
            ServiceError::TokenRevoked => "token_revoked",
            ServiceError::SessionNotFound => "session_not_found",
            ServiceError::SessionExpired => "session_expired",
            ServiceError::PluginNotFound(_) => "plugin_not_found",
            ServiceError::InvalidClient => "invalid_client",
            ServiceError::UnauthorizedClient => "unauthorized_client",
            ServiceError::InvalidGrant(_) => "invalid_grant",
            ServiceError::InvalidScope(_) => "invalid_scope",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::UnsupportedGrantType(_) => "unsupported_grant_type",
            ServiceError::UnsupportedResponseType(_) => "unsupported_response_type",
            ServiceError::InvalidRedirectUri => "invalid_redirect_uri",
            ServiceError::RuleNotFound => "rule_not_found",
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Database(_) => "database_error",
            ServiceError::Redis(_) => "cache_error",
            ServiceError::StoreTimeout(_) => "store_timeout",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Status used when the error crosses the HTTP boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidCredentials
            | ServiceError::InvalidToken
            | ServiceError::TokenExpired
            | ServiceError::TokenRevoked
            | ServiceError::InvalidClient => StatusCode::UNAUTHORIZED,
            ServiceError::UserDisabled
            | ServiceError::ApplicationDisabled
            | ServiceError::UnauthorizedClient => StatusCode::FORBIDDEN,
            ServiceError::ApplicationNotFound
            | ServiceError::SessionNotFound
            | ServiceError::PluginNotFound(_)
            | ServiceError::RuleNotFound => StatusCode::NOT_FOUND,
            ServiceError::SessionExpired => StatusCode::GONE,
            ServiceError::UserAlreadyExists => StatusCode::CONFLICT,
            ServiceError::InvalidGrant(_)
            | ServiceError::InvalidScope(_)
            | ServiceError::InvalidRequest(_)
            | ServiceError::UnsupportedGrantType(_)
            | ServiceError::UnsupportedResponseType(_)
            | ServiceError::InvalidRedirectUri => StatusCode::BAD_REQUEST,
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::StoreTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Database(_) | ServiceError::Redis(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for infrastructure failures that should never leak details.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_)
                | ServiceError::Redis(_)
                | ServiceError::StoreTimeout(_)
                | ServiceError::Internal(_)
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Redis(e) => AppError::RedisError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::StoreTimeout(op) => {
                tracing::error!(operation = %op, "Store operation timed out");
                AppError::ServiceUnavailable
            }
            other => AppError::rejected(other.status(), other.code(), other.to_string()),
        }
    }
}
