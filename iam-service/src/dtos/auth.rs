use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{PluginRequirement, UserSnapshot};
use crate::services::TokenPair;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    pub app_id: Uuid,

    /// Email address or username
    #[validate(length(min = 1, max = 255, message = "Login is required"))]
    #[schema(example = "user@example.com")]
    pub login: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,

    #[schema(example = "laptop-7f3a")]
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    pub app_id: Uuid,

    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    #[schema(example = "alice")]
    pub username: String,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "password123", min_length = 8)]
    pub password: String,

    #[validate(length(min = 5, max = 32, message = "Invalid phone number"))]
    pub phone: Option<String>,

    #[schema(example = "Alice Example")]
    pub display_name: Option<String>,

    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ContinueRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutRequest {
    /// Also revoked when present
    pub refresh_token: Option<String>,
}

/// Tokens plus the authenticated user.
#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: UserSnapshot,
}

/// Returned with `202 Accepted` while verification steps remain.
#[derive(Debug, Serialize, ToSchema)]
pub struct VerificationRequiredResponse {
    pub session_id: Uuid,
    #[schema(example = "email_code")]
    pub next_plugin: Option<String>,
    pub plugins: Vec<PluginRequirement>,
    pub user: Option<UserSnapshot>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ValidateResponse {
    pub valid: bool,
    pub user_id: String,
    pub tenant_id: Uuid,
    pub username: String,
    pub scope: String,
    pub expires_at: i64,
}
