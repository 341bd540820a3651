pub mod auth;
pub mod oauth;
pub mod rules;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error envelope produced by `AppError`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "Token expired")]
    pub error: String,
    #[schema(example = "token_expired")]
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}
