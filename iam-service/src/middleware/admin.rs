use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use subtle::ConstantTimeEq;

use crate::AppState;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let expected = state.config.security.admin_api_key.as_bytes();

    if presented.is_empty() || !bool::from(presented.as_bytes().ct_eq(expected)) {
        tracing::warn!("Failed admin authentication attempt");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid or missing admin API key"
        )));
    }

    Ok(next.run(request).await)
}
