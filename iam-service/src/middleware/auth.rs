use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;

use crate::services::{ServiceError, TokenClaims};
use crate::AppState;

/// Validated caller of a bearer-protected route.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: TokenClaims,
    /// Raw access token, needed to revoke it on logout
    pub token: String,
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Require a valid, unrevoked access token. The rejection carries the exact
/// token error so clients can tell `token_expired` from `token_revoked`.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(&req)
        .ok_or(ServiceError::InvalidToken)?
        .to_string();

    let claims = state.auth.validate(&token).await?;

    req.extensions_mut().insert(AuthUser { claims, token });
    Ok(next.run(req).await)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Auth claims missing from request extensions")))
    }
}
