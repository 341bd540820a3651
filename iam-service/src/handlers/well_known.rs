use service_core::axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::AppState;

/// OpenID provider metadata
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    responses(
        (status = 200, description = "Discovery document", body = DiscoveryDocument)
    ),
    tag = "Well-Known"
)]
pub async fn openid_configuration(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.oauth.discovery()),
    )
}

/// JSON Web Key Set used to verify every token this service signs
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Public JWKS", body = Jwks)
    ),
    tag = "Well-Known"
)]
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.tokens.jwt().jwks()),
    )
}
