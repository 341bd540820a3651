//! OAuth2 endpoints. The token endpoint speaks RFC 6749 errors rather than
//! the service-wide error envelope.

use service_core::{
    axum::{
        extract::{rejection::FormRejection, State},
        http::{header, HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        Form, Json,
    },
    error::AppError,
};

use crate::{
    dtos::oauth::{AuthorizeRequest, AuthorizeResponse, OAuthErrorResponse, TokenRequest},
    middleware::AuthUser,
    services::{ClientCredentials, ServiceError},
    utils::ValidatedJson,
    AppState,
};

/// `ServiceError` rendered as an OAuth error body.
#[derive(Debug)]
pub struct OAuthError(pub ServiceError);

impl From<ServiceError> for OAuthError {
    fn from(err: ServiceError) -> Self {
        OAuthError(err)
    }
}

impl OAuthError {
    pub fn error_code(&self) -> &'static str {
        match &self.0 {
            ServiceError::InvalidClient => "invalid_client",
            ServiceError::UnauthorizedClient => "unauthorized_client",
            ServiceError::InvalidGrant(_)
            | ServiceError::InvalidToken
            | ServiceError::TokenExpired
            | ServiceError::TokenRevoked => "invalid_grant",
            ServiceError::InvalidScope(_) => "invalid_scope",
            ServiceError::UnsupportedGrantType(_) => "unsupported_grant_type",
            ServiceError::UnsupportedResponseType(_) => "unsupported_response_type",
            ServiceError::InvalidRequest(_) | ServiceError::InvalidRedirectUri => "invalid_request",
            ServiceError::StoreTimeout(_) => "temporarily_unavailable",
            _ => "server_error",
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let error = self.error_code();
        let (status, description) = match error {
            "invalid_client" => (StatusCode::UNAUTHORIZED, Some(self.0.to_string())),
            "server_error" => {
                tracing::error!(error = %self.0, "Token endpoint failure");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            "temporarily_unavailable" => {
                tracing::error!(error = %self.0, "Token endpoint store timeout");
                (StatusCode::SERVICE_UNAVAILABLE, None)
            }
            _ => (StatusCode::BAD_REQUEST, Some(self.0.to_string())),
        };

        let body = Json(OAuthErrorResponse {
            error: error.to_string(),
            error_description: description,
        });

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Basic")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Issue an authorization code for the signed-in user
#[utoipa::path(
    post,
    path = "/oauth/authorize",
    request_body = AuthorizeRequest,
    responses(
        (status = 200, description = "Redirect URI carrying the code", body = AuthorizeResponse),
        (status = 400, description = "Invalid redirect URI, scope or response type", body = ErrorResponse),
        (status = 401, description = "Unknown client or invalid token", body = ErrorResponse),
        (status = 403, description = "Client not allowed the authorization_code grant", body = ErrorResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn authorize(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, AppError> {
    let redirect_uri = state.oauth.authorize(&user.claims, req).await?;
    Ok(Json(AuthorizeResponse { redirect_uri }))
}

/// Token endpoint (authorization_code and refresh_token grants)
#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "OAuth error", body = OAuthErrorResponse),
        (status = 401, description = "Client authentication failed", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response, OAuthError> {
    let Form(req) = form.map_err(|e| ServiceError::InvalidRequest(e.body_text()))?;

    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credentials = ClientCredentials::resolve(basic, &req);

    let response = state.oauth.issue_token(credentials, req).await?;
    Ok((
        [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
        Json(response),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_failures_are_bad_requests() {
        let response = OAuthError(ServiceError::InvalidGrant("used".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn client_failures_challenge_basic() {
        let response = OAuthError(ServiceError::InvalidClient).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = OAuthError(ServiceError::Internal(anyhow::anyhow!("db exploded")));
        assert_eq!(err.error_code(), "server_error");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
