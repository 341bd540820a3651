use service_core::{
    axum::{
        extract::{ConnectInfo, State},
        http::{header, HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        Json,
    },
    error::AppError,
};
use std::net::SocketAddr;

use crate::{
    dtos::auth::{
        AuthResponse, ContinueRequest, LoginRequest, LogoutRequest, RefreshRequest,
        RegisterRequest, ValidateResponse, VerificationRequiredResponse,
    },
    middleware::AuthUser,
    models::VerificationContext,
    services::AuthOutcome,
    utils::ValidatedJson,
    AppState,
};

/// Request facts the verification plugins may look at.
fn request_context(
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    device_id: Option<String>,
) -> VerificationContext {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());

    VerificationContext {
        client_ip: forwarded.or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string())),
        device_id,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    }
}

fn outcome_response(outcome: AuthOutcome, success: StatusCode) -> Response {
    match outcome {
        AuthOutcome::Authenticated { tokens, user } => {
            (success, Json(AuthResponse { tokens, user })).into_response()
        }
        AuthOutcome::VerificationRequired(pending) => (
            StatusCode::ACCEPTED,
            Json(VerificationRequiredResponse {
                session_id: pending.session_id,
                next_plugin: pending.next_plugin,
                plugins: pending.plugins,
                user: pending.user,
            }),
        )
            .into_response(),
    }
}

/// Log in with email or username and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = AuthResponse),
        (status = 202, description = "Verification required", body = VerificationRequiredResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "User or application disabled", body = ErrorResponse),
        (status = 404, description = "Application not found", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let context = request_context(&headers, peer, req.device_id.clone());
    let outcome = state.auth.login(req, context).await?;
    Ok(outcome_response(outcome, StatusCode::OK))
}

/// Create an account
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Registered and authenticated", body = AuthResponse),
        (status = 202, description = "Verification required", body = VerificationRequiredResponse),
        (status = 409, description = "Email or username taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<Response, AppError> {
    let context = request_context(&headers, peer, req.device_id.clone());
    let outcome = state.auth.register(req, context).await?;
    Ok(outcome_response(outcome, StatusCode::CREATED))
}

/// Resume a login or registration once verification steps are recorded
#[utoipa::path(
    post,
    path = "/auth/continue",
    request_body = ContinueRequest,
    responses(
        (status = 200, description = "Authenticated", body = AuthResponse),
        (status = 202, description = "Verification still required", body = VerificationRequiredResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 410, description = "Session expired", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn continue_session(
    State(state): State<AppState>,
    Json(req): Json<ContinueRequest>,
) -> Result<Response, AppError> {
    let outcome = state.auth.continue_session(req.session_id).await?;
    Ok(outcome_response(outcome, StatusCode::OK))
}

/// Rotate a refresh token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Invalid, expired, revoked or superseded token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let pair = state.auth.refresh(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(pair)))
}

/// Revoke the caller's tokens
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Logged out"),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<LogoutRequest>,
) -> Result<StatusCode, AppError> {
    state
        .auth
        .logout(&user.claims, &user.token, req.refresh_token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate the presented access token
#[utoipa::path(
    get,
    path = "/auth/validate",
    responses(
        (status = 200, description = "Token is valid", body = ValidateResponse),
        (status = 401, description = "Token invalid, expired or revoked", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn validate(user: AuthUser) -> Json<ValidateResponse> {
    let claims = user.claims;
    Json(ValidateResponse {
        valid: true,
        user_id: claims.sub,
        tenant_id: claims.tenant_id,
        username: claims.username,
        scope: claims.scope,
        expires_at: claims.exp,
    })
}
