pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use service_core::axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, security_headers_middleware, REQUEST_ID_HEADER};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{IamConfig, SwaggerMode};
use crate::middleware::admin::ADMIN_API_KEY_HEADER;
use crate::services::{
    ApplicationStore, AuthService, Database, JwtService, OAuthRepository, OAuthService,
    PluginRegistry, RuleEngine, RuleRepository, SharedStore, TokenService, UserDirectory,
    VerificationRepository, VerificationService,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::well_known::openid_configuration,
        handlers::well_known::jwks,
        handlers::auth::login,
        handlers::auth::register,
        handlers::auth::continue_session,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::validate,
        handlers::oauth::authorize,
        handlers::oauth::token,
        handlers::rules::list_rules,
        handlers::rules::create_rule,
        handlers::rules::get_rule,
        handlers::rules::update_rule,
        handlers::rules::delete_rule,
        handlers::rules::set_enabled,
        handlers::rules::evaluate,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::LoginRequest,
            dtos::auth::RegisterRequest,
            dtos::auth::ContinueRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::LogoutRequest,
            dtos::auth::AuthResponse,
            dtos::auth::VerificationRequiredResponse,
            dtos::auth::ValidateResponse,
            dtos::oauth::AuthorizeRequest,
            dtos::oauth::AuthorizeResponse,
            dtos::oauth::TokenRequest,
            dtos::oauth::TokenResponse,
            dtos::oauth::OAuthErrorResponse,
            dtos::oauth::DiscoveryDocument,
            dtos::rules::EvaluateRequest,
            dtos::rules::SetEnabledRequest,
            services::TokenPair,
            services::Jwks,
            services::jwt::Jwk,
            services::RuleDecision,
            services::rules::MatchedRule,
            services::rules::RuleFailure,
            models::UserSnapshot,
            models::PluginRequirement,
            models::PluginState,
            models::ExecutionStage,
            models::Rule,
            models::RuleCondition,
            models::RuleEffect,
            models::NewRule,
            models::NewCondition,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Login, registration and token lifecycle"),
        (name = "OAuth", description = "OAuth2 authorization-code flow with OpenID Connect"),
        (name = "Rules", description = "Attribute-based access rules"),
        (name = "Well-Known", description = "Public service metadata"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(ADMIN_API_KEY_HEADER))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IamConfig>,
    pub auth: AuthService,
    pub tokens: TokenService,
    pub verification: VerificationService,
    pub rules: RuleEngine,
    pub oauth: OAuthService,
    pub store: Arc<dyn SharedStore>,
    /// Absent when running against in-memory repositories.
    pub database: Option<Database>,
}

impl AppState {
    /// Wire every engine service over one repository implementation.
    pub fn assemble<R>(
        config: IamConfig,
        repo: Arc<R>,
        store: Arc<dyn SharedStore>,
        jwt: JwtService,
        plugins: PluginRegistry,
        database: Option<Database>,
    ) -> Self
    where
        R: ApplicationStore
            + UserDirectory
            + RuleRepository
            + VerificationRepository
            + OAuthRepository
            + 'static,
    {
        let tokens = TokenService::new(jwt, store.clone());
        let verification =
            VerificationService::new(repo.clone(), Arc::new(plugins), &config.verification);
        let rules = RuleEngine::new(repo.clone(), store.clone(), config.rules.cache_ttl_seconds);
        let oauth = OAuthService::new(repo.clone(), repo.clone(), tokens.clone(), &config.oauth);
        let auth = AuthService::new(
            repo.clone(),
            repo,
            store.clone(),
            tokens.clone(),
            verification.clone(),
        );

        Self {
            config: Arc::new(config),
            auth,
            tokens,
            verification,
            rules,
            oauth,
            store,
            database,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/applications/:app_id/rules",
            get(handlers::rules::list_rules).post(handlers::rules::create_rule),
        )
        .route(
            "/applications/:app_id/rules/:rule_id",
            get(handlers::rules::get_rule)
                .put(handlers::rules::update_rule)
                .delete(handlers::rules::delete_rule),
        )
        .route(
            "/applications/:app_id/rules/:rule_id/enabled",
            post(handlers::rules::set_enabled),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    let bearer_routes = Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/validate", get(handlers::auth::validate))
        .route("/oauth/authorize", post(handlers::oauth::authorize))
        .route(
            "/applications/:app_id/rules/evaluate",
            post(handlers::rules::evaluate),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openid-configuration",
            get(handlers::well_known::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks));

    if state.config.swagger.enabled == SwaggerMode::Public {
        app = app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect::<Vec<_>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(ADMIN_API_KEY_HEADER),
        ]);

    app.route("/auth/login", post(handlers::auth::login))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/continue", post(handlers::auth::continue_session))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/oauth/token", post(handlers::oauth::token))
        .merge(admin_routes)
        .merge(bearer_routes)
        .with_state(state)
        .layer(from_fn(middleware::metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");

            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
            )
        }))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "A backing store is unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    service_core::axum::extract::State(state): service_core::axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(database) = &state.database {
        database.health_check().await.map_err(|e| {
            tracing::error!(error = %e, "PostgreSQL health check failed");
            AppError::ServiceUnavailable
        })?;
    }

    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Redis health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
    })))
}
