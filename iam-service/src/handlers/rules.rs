use service_core::{
    axum::{
        extract::{Path, State},
        http::StatusCode,
        Json,
    },
    error::AppError,
};
use uuid::Uuid;

use crate::{
    dtos::rules::{EvaluateRequest, SetEnabledRequest},
    middleware::AuthUser,
    models::{NewRule, Rule},
    services::RuleDecision,
    AppState,
};

/// List an application's rules in evaluation order
#[utoipa::path(
    get,
    path = "/applications/{app_id}/rules",
    params(("app_id" = Uuid, Path, description = "Application ID")),
    responses((status = 200, description = "Rules", body = [Rule])),
    tag = "Rules",
    security(("admin_api_key" = []))
)]
pub async fn list_rules(
    State(state): State<AppState>,
    Path(app_id): Path<Uuid>,
) -> Result<Json<Vec<Rule>>, AppError> {
    Ok(Json(state.rules.list_rules(app_id).await?))
}

/// Create a rule
#[utoipa::path(
    post,
    path = "/applications/{app_id}/rules",
    params(("app_id" = Uuid, Path, description = "Application ID")),
    request_body = NewRule,
    responses(
        (status = 201, description = "Rule created", body = Rule),
        (status = 422, description = "Invalid rule", body = ErrorResponse)
    ),
    tag = "Rules",
    security(("admin_api_key" = []))
)]
pub async fn create_rule(
    State(state): State<AppState>,
    Path(app_id): Path<Uuid>,
    Json(rule): Json<NewRule>,
) -> Result<(StatusCode, Json<Rule>), AppError> {
    let rule = state.rules.create_rule(app_id, rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[utoipa::path(
    get,
    path = "/applications/{app_id}/rules/{rule_id}",
    params(
        ("app_id" = Uuid, Path, description = "Application ID"),
        ("rule_id" = Uuid, Path, description = "Rule ID")
    ),
    responses(
        (status = 200, description = "Rule", body = Rule),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    tag = "Rules",
    security(("admin_api_key" = []))
)]
pub async fn get_rule(
    State(state): State<AppState>,
    Path((app_id, rule_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Rule>, AppError> {
    Ok(Json(state.rules.get_rule(app_id, rule_id).await?))
}

/// Replace a rule and its conditions
#[utoipa::path(
    put,
    path = "/applications/{app_id}/rules/{rule_id}",
    params(
        ("app_id" = Uuid, Path, description = "Application ID"),
        ("rule_id" = Uuid, Path, description = "Rule ID")
    ),
    request_body = NewRule,
    responses(
        (status = 200, description = "Rule updated", body = Rule),
        (status = 404, description = "Rule not found", body = ErrorResponse),
        (status = 422, description = "Invalid rule", body = ErrorResponse)
    ),
    tag = "Rules",
    security(("admin_api_key" = []))
)]
pub async fn update_rule(
    State(state): State<AppState>,
    Path((app_id, rule_id)): Path<(Uuid, Uuid)>,
    Json(rule): Json<NewRule>,
) -> Result<Json<Rule>, AppError> {
    Ok(Json(state.rules.update_rule(app_id, rule_id, rule).await?))
}

#[utoipa::path(
    delete,
    path = "/applications/{app_id}/rules/{rule_id}",
    params(
        ("app_id" = Uuid, Path, description = "Application ID"),
        ("rule_id" = Uuid, Path, description = "Rule ID")
    ),
    responses(
        (status = 204, description = "Rule deleted"),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    tag = "Rules",
    security(("admin_api_key" = []))
)]
pub async fn delete_rule(
    State(state): State<AppState>,
    Path((app_id, rule_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.rules.delete_rule(app_id, rule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Enable or disable a rule
#[utoipa::path(
    post,
    path = "/applications/{app_id}/rules/{rule_id}/enabled",
    params(
        ("app_id" = Uuid, Path, description = "Application ID"),
        ("rule_id" = Uuid, Path, description = "Rule ID")
    ),
    request_body = SetEnabledRequest,
    responses(
        (status = 200, description = "Rule updated", body = Rule),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    tag = "Rules",
    security(("admin_api_key" = []))
)]
pub async fn set_enabled(
    State(state): State<AppState>,
    Path((app_id, rule_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<SetEnabledRequest>,
) -> Result<Json<Rule>, AppError> {
    Ok(Json(state.rules.set_enabled(app_id, rule_id, req.enabled).await?))
}

/// Evaluate the caller's attributes against the application's rules
#[utoipa::path(
    post,
    path = "/applications/{app_id}/rules/evaluate",
    params(("app_id" = Uuid, Path, description = "Application ID")),
    request_body = EvaluateRequest,
    responses(
        (status = 200, description = "Decision", body = RuleDecision),
        (status = 401, description = "Invalid token", body = ErrorResponse),
        (status = 403, description = "Token belongs to another application", body = ErrorResponse)
    ),
    tag = "Rules",
    security(("bearer_auth" = []))
)]
pub async fn evaluate(
    State(state): State<AppState>,
    user: AuthUser,
    Path(app_id): Path<Uuid>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<RuleDecision>, AppError> {
    if user.claims.tenant_id != app_id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Token was not issued for this application"
        )));
    }

    let mut attributes = req.attributes;
    // Identity attributes come from the token, not the caller
    attributes.insert("user_id".to_string(), user.claims.sub.clone().into());
    attributes.insert("username".to_string(), user.claims.username.clone().into());

    Ok(Json(state.rules.evaluate(app_id, &attributes).await?))
}
