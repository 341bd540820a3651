//! PostgreSQL implementation of the repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

use super::error::ServiceError;
use super::repository::{
    ApplicationStore, OAuthRepository, RuleRepository, UserDirectory, VerificationRepository,
};
use crate::models::{
    Application, AuthAction, AuthorizationCode, OAuthClient, PluginInstallation, PluginStatus,
    Rule, RuleCondition, Subject, User, VerificationContext, VerificationSession,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        crate::db::health_check(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            ServiceError::Database(e)
        })
    }
}

fn corrupt(what: &str, err: String) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("Corrupt {} row: {}", what, err))
}

#[derive(FromRow)]
struct RuleRow {
    rule_id: Uuid,
    app_id: Uuid,
    rule_name: String,
    description: Option<String>,
    priority: i32,
    effect: String,
    enabled: bool,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

#[derive(FromRow)]
struct ConditionRow {
    condition_id: Uuid,
    rule_id: Uuid,
    position: i32,
    field: String,
    operator: String,
    value: serde_json::Value,
}

impl RuleRow {
    fn into_rule(self, conditions: Vec<RuleCondition>) -> Result<Rule, ServiceError> {
        Ok(Rule {
            rule_id: self.rule_id,
            app_id: self.app_id,
            rule_name: self.rule_name,
            description: self.description,
            priority: self.priority,
            effect: self.effect.parse().map_err(|e| corrupt("rule", e))?,
            enabled: self.enabled,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
            conditions,
        })
    }
}

impl From<ConditionRow> for RuleCondition {
    fn from(row: ConditionRow) -> Self {
        RuleCondition {
            condition_id: row.condition_id,
            rule_id: row.rule_id,
            position: row.position,
            field: row.field,
            operator: row.operator,
            value: row.value,
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    session_id: Uuid,
    app_id: Uuid,
    user_id: Option<Uuid>,
    identifier: Option<String>,
    identifier_kind: Option<String>,
    action: String,
    context: Json<VerificationContext>,
    status: String,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    expiry_utc: DateTime<Utc>,
}

impl TryFrom<SessionRow> for VerificationSession {
    type Error = ServiceError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(VerificationSession {
            session_id: row.session_id,
            app_id: row.app_id,
            subject: Subject::from_columns(row.user_id, row.identifier, row.identifier_kind)
                .map_err(|e| corrupt("verification session", e))?,
            action: row.action.parse().map_err(|e| corrupt("verification session", e))?,
            context: row.context.0,
            status: row.status.parse().map_err(|e| corrupt("verification session", e))?,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            expiry_utc: row.expiry_utc,
        })
    }
}

#[derive(FromRow)]
struct StatusRow {
    status_id: Uuid,
    session_id: Uuid,
    app_id: Uuid,
    user_id: Option<Uuid>,
    identifier: Option<String>,
    identifier_kind: Option<String>,
    action: String,
    plugin_name: String,
    status: String,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<StatusRow> for PluginStatus {
    type Error = ServiceError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(PluginStatus {
            status_id: row.status_id,
            session_id: row.session_id,
            app_id: row.app_id,
            subject: Subject::from_columns(row.user_id, row.identifier, row.identifier_kind)
                .map_err(|e| corrupt("plugin status", e))?,
            action: row.action.parse().map_err(|e| corrupt("plugin status", e))?,
            plugin_name: row.plugin_name,
            state: row.status.parse().map_err(|e| corrupt("plugin status", e))?,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct InstallationRow {
    app_id: Uuid,
    plugin_name: String,
    required: bool,
    stage: String,
    actions: Vec<String>,
    enabled: bool,
}

impl TryFrom<InstallationRow> for PluginInstallation {
    type Error = ServiceError;

    fn try_from(row: InstallationRow) -> Result<Self, Self::Error> {
        let actions = row
            .actions
            .iter()
            .map(|a| a.parse::<AuthAction>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt("plugin installation", e))?;

        Ok(PluginInstallation {
            app_id: row.app_id,
            plugin_name: row.plugin_name,
            required: row.required,
            stage: row.stage.parse().map_err(|e| corrupt("plugin installation", e))?,
            actions,
            enabled: row.enabled,
        })
    }
}

const SESSION_COLUMNS: &str = "session_id, app_id, user_id, identifier, identifier_kind, action, \
     context, status, created_utc, updated_utc, expiry_utc";

// ==================== Applications & Users ====================

#[async_trait]
impl ApplicationStore for Database {
    async fn find_application(&self, app_id: Uuid) -> Result<Option<Application>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE app_id = $1")
                .bind(app_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_login(
        &self,
        app_id: Uuid,
        login: &str,
    ) -> Result<Option<User>, ServiceError> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE app_id = $1 AND (LOWER(email) = LOWER($2) OR username = $2)",
        )
        .bind(app_id)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_user(&self, user: &User) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, app_id, username, email, email_verified, phone,
                               phone_verified, display_name, user_state_code, password_hash, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(user.user_id)
        .bind(user.app_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.email_verified)
        .bind(&user.phone)
        .bind(user.phone_verified)
        .bind(&user.display_name)
        .bind(&user.user_state_code)
        .bind(&user.password_hash)
        .bind(user.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ServiceError::UserAlreadyExists
            }
            _ => ServiceError::Database(e),
        })?;
        Ok(())
    }
}

// ==================== Rules ====================

impl Database {
    async fn insert_conditions(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        conditions: &[RuleCondition],
    ) -> Result<(), ServiceError> {
        for condition in conditions {
            sqlx::query(
                r#"
                INSERT INTO rule_conditions (condition_id, rule_id, position, field, operator, value)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(condition.condition_id)
            .bind(condition.rule_id)
            .bind(condition.position)
            .bind(&condition.field)
            .bind(&condition.operator)
            .bind(&condition.value)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for Database {
    async fn load_rules(&self, app_id: Uuid) -> Result<Vec<Rule>, ServiceError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM rules WHERE app_id = $1 ORDER BY priority DESC, created_utc ASC",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        let condition_rows = sqlx::query_as::<_, ConditionRow>(
            r#"
            SELECT c.* FROM rule_conditions c
            JOIN rules r ON r.rule_id = c.rule_id
            WHERE r.app_id = $1
            ORDER BY c.rule_id, c.position
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_rule: HashMap<Uuid, Vec<RuleCondition>> = HashMap::new();
        for row in condition_rows {
            by_rule.entry(row.rule_id).or_default().push(row.into());
        }

        rows.into_iter()
            .map(|row| {
                let conditions = by_rule.remove(&row.rule_id).unwrap_or_default();
                row.into_rule(conditions)
            })
            .collect()
    }

    async fn find_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<Option<Rule>, ServiceError> {
        let row = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM rules WHERE app_id = $1 AND rule_id = $2",
        )
        .bind(app_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let conditions = sqlx::query_as::<_, ConditionRow>(
            "SELECT * FROM rule_conditions WHERE rule_id = $1 ORDER BY position",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RuleCondition::from)
        .collect();

        row.into_rule(conditions).map(Some)
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rules (rule_id, app_id, rule_name, description, priority, effect,
                               enabled, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(rule.rule_id)
        .bind(rule.app_id)
        .bind(&rule.rule_name)
        .bind(&rule.description)
        .bind(rule.priority)
        .bind(rule.effect.as_str())
        .bind(rule.enabled)
        .bind(rule.created_utc)
        .bind(rule.updated_utc)
        .execute(&mut *tx)
        .await?;

        Self::insert_conditions(&mut tx, &rule.conditions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_rule(&self, rule: &Rule) -> Result<bool, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE rules
            SET rule_name = $3, description = $4, priority = $5, effect = $6,
                enabled = $7, updated_utc = $8
            WHERE app_id = $1 AND rule_id = $2
            "#,
        )
        .bind(rule.app_id)
        .bind(rule.rule_id)
        .bind(&rule.rule_name)
        .bind(&rule.description)
        .bind(rule.priority)
        .bind(rule.effect.as_str())
        .bind(rule.enabled)
        .bind(rule.updated_utc)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM rule_conditions WHERE rule_id = $1")
            .bind(rule.rule_id)
            .execute(&mut *tx)
            .await?;

        Self::insert_conditions(&mut tx, &rule.conditions).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<bool, ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM rule_conditions WHERE rule_id IN \
             (SELECT rule_id FROM rules WHERE app_id = $1 AND rule_id = $2)",
        )
        .bind(app_id)
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM rules WHERE app_id = $1 AND rule_id = $2")
            .bind(app_id)
            .bind(rule_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn set_rule_enabled(
        &self,
        app_id: Uuid,
        rule_id: Uuid,
        enabled: bool,
    ) -> Result<bool, ServiceError> {
        let updated = sqlx::query(
            "UPDATE rules SET enabled = $3, updated_utc = NOW() WHERE app_id = $1 AND rule_id = $2",
        )
        .bind(app_id)
        .bind(rule_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

// ==================== Verification ====================

#[async_trait]
impl VerificationRepository for Database {
    async fn plugin_installations(
        &self,
        app_id: Uuid,
    ) -> Result<Vec<PluginInstallation>, ServiceError> {
        sqlx::query_as::<_, InstallationRow>(
            "SELECT * FROM plugin_installations WHERE app_id = $1 ORDER BY plugin_name",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PluginInstallation::try_from)
        .collect()
    }

    async fn find_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<VerificationSession>, ServiceError> {
        let query = format!(
            "SELECT {} FROM verification_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .map(VerificationSession::try_from)
            .transpose()
    }

    async fn find_sessions_for_subject(
        &self,
        app_id: Uuid,
        subject: &Subject,
    ) -> Result<Vec<VerificationSession>, ServiceError> {
        let (user_id, identifier, identifier_kind) = subject.to_columns();
        let query = format!(
            r#"
            SELECT {} FROM verification_sessions
            WHERE app_id = $1
              AND (($2::uuid IS NOT NULL AND user_id = $2)
                OR ($2::uuid IS NULL AND user_id IS NULL
                    AND identifier = $3 AND identifier_kind = $4))
            "#,
            SESSION_COLUMNS
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(app_id)
            .bind(user_id)
            .bind(identifier)
            .bind(identifier_kind)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(VerificationSession::try_from)
            .collect()
    }

    async fn insert_session(
        &self,
        session: &VerificationSession,
        inherited: &[PluginStatus],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        let (user_id, identifier, identifier_kind) = session.subject.to_columns();

        sqlx::query(
            r#"
            INSERT INTO verification_sessions (session_id, app_id, user_id, identifier,
                identifier_kind, action, context, status, created_utc, updated_utc, expiry_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.session_id)
        .bind(session.app_id)
        .bind(user_id)
        .bind(identifier)
        .bind(identifier_kind)
        .bind(session.action.as_str())
        .bind(Json(&session.context))
        .bind(session.status.as_str())
        .bind(session.created_utc)
        .bind(session.updated_utc)
        .bind(session.expiry_utc)
        .execute(&mut *tx)
        .await?;

        for status in inherited {
            insert_status(&mut tx, status).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_session(&self, session: &VerificationSession) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        let (user_id, identifier, identifier_kind) = session.subject.to_columns();

        sqlx::query(
            r#"
            UPDATE verification_sessions
            SET user_id = $2, identifier = $3, identifier_kind = $4, status = $5, updated_utc = $6
            WHERE session_id = $1
            "#,
        )
        .bind(session.session_id)
        .bind(user_id)
        .bind(&identifier)
        .bind(&identifier_kind)
        .bind(session.status.as_str())
        .bind(session.updated_utc)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE plugin_statuses SET user_id = $2, identifier = $3, identifier_kind = $4 \
             WHERE session_id = $1",
        )
        .bind(session.session_id)
        .bind(user_id)
        .bind(&identifier)
        .bind(&identifier_kind)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_sessions(&self, session_ids: &[Uuid]) -> Result<u64, ServiceError> {
        if session_ids.is_empty() {
            return Ok(0);
        }
        // plugin_statuses rows go with the session (ON DELETE CASCADE)
        let deleted = sqlx::query("DELETE FROM verification_sessions WHERE session_id = ANY($1)")
            .bind(session_ids)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let deleted = sqlx::query("DELETE FROM verification_sessions WHERE expiry_utc <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn statuses_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<PluginStatus>, ServiceError> {
        sqlx::query_as::<_, StatusRow>(
            "SELECT * FROM plugin_statuses WHERE session_id = $1 ORDER BY plugin_name",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PluginStatus::try_from)
        .collect()
    }

    async fn upsert_status(&self, status: &PluginStatus) -> Result<Uuid, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let status_id = insert_status(&mut tx, status).await?;
        tx.commit().await?;
        Ok(status_id)
    }
}

async fn insert_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    status: &PluginStatus,
) -> Result<Uuid, ServiceError> {
    let (user_id, identifier, identifier_kind) = status.subject.to_columns();
    let status_id = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO plugin_statuses (status_id, session_id, app_id, user_id, identifier,
            identifier_kind, action, plugin_name, status, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (session_id, plugin_name)
        DO UPDATE SET status = EXCLUDED.status, updated_utc = EXCLUDED.updated_utc
        RETURNING status_id
        "#,
    )
    .bind(status.status_id)
    .bind(status.session_id)
    .bind(status.app_id)
    .bind(user_id)
    .bind(identifier)
    .bind(identifier_kind)
    .bind(status.action.as_str())
    .bind(&status.plugin_name)
    .bind(status.state.as_str())
    .bind(status.created_utc)
    .bind(status.updated_utc)
    .fetch_one(&mut **tx)
    .await?;
    Ok(status_id)
}

// ==================== OAuth ====================

#[async_trait]
impl OAuthRepository for Database {
    async fn find_client(&self, client_id: &str) -> Result<Option<OAuthClient>, ServiceError> {
        Ok(
            sqlx::query_as::<_, OAuthClient>("SELECT * FROM oauth_clients WHERE client_id = $1")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes (code, client_id, app_id, user_id, redirect_uri,
                scope, nonce, created_utc, expiry_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&code.code)
        .bind(&code.client_id)
        .bind(code.app_id)
        .bind(code.user_id)
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(&code.nonce)
        .bind(code.created_utc)
        .bind(code.expiry_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_code(&self, code: &str) -> Result<Option<AuthorizationCode>, ServiceError> {
        Ok(sqlx::query_as::<_, AuthorizationCode>(
            "DELETE FROM authorization_codes WHERE code = $1 RETURNING *",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }
}
