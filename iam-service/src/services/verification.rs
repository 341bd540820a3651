//! Verification orchestrator.
//!
//! Drives one session per (tenant, subject) through the plugins installed for
//! the tenant. A session moves `pending -> completed`, or is treated as
//! expired once its TTL passes; there are no backward transitions. Plugin
//! outcomes accumulate as `PluginStatus` rows and a stored completion is
//! re-checked through the plugin before it counts.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::ServiceError;
use super::plugins::PluginRegistry;
use super::repository::VerificationRepository;
use crate::config::VerificationConfig;
use crate::models::{
    AuthAction, PluginInstallation, PluginRequirement, PluginState, PluginStatus, SessionStatus,
    Subject, VerificationContext, VerificationSession,
};

/// Where a session stands.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VerificationStatus {
    pub session_id: Uuid,
    pub completed: bool,
    pub next_plugin: Option<String>,
    pub status: SessionStatus,
    /// Steps evaluated so far. Optional plugins only appear once every
    /// required plugin has passed.
    pub plugins: Vec<PluginRequirement>,
}

#[derive(Clone)]
pub struct VerificationService {
    repo: Arc<dyn VerificationRepository>,
    registry: Arc<PluginRegistry>,
    session_ttl: Duration,
    reuse_window: Duration,
}

impl VerificationService {
    pub fn new(
        repo: Arc<dyn VerificationRepository>,
        registry: Arc<PluginRegistry>,
        config: &VerificationConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            session_ttl: Duration::minutes(config.session_ttl_minutes),
            reuse_window: Duration::minutes(config.status_reuse_minutes),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Installations that apply to `action` and have a registered plugin.
    async fn applicable(
        &self,
        app_id: Uuid,
        action: AuthAction,
    ) -> Result<Vec<PluginInstallation>, ServiceError> {
        let installations = self.repo.plugin_installations(app_id).await?;
        Ok(installations
            .into_iter()
            .filter(|i| i.applies_to(action))
            .filter(|i| {
                let registered = self.registry.get(&i.plugin_name).is_some();
                if !registered {
                    tracing::warn!(
                        app_id = %app_id,
                        plugin = %i.plugin_name,
                        "Installed plugin is not registered, skipping"
                    );
                }
                registered
            })
            .collect())
    }

    /// Whether any plugin could gate `action` for this tenant.
    pub async fn is_gated(&self, app_id: Uuid, action: AuthAction) -> Result<bool, ServiceError> {
        Ok(!self.applicable(app_id, action).await?.is_empty())
    }

    /// Start a fresh attempt, replacing any session the subject already has.
    /// Completions younger than the reuse window for the same action carry over.
    #[tracing::instrument(skip(self, context))]
    pub async fn create_session(
        &self,
        app_id: Uuid,
        subject: Subject,
        action: AuthAction,
        context: VerificationContext,
    ) -> Result<VerificationSession, ServiceError> {
        let now = Utc::now();
        let session = VerificationSession::new(app_id, subject.clone(), action, context, self.session_ttl);

        let prior = self.repo.find_sessions_for_subject(app_id, &subject).await?;
        let mut inherited: HashMap<String, PluginStatus> = HashMap::new();
        for old in prior.iter().filter(|s| s.action == action) {
            for status in self.repo.statuses_for_session(old.session_id).await? {
                if !status.is_reusable_at(now, self.reuse_window) {
                    continue;
                }
                let newer = inherited
                    .get(&status.plugin_name)
                    .map_or(true, |kept| kept.updated_utc < status.updated_utc);
                if newer {
                    inherited.insert(
                        status.plugin_name.clone(),
                        // status_id is kept so the plugin still recognises its completion
                        PluginStatus {
                            session_id: session.session_id,
                            subject: subject.clone(),
                            ..status
                        },
                    );
                }
            }
        }

        if !prior.is_empty() {
            let ids: Vec<Uuid> = prior.iter().map(|s| s.session_id).collect();
            self.repo.delete_sessions(&ids).await?;
            tracing::debug!(replaced = ids.len(), "Replaced existing verification session");
        }

        let inherited: Vec<PluginStatus> = inherited.into_values().collect();
        self.repo.insert_session(&session, &inherited).await?;

        tracing::info!(
            session_id = %session.session_id,
            inherited = inherited.len(),
            "Verification session created"
        );
        Ok(session)
    }

    /// The subject's live session, if any. Expired sessions found on the way
    /// are removed.
    pub async fn get_active_session(
        &self,
        app_id: Uuid,
        subject: &Subject,
    ) -> Result<Option<VerificationSession>, ServiceError> {
        let now = Utc::now();
        let (expired, live): (Vec<_>, Vec<_>) = self
            .repo
            .find_sessions_for_subject(app_id, subject)
            .await?
            .into_iter()
            .partition(|s| s.is_expired_at(now));

        if !expired.is_empty() {
            let ids: Vec<Uuid> = expired.iter().map(|s| s.session_id).collect();
            self.repo.delete_sessions(&ids).await?;
        }

        Ok(live.into_iter().max_by_key(|s| s.created_utc))
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<VerificationSession, ServiceError> {
        let session = self
            .repo
            .find_session(session_id)
            .await?
            .ok_or(ServiceError::SessionNotFound)?;

        if session.is_expired() {
            self.repo.delete_sessions(&[session_id]).await?;
            return Err(ServiceError::SessionExpired);
        }

        Ok(session)
    }

    /// Whether a stored status still counts as completed.
    async fn is_live_completion(
        &self,
        plugin_name: &str,
        subject: &Subject,
        action: AuthAction,
        status: Option<&PluginStatus>,
    ) -> Result<bool, ServiceError> {
        let Some(status) = status.filter(|s| s.is_completed()) else {
            return Ok(false);
        };
        let Some(verifiable) = self.registry.get(plugin_name).and_then(|p| p.verifiable()) else {
            return Ok(true);
        };

        let valid = verifiable
            .validate_verification(subject, action, status.status_id)
            .await?;
        if !valid {
            tracing::info!(plugin = %plugin_name, "Stored completion no longer valid");
        }
        Ok(valid)
    }

    /// Whether an optional plugin applies. Without the `Verifiable`
    /// capability there is no predicate to ask, so it never gates.
    async fn optional_needed(
        &self,
        plugin_name: &str,
        subject: &Subject,
        action: AuthAction,
        context: &VerificationContext,
    ) -> Result<bool, ServiceError> {
        match self.registry.get(plugin_name).and_then(|p| p.verifiable()) {
            Some(verifiable) => verifiable.needs_verification(subject, action, context).await,
            None => Ok(false),
        }
    }

    /// Requirements for an attempt with their live state, required first.
    /// Optional plugins are only consulted when `with_optional` is set.
    async fn evaluate(
        &self,
        app_id: Uuid,
        action: AuthAction,
        context: &VerificationContext,
        subject: &Subject,
        statuses: &[PluginStatus],
        with_optional: bool,
    ) -> Result<Vec<(PluginRequirement, bool)>, ServiceError> {
        let mut installations = self.applicable(app_id, action).await?;
        installations.sort_by(|a, b| {
            b.required
                .cmp(&a.required)
                .then(a.stage.cmp(&b.stage))
                .then_with(|| a.plugin_name.cmp(&b.plugin_name))
        });

        let mut evaluated = Vec::with_capacity(installations.len());
        for install in installations {
            if !install.required && !with_optional {
                continue;
            }

            let stored = statuses.iter().find(|s| s.plugin_name == install.plugin_name);
            let completed = self
                .is_live_completion(&install.plugin_name, subject, action, stored)
                .await?;

            if !install.required
                && !completed
                && !self
                    .optional_needed(&install.plugin_name, subject, action, context)
                    .await?
            {
                continue;
            }

            let status = match (completed, stored) {
                (true, _) => Some(PluginState::Completed),
                // A completion that failed live re-validation has to be redone
                (false, Some(s)) if s.is_completed() => Some(PluginState::Pending),
                (false, stored) => stored.map(|s| s.state),
            };

            evaluated.push((
                PluginRequirement {
                    plugin_name: install.plugin_name,
                    required: install.required,
                    stage: install.stage,
                    status,
                },
                completed,
            ));
        }

        Ok(evaluated)
    }

    /// Plugins the subject still has to complete for `action`, ordered by
    /// stage, then required before optional, then name.
    pub async fn required_plugins(
        &self,
        app_id: Uuid,
        action: AuthAction,
        context: &VerificationContext,
        subject: &Subject,
    ) -> Result<Vec<PluginRequirement>, ServiceError> {
        let statuses = match self.get_active_session(app_id, subject).await? {
            Some(session) if session.action == action => {
                self.repo.statuses_for_session(session.session_id).await?
            }
            _ => Vec::new(),
        };

        let mut pending: Vec<PluginRequirement> = self
            .evaluate(app_id, action, context, subject, &statuses, true)
            .await?
            .into_iter()
            .filter(|(_, completed)| !completed)
            .map(|(requirement, _)| requirement)
            .collect();

        // `evaluate` lists required first to pick `next_plugin`; callers get stage order
        pending.sort_by(|a, b| {
            a.stage
                .cmp(&b.stage)
                .then(b.required.cmp(&a.required))
                .then_with(|| a.plugin_name.cmp(&b.plugin_name))
        });
        Ok(pending)
    }

    async fn status_of(
        &self,
        session: &VerificationSession,
    ) -> Result<VerificationStatus, ServiceError> {
        let statuses = self.repo.statuses_for_session(session.session_id).await?;

        let required = self
            .evaluate(
                session.app_id,
                session.action,
                &session.context,
                &session.subject,
                &statuses,
                false,
            )
            .await?;

        let next_required = required
            .iter()
            .find(|(_, completed)| !completed)
            .map(|(r, _)| r.plugin_name.clone());

        let (plugins, next_plugin) = match next_required {
            Some(next) => (required, Some(next)),
            None => {
                let all = self
                    .evaluate(
                        session.app_id,
                        session.action,
                        &session.context,
                        &session.subject,
                        &statuses,
                        true,
                    )
                    .await?;
                let next = all
                    .iter()
                    .find(|(_, completed)| !completed)
                    .map(|(r, _)| r.plugin_name.clone());
                (all, next)
            }
        };

        let completed = next_plugin.is_none();
        Ok(VerificationStatus {
            session_id: session.session_id,
            completed,
            next_plugin,
            status: if completed {
                SessionStatus::Completed
            } else {
                session.status
            },
            plugins: plugins.into_iter().map(|(r, _)| r).collect(),
        })
    }

    pub async fn status(&self, session_id: Uuid) -> Result<VerificationStatus, ServiceError> {
        let session = self.get_session(session_id).await?;
        self.status_of(&session).await
    }

    /// Record a plugin outcome. On completion the plugin's success hook runs
    /// and the session is marked completed once nothing else is outstanding.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        session_id: Uuid,
        plugin_name: &str,
        state: PluginState,
    ) -> Result<VerificationStatus, ServiceError> {
        let mut session = self.get_session(session_id).await?;

        let installed = self
            .applicable(session.app_id, session.action)
            .await?
            .into_iter()
            .any(|i| i.plugin_name == plugin_name);
        let plugin = self
            .registry
            .get(plugin_name)
            .filter(|_| installed)
            .ok_or_else(|| ServiceError::PluginNotFound(plugin_name.to_string()))?;

        let status = PluginStatus::new(&session, plugin_name, state);
        let status_id = self.repo.upsert_status(&status).await?;

        if state == PluginState::Completed {
            if let Some(verifiable) = plugin.verifiable() {
                verifiable
                    .on_verification_success(
                        &session.subject,
                        session.action,
                        &session.context,
                        status_id,
                    )
                    .await?;
            }
        }

        let report = self.status_of(&session).await?;
        session.updated_utc = Utc::now();
        if report.completed {
            session.status = SessionStatus::Completed;
        }
        self.repo.update_session(&session).await?;

        tracing::info!(
            plugin = %plugin_name,
            state = state.as_str(),
            completed = report.completed,
            "Plugin status recorded"
        );
        Ok(report)
    }

    /// Drop every session of the subject for `action` with its statuses.
    /// Safe to call repeatedly.
    pub async fn clear_verification(
        &self,
        app_id: Uuid,
        subject: &Subject,
        action: AuthAction,
    ) -> Result<(), ServiceError> {
        let ids: Vec<Uuid> = self
            .repo
            .find_sessions_for_subject(app_id, subject)
            .await?
            .into_iter()
            .filter(|s| s.action == action)
            .map(|s| s.session_id)
            .collect();

        if !ids.is_empty() {
            self.repo.delete_sessions(&ids).await?;
            tracing::debug!(cleared = ids.len(), "Verification state cleared");
        }
        Ok(())
    }

    /// Remove sessions past their expiry. Returns how many were deleted.
    pub async fn purge_expired(&self) -> Result<u64, ServiceError> {
        let purged = self.repo.delete_expired_sessions(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "Expired verification sessions purged");
        }
        Ok(purged)
    }
}
