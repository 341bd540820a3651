//! Persistence seams consumed by the engine.
//!
//! `Database` implements every trait against PostgreSQL; `MockRepository`
//! implements them in memory for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::{
    Application, AuthorizationCode, OAuthClient, PluginInstallation, PluginStatus, Rule, Subject,
    User, VerificationSession,
};

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn find_application(&self, app_id: Uuid) -> Result<Option<Application>, ServiceError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;

    /// Look up by email (case-insensitive) or username within a tenant.
    async fn find_user_by_login(
        &self,
        app_id: Uuid,
        login: &str,
    ) -> Result<Option<User>, ServiceError>;

    /// Fails with `UserAlreadyExists` when email or username is taken.
    async fn create_user(&self, user: &User) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Every rule of the tenant with its ordered conditions.
    async fn load_rules(&self, app_id: Uuid) -> Result<Vec<Rule>, ServiceError>;
    async fn find_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<Option<Rule>, ServiceError>;
    async fn insert_rule(&self, rule: &Rule) -> Result<(), ServiceError>;
    /// Replace the rule row and all its conditions. False if no such rule.
    async fn replace_rule(&self, rule: &Rule) -> Result<bool, ServiceError>;
    async fn delete_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<bool, ServiceError>;
    async fn set_rule_enabled(
        &self,
        app_id: Uuid,
        rule_id: Uuid,
        enabled: bool,
    ) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait VerificationRepository: Send + Sync {
    async fn plugin_installations(
        &self,
        app_id: Uuid,
    ) -> Result<Vec<PluginInstallation>, ServiceError>;

    async fn find_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<VerificationSession>, ServiceError>;

    async fn find_sessions_for_subject(
        &self,
        app_id: Uuid,
        subject: &Subject,
    ) -> Result<Vec<VerificationSession>, ServiceError>;

    /// Persist a session together with statuses carried over from a prior one.
    async fn insert_session(
        &self,
        session: &VerificationSession,
        inherited: &[PluginStatus],
    ) -> Result<(), ServiceError>;

    /// Write subject, status and timestamps back.
    async fn update_session(&self, session: &VerificationSession) -> Result<(), ServiceError>;

    /// Delete sessions and their statuses. Returns the number of sessions removed.
    async fn delete_sessions(&self, session_ids: &[Uuid]) -> Result<u64, ServiceError>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;

    async fn statuses_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<PluginStatus>, ServiceError>;

    /// Insert or update the status of one plugin within a session. Returns
    /// the id of the stored row, which an update leaves unchanged.
    async fn upsert_status(&self, status: &PluginStatus) -> Result<Uuid, ServiceError>;
}

#[async_trait]
pub trait OAuthRepository: Send + Sync {
    async fn find_client(&self, client_id: &str) -> Result<Option<OAuthClient>, ServiceError>;
    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), ServiceError>;
    /// Atomically remove and return a code so it can be redeemed only once.
    async fn consume_code(&self, code: &str) -> Result<Option<AuthorizationCode>, ServiceError>;
}

#[derive(Default)]
struct MockState {
    applications: HashMap<Uuid, Application>,
    users: HashMap<Uuid, User>,
    rules: HashMap<Uuid, Rule>,
    installations: Vec<PluginInstallation>,
    sessions: HashMap<Uuid, VerificationSession>,
    statuses: HashMap<Uuid, PluginStatus>,
    clients: HashMap<String, OAuthClient>,
    codes: HashMap<String, AuthorizationCode>,
}

/// In-memory repository for tests.
#[derive(Default)]
pub struct MockRepository {
    state: Mutex<MockState>,
    rule_loads: AtomicUsize,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, ServiceError> {
        self.state
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Mock repository mutex poisoned: {}", e)))
    }

    fn seed(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_application(&self, app: Application) {
        self.seed().applications.insert(app.app_id, app);
    }

    pub fn add_user(&self, user: User) {
        self.seed().users.insert(user.user_id, user);
    }

    pub fn add_client(&self, client: OAuthClient) {
        self.seed().clients.insert(client.client_id.clone(), client);
    }

    pub fn add_installation(&self, installation: PluginInstallation) {
        self.seed().installations.push(installation);
    }

    /// Number of times rules were loaded from the repository.
    pub fn rule_loads(&self) -> usize {
        self.rule_loads.load(Ordering::SeqCst)
    }

    pub fn code_count(&self) -> usize {
        self.seed().codes.len()
    }

    pub fn session_count(&self) -> usize {
        self.seed().sessions.len()
    }

    pub fn status_count(&self) -> usize {
        self.seed().statuses.len()
    }

    /// Overwrite a stored session, e.g. to age it in tests.
    pub fn put_session(&self, session: VerificationSession) {
        self.seed().sessions.insert(session.session_id, session);
    }

    pub fn put_status(&self, status: PluginStatus) {
        self.seed().statuses.insert(status.status_id, status);
    }
}

#[async_trait]
impl ApplicationStore for MockRepository {
    async fn find_application(&self, app_id: Uuid) -> Result<Option<Application>, ServiceError> {
        Ok(self.state()?.applications.get(&app_id).cloned())
    }
}

#[async_trait]
impl UserDirectory for MockRepository {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.state()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_login(
        &self,
        app_id: Uuid,
        login: &str,
    ) -> Result<Option<User>, ServiceError> {
        Ok(self
            .state()?
            .users
            .values()
            .find(|u| {
                u.app_id == app_id && (u.email.eq_ignore_ascii_case(login) || u.username == login)
            })
            .cloned())
    }

    async fn create_user(&self, user: &User) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        let taken = state.users.values().any(|u| {
            u.app_id == user.app_id
                && (u.email.eq_ignore_ascii_case(&user.email) || u.username == user.username)
        });
        if taken {
            return Err(ServiceError::UserAlreadyExists);
        }
        state.users.insert(user.user_id, user.clone());
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for MockRepository {
    async fn load_rules(&self, app_id: Uuid) -> Result<Vec<Rule>, ServiceError> {
        self.rule_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state()?
            .rules
            .values()
            .filter(|r| r.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn find_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<Option<Rule>, ServiceError> {
        Ok(self
            .state()?
            .rules
            .get(&rule_id)
            .filter(|r| r.app_id == app_id)
            .cloned())
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), ServiceError> {
        self.state()?.rules.insert(rule.rule_id, rule.clone());
        Ok(())
    }

    async fn replace_rule(&self, rule: &Rule) -> Result<bool, ServiceError> {
        let mut state = self.state()?;
        match state.rules.get_mut(&rule.rule_id) {
            Some(existing) if existing.app_id == rule.app_id => {
                *existing = rule.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<bool, ServiceError> {
        let mut state = self.state()?;
        if state.rules.get(&rule_id).is_some_and(|r| r.app_id == app_id) {
            state.rules.remove(&rule_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_rule_enabled(
        &self,
        app_id: Uuid,
        rule_id: Uuid,
        enabled: bool,
    ) -> Result<bool, ServiceError> {
        let mut state = self.state()?;
        match state.rules.get_mut(&rule_id) {
            Some(rule) if rule.app_id == app_id => {
                rule.enabled = enabled;
                rule.updated_utc = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl VerificationRepository for MockRepository {
    async fn plugin_installations(
        &self,
        app_id: Uuid,
    ) -> Result<Vec<PluginInstallation>, ServiceError> {
        Ok(self
            .state()?
            .installations
            .iter()
            .filter(|i| i.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn find_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<VerificationSession>, ServiceError> {
        Ok(self.state()?.sessions.get(&session_id).cloned())
    }

    async fn find_sessions_for_subject(
        &self,
        app_id: Uuid,
        subject: &Subject,
    ) -> Result<Vec<VerificationSession>, ServiceError> {
        Ok(self
            .state()?
            .sessions
            .values()
            .filter(|s| s.app_id == app_id && &s.subject == subject)
            .cloned()
            .collect())
    }

    async fn insert_session(
        &self,
        session: &VerificationSession,
        inherited: &[PluginStatus],
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        state.sessions.insert(session.session_id, session.clone());
        for status in inherited {
            state.statuses.insert(status.status_id, status.clone());
        }
        Ok(())
    }

    async fn update_session(&self, session: &VerificationSession) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if let Some(existing) = state.sessions.get_mut(&session.session_id) {
            *existing = session.clone();
        }
        for status in state.statuses.values_mut() {
            if status.session_id == session.session_id {
                status.subject = session.subject.clone();
            }
        }
        Ok(())
    }

    async fn delete_sessions(&self, session_ids: &[Uuid]) -> Result<u64, ServiceError> {
        let mut state = self.state()?;
        let mut removed = 0;
        for id in session_ids {
            if state.sessions.remove(id).is_some() {
                removed += 1;
            }
        }
        state
            .statuses
            .retain(|_, status| !session_ids.contains(&status.session_id));
        Ok(removed)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let expired: Vec<Uuid> = self
            .state()?
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.session_id)
            .collect();
        self.delete_sessions(&expired).await
    }

    async fn statuses_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<PluginStatus>, ServiceError> {
        Ok(self
            .state()?
            .statuses
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn upsert_status(&self, status: &PluginStatus) -> Result<Uuid, ServiceError> {
        let mut state = self.state()?;
        let existing = state
            .statuses
            .values_mut()
            .find(|s| s.session_id == status.session_id && s.plugin_name == status.plugin_name);
        match existing {
            Some(current) => {
                current.state = status.state;
                current.updated_utc = status.updated_utc;
                Ok(current.status_id)
            }
            None => {
                state.statuses.insert(status.status_id, status.clone());
                Ok(status.status_id)
            }
        }
    }
}

#[async_trait]
impl OAuthRepository for MockRepository {
    async fn find_client(&self, client_id: &str) -> Result<Option<OAuthClient>, ServiceError> {
        Ok(self.state()?.clients.get(client_id).cloned())
    }

    async fn insert_code(&self, code: &AuthorizationCode) -> Result<(), ServiceError> {
        self.state()?.codes.insert(code.code.clone(), code.clone());
        Ok(())
    }

    async fn consume_code(&self, code: &str) -> Result<Option<AuthorizationCode>, ServiceError> {
        Ok(self.state()?.codes.remove(code))
    }
}
