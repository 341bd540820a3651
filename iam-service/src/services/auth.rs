//! First-party authentication flows.
//!
//! Login and registration check credentials, hand the attempt to the
//! verification orchestrator when the tenant gates the action, and mint
//! tokens once every step is satisfied. A pending verification is a normal
//! outcome, not an error.

use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use super::jwt::{TokenClaims, TokenType};
use super::metrics;
use super::redis::{keys, SharedStore};
use super::repository::{ApplicationStore, UserDirectory};
use super::token::{TokenPair, TokenService};
use super::verification::{VerificationService, VerificationStatus};
use crate::dtos::auth::{LoginRequest, RegisterRequest};
use crate::models::{
    Application, AuthAction, NewUser, PluginRequirement, Subject, User, UserSnapshot,
    VerificationContext, VerificationSession,
};
use crate::utils::{hash_password, verify_password, Password, PasswordHashString};

#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub session_id: Uuid,
    pub next_plugin: Option<String>,
    pub plugins: Vec<PluginRequirement>,
    /// Known for logins; registrations have no account yet.
    pub user: Option<UserSnapshot>,
}

#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated { tokens: TokenPair, user: UserSnapshot },
    VerificationRequired(PendingVerification),
}

impl AuthOutcome {
    fn label(&self) -> &'static str {
        match self {
            AuthOutcome::Authenticated { .. } => "authenticated",
            AuthOutcome::VerificationRequired(_) => "verification_required",
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    apps: Arc<dyn ApplicationStore>,
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn SharedStore>,
    tokens: TokenService,
    verification: VerificationService,
}

impl AuthService {
    pub fn new(
        apps: Arc<dyn ApplicationStore>,
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn SharedStore>,
        tokens: TokenService,
        verification: VerificationService,
    ) -> Self {
        Self {
            apps,
            users,
            store,
            tokens,
            verification,
        }
    }

    async fn active_application(&self, app_id: Uuid) -> Result<Application, ServiceError> {
        let app = self
            .apps
            .find_application(app_id)
            .await?
            .ok_or(ServiceError::ApplicationNotFound)?;
        if !app.is_active() {
            return Err(ServiceError::ApplicationDisabled);
        }
        Ok(app)
    }

    async fn authenticated(&self, user: &User) -> Result<AuthOutcome, ServiceError> {
        let tokens = self
            .tokens
            .issue_pair(user.user_id, user.app_id, &user.username, "")
            .await?;
        Ok(AuthOutcome::Authenticated {
            tokens,
            user: user.snapshot(),
        })
    }

    fn pending(status: VerificationStatus, user: Option<UserSnapshot>) -> AuthOutcome {
        AuthOutcome::VerificationRequired(PendingVerification {
            session_id: status.session_id,
            next_plugin: status.next_plugin,
            plugins: status.plugins,
            user,
        })
    }

    fn record<T>(flow: &str, result: &Result<T, ServiceError>, outcome: impl Fn(&T) -> &'static str) {
        let label = match result {
            Ok(value) => outcome(value),
            Err(_) => "failed",
        };
        metrics::record_auth_outcome(flow, label);
    }

    #[tracing::instrument(skip(self, request, context), fields(app_id = %request.app_id))]
    pub async fn login(
        &self,
        request: LoginRequest,
        context: VerificationContext,
    ) -> Result<AuthOutcome, ServiceError> {
        let result = self.login_inner(request, context).await;
        Self::record("login", &result, AuthOutcome::label);
        result
    }

    async fn login_inner(
        &self,
        request: LoginRequest,
        context: VerificationContext,
    ) -> Result<AuthOutcome, ServiceError> {
        let app = self.active_application(request.app_id).await?;

        let user = self
            .users
            .find_user_by_login(app.app_id, &request.login)
            .await?
            .ok_or(ServiceError::InvalidCredentials)?;

        let matches = verify_password(
            &Password::new(request.password),
            &PasswordHashString::new(user.password_hash.clone()),
        )?;
        if !matches {
            tracing::info!(user_id = %user.user_id, "Password mismatch");
            return Err(ServiceError::InvalidCredentials);
        }

        if !user.is_active() {
            return Err(ServiceError::UserDisabled);
        }

        if !self.verification.is_gated(app.app_id, AuthAction::Login).await? {
            return self.authenticated(&user).await;
        }

        let subject = Subject::User(user.user_id);
        let session = self
            .verification
            .create_session(app.app_id, subject.clone(), AuthAction::Login, context)
            .await?;
        let status = self.verification.status(session.session_id).await?;

        if status.completed {
            // Everything carried over from a recent attempt
            self.verification
                .clear_verification(app.app_id, &subject, AuthAction::Login)
                .await?;
            return self.authenticated(&user).await;
        }

        tracing::info!(
            user_id = %user.user_id,
            session_id = %session.session_id,
            next_plugin = ?status.next_plugin,
            "Login awaiting verification"
        );
        Ok(Self::pending(status, Some(user.snapshot())))
    }

    #[tracing::instrument(skip(self, request, context), fields(app_id = %request.app_id))]
    pub async fn register(
        &self,
        request: RegisterRequest,
        context: VerificationContext,
    ) -> Result<AuthOutcome, ServiceError> {
        let result = self.register_inner(request, context).await;
        Self::record("register", &result, AuthOutcome::label);
        result
    }

    async fn register_inner(
        &self,
        request: RegisterRequest,
        context: VerificationContext,
    ) -> Result<AuthOutcome, ServiceError> {
        let app = self.active_application(request.app_id).await?;

        let email = request.email.trim().to_lowercase();
        for login in [email.as_str(), request.username.as_str()] {
            if self.users.find_user_by_login(app.app_id, login).await?.is_some() {
                return Err(ServiceError::UserAlreadyExists);
            }
        }

        let password_hash = hash_password(&Password::new(request.password))?;
        let new_user = NewUser {
            app_id: app.app_id,
            username: request.username,
            email: email.clone(),
            phone: request.phone,
            display_name: request.display_name,
            password_hash: password_hash.into_string(),
        };

        if !self.verification.is_gated(app.app_id, AuthAction::Register).await? {
            let user = self.create_user(new_user).await?;
            return self.authenticated(&user).await;
        }

        let session = self
            .verification
            .create_session(app.app_id, Subject::email(email), AuthAction::Register, context)
            .await?;

        let payload = serde_json::to_string(&new_user).map_err(anyhow::Error::from)?;
        self.store
            .set_ex(
                &keys::pending_registration(session.session_id),
                &payload,
                self.verification.session_ttl().num_seconds().max(1) as u64,
            )
            .await?;

        let status = self.verification.status(session.session_id).await?;
        if status.completed {
            return self.finish_registration(&session).await;
        }

        tracing::info!(session_id = %session.session_id, "Registration awaiting verification");
        Ok(Self::pending(status, None))
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, ServiceError> {
        let user = new_user.into_user();
        self.users.create_user(&user).await?;
        tracing::info!(user_id = %user.user_id, app_id = %user.app_id, "User registered");
        Ok(user)
    }

    /// Create the account held for a completed registration session and drop
    /// the session with its statuses.
    async fn finish_registration(
        &self,
        session: &VerificationSession,
    ) -> Result<AuthOutcome, ServiceError> {
        let key = keys::pending_registration(session.session_id);
        let payload = self
            .store
            .get(&key)
            .await?
            .ok_or(ServiceError::SessionNotFound)?;
        let new_user: NewUser = serde_json::from_str(&payload).map_err(anyhow::Error::from)?;

        let user = self.create_user(new_user).await?;
        self.store.delete(&key).await?;
        self.verification
            .clear_verification(session.app_id, &session.subject, AuthAction::Register)
            .await?;

        self.authenticated(&user).await
    }

    /// Resume an attempt after plugin steps were recorded against it.
    #[tracing::instrument(skip(self))]
    pub async fn continue_session(&self, session_id: Uuid) -> Result<AuthOutcome, ServiceError> {
        let result = self.continue_inner(session_id).await;
        Self::record("continue", &result, AuthOutcome::label);
        result
    }

    async fn continue_inner(&self, session_id: Uuid) -> Result<AuthOutcome, ServiceError> {
        let session = self.verification.get_session(session_id).await?;
        self.active_application(session.app_id).await?;

        let user = match session.subject.user_id() {
            Some(user_id) => Some(
                self.users
                    .find_user_by_id(user_id)
                    .await?
                    .ok_or(ServiceError::InvalidCredentials)?,
            ),
            None => None,
        };

        let status = self.verification.status(session_id).await?;
        if !status.completed {
            return Ok(Self::pending(status, user.as_ref().map(User::snapshot)));
        }

        match (session.action, user) {
            (AuthAction::Login, Some(user)) => {
                if !user.is_active() {
                    return Err(ServiceError::UserDisabled);
                }
                self.verification
                    .clear_verification(session.app_id, &session.subject, AuthAction::Login)
                    .await?;
                self.authenticated(&user).await
            }
            (AuthAction::Register, None) => self.finish_registration(&session).await,
            (AuthAction::Register, Some(_)) | (AuthAction::Login, None) => {
                Err(ServiceError::InvalidCredentials)
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ServiceError> {
        let result = self.tokens.refresh(refresh_token).await;
        Self::record("refresh", &result, |_| "refreshed");
        result
    }

    pub async fn validate(&self, access_token: &str) -> Result<TokenClaims, ServiceError> {
        self.tokens.validate(access_token, TokenType::Access).await
    }

    /// Revoke the caller's access token and, when given, their refresh token.
    #[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
    pub async fn logout(
        &self,
        claims: &TokenClaims,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), ServiceError> {
        if let Some(refresh_token) = refresh_token {
            let refresh_claims = self.tokens.jwt().decode(refresh_token)?;
            if refresh_claims.sub != claims.sub || refresh_claims.tenant_id != claims.tenant_id {
                return Err(ServiceError::InvalidToken);
            }
            self.tokens.revoke(refresh_token, TokenType::Refresh).await?;
        }

        self.tokens.revoke(access_token, TokenType::Access).await?;
        metrics::record_auth_outcome("logout", "logged_out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerificationConfig;
    use crate::models::{ExecutionStage, PluginInstallation, PluginState};
    use crate::services::plugins::PluginRegistry;
    use crate::services::redis::MockStore;
    use crate::services::repository::MockRepository;
    use crate::testing::{jwt_service, test_user, TestPlugin};

    struct Fixture {
        service: AuthService,
        verification: VerificationService,
        repo: Arc<MockRepository>,
        store: Arc<MockStore>,
        app: Application,
        user: User,
    }

    fn fixture(gated: &[(&str, AuthAction)]) -> Fixture {
        let repo = Arc::new(MockRepository::new());
        let store = Arc::new(MockStore::new());
        let app = Application::new("acme");
        repo.add_application(app.clone());
        let user = test_user(app.app_id, "alice", "alice@example.com", "password123");
        repo.add_user(user.clone());

        let mut registry = PluginRegistry::new();
        for (name, action) in gated {
            registry.register(Arc::new(TestPlugin::new(name)));
            repo.add_installation(PluginInstallation {
                app_id: app.app_id,
                plugin_name: name.to_string(),
                required: true,
                stage: ExecutionStage::PostAuthentication,
                actions: vec![*action],
                enabled: true,
            });
        }

        let verification = VerificationService::new(
            repo.clone(),
            Arc::new(registry),
            &VerificationConfig {
                session_ttl_minutes: 30,
                status_reuse_minutes: 30,
                sweep_interval_seconds: 300,
            },
        );
        let tokens = TokenService::new(jwt_service(), store.clone());
        let service = AuthService::new(
            repo.clone(),
            repo.clone(),
            store.clone(),
            tokens,
            verification.clone(),
        );

        Fixture {
            service,
            verification,
            repo,
            store,
            app,
            user,
        }
    }

    fn login(app_id: Uuid, login: &str, password: &str) -> LoginRequest {
        LoginRequest {
            app_id,
            login: login.to_string(),
            password: password.to_string(),
            device_id: None,
        }
    }

    fn register(app_id: Uuid, username: &str, email: &str) -> RegisterRequest {
        RegisterRequest {
            app_id,
            username: username.to_string(),
            email: email.to_string(),
            password: "password123".to_string(),
            phone: None,
            display_name: None,
            device_id: None,
        }
    }

    #[tokio::test]
    async fn ungated_login_authenticates() {
        let f = fixture(&[]);
        let outcome = f
            .service
            .login(login(f.app.app_id, "Alice@Example.com", "password123"), Default::default())
            .await
            .unwrap();

        let AuthOutcome::Authenticated { tokens, user } = outcome else {
            panic!("expected tokens");
        };
        assert_eq!(user.user_id, f.user.user_id);
        let claims = f.service.validate(&tokens.access_token).await.unwrap();
        assert_eq!(claims.tenant_id, f.app.app_id);
    }

    #[tokio::test]
    async fn login_by_username_works() {
        let f = fixture(&[]);
        let outcome = f
            .service
            .login(login(f.app.app_id, "alice", "password123"), Default::default())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated { .. }));
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let f = fixture(&[]);
        let wrong_password = f
            .service
            .login(login(f.app.app_id, "alice", "nope"), Default::default())
            .await;
        assert!(matches!(wrong_password, Err(ServiceError::InvalidCredentials)));

        let unknown = f
            .service
            .login(login(f.app.app_id, "bob", "password123"), Default::default())
            .await;
        assert!(matches!(unknown, Err(ServiceError::InvalidCredentials)));

        let other_tenant = f
            .service
            .login(login(Uuid::new_v4(), "alice", "password123"), Default::default())
            .await;
        assert!(matches!(other_tenant, Err(ServiceError::ApplicationNotFound)));
    }

    #[tokio::test]
    async fn gated_login_completes_through_continue() {
        let f = fixture(&[("email_code", AuthAction::Login)]);

        let outcome = f
            .service
            .login(login(f.app.app_id, "alice", "password123"), Default::default())
            .await
            .unwrap();
        let AuthOutcome::VerificationRequired(pending) = outcome else {
            panic!("expected verification");
        };
        assert_eq!(pending.next_plugin.as_deref(), Some("email_code"));
        assert_eq!(pending.user.map(|u| u.user_id), Some(f.user.user_id));

        // Not done yet
        let early = f.service.continue_session(pending.session_id).await.unwrap();
        assert!(matches!(early, AuthOutcome::VerificationRequired(_)));

        f.verification
            .update_status(pending.session_id, "email_code", PluginState::Completed)
            .await
            .unwrap();

        let done = f.service.continue_session(pending.session_id).await.unwrap();
        assert!(matches!(done, AuthOutcome::Authenticated { .. }));
        assert_eq!(f.repo.session_count(), 0);
    }

    #[tokio::test]
    async fn gate_for_other_action_does_not_apply() {
        let f = fixture(&[("email_code", AuthAction::Register)]);
        let outcome = f
            .service
            .login(login(f.app.app_id, "alice", "password123"), Default::default())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated { .. }));
    }

    #[tokio::test]
    async fn ungated_registration_creates_user() {
        let f = fixture(&[]);
        let outcome = f
            .service
            .register(register(f.app.app_id, "bob", "Bob@Example.com"), Default::default())
            .await
            .unwrap();

        let AuthOutcome::Authenticated { user, .. } = outcome else {
            panic!("expected tokens");
        };
        assert_eq!(user.email, "bob@example.com");

        let duplicate = f
            .service
            .register(register(f.app.app_id, "bobby", "bob@example.com"), Default::default())
            .await;
        assert!(matches!(duplicate, Err(ServiceError::UserAlreadyExists)));
    }

    #[tokio::test]
    async fn gated_registration_creates_user_after_verification() {
        let f = fixture(&[("email_code", AuthAction::Register)]);

        let outcome = f
            .service
            .register(register(f.app.app_id, "bob", "bob@example.com"), Default::default())
            .await
            .unwrap();
        let AuthOutcome::VerificationRequired(pending) = outcome else {
            panic!("expected verification");
        };
        assert!(pending.user.is_none());
        let key = keys::pending_registration(pending.session_id);
        assert!(f.store.get(&key).await.unwrap().is_some());

        // No account until the step passes
        let login_before = f
            .service
            .login(login(f.app.app_id, "bob", "password123"), Default::default())
            .await;
        assert!(matches!(login_before, Err(ServiceError::InvalidCredentials)));

        f.verification
            .update_status(pending.session_id, "email_code", PluginState::Completed)
            .await
            .unwrap();
        let done = f.service.continue_session(pending.session_id).await.unwrap();
        let AuthOutcome::Authenticated { user, .. } = done else {
            panic!("expected tokens");
        };
        assert_eq!(user.username, "bob");
        assert!(f.store.get(&key).await.unwrap().is_none());
        assert_eq!(f.repo.session_count(), 0);
        assert_eq!(f.repo.status_count(), 0);

        let again = f.service.continue_session(pending.session_id).await;
        assert!(matches!(again, Err(ServiceError::SessionNotFound)));
    }

    #[tokio::test]
    async fn registration_with_inherited_step_finishes_and_clears() {
        let f = fixture(&[("email_code", AuthAction::Register)]);

        let AuthOutcome::VerificationRequired(first) = f
            .service
            .register(register(f.app.app_id, "bob", "bob@example.com"), Default::default())
            .await
            .unwrap()
        else {
            panic!("expected verification");
        };
        f.verification
            .update_status(first.session_id, "email_code", PluginState::Completed)
            .await
            .unwrap();

        // Retried before continuing; the completed step carries over
        let retried = f
            .service
            .register(register(f.app.app_id, "bob", "bob@example.com"), Default::default())
            .await
            .unwrap();
        assert!(matches!(retried, AuthOutcome::Authenticated { .. }));
        assert_eq!(f.repo.session_count(), 0);
        assert_eq!(f.repo.status_count(), 0);
    }

    #[tokio::test]
    async fn disabled_user_cannot_log_in() {
        let f = fixture(&[]);
        let mut disabled = test_user(f.app.app_id, "carol", "carol@example.com", "password123");
        disabled.user_state_code = "disabled".to_string();
        f.repo.add_user(disabled);

        let result = f
            .service
            .login(login(f.app.app_id, "carol", "password123"), Default::default())
            .await;
        assert!(matches!(result, Err(ServiceError::UserDisabled)));
    }

    #[tokio::test]
    async fn disabled_application_is_rejected() {
        let f = fixture(&[]);
        let mut app = Application::new("paused");
        app.active_flag = false;
        f.repo.add_application(app.clone());

        let result = f
            .service
            .login(login(app.app_id, "alice", "password123"), Default::default())
            .await;
        assert!(matches!(result, Err(ServiceError::ApplicationDisabled)));
    }

    #[tokio::test]
    async fn logout_revokes_both_tokens() {
        let f = fixture(&[]);
        let AuthOutcome::Authenticated { tokens, .. } = f
            .service
            .login(login(f.app.app_id, "alice", "password123"), Default::default())
            .await
            .unwrap()
        else {
            panic!("expected tokens");
        };
        let claims = f.service.validate(&tokens.access_token).await.unwrap();

        f.service
            .logout(&claims, &tokens.access_token, Some(&tokens.refresh_token))
            .await
            .unwrap();

        assert!(matches!(
            f.service.validate(&tokens.access_token).await,
            Err(ServiceError::TokenRevoked)
        ));
        assert!(matches!(
            f.service.refresh(&tokens.refresh_token).await,
            Err(ServiceError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn logout_refuses_someone_elses_refresh_token() {
        let f = fixture(&[]);
        let tokens = TokenService::new(jwt_service(), f.store.clone());
        let mine = tokens.issue_pair(f.user.user_id, f.app.app_id, "alice", "").await.unwrap();
        let theirs = tokens.issue_pair(Uuid::new_v4(), f.app.app_id, "mallory", "").await.unwrap();
        let claims = f.service.validate(&mine.access_token).await.unwrap();

        let result = f
            .service
            .logout(&claims, &mine.access_token, Some(&theirs.refresh_token))
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidToken)));
    }
}
