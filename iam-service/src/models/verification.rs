//! Verification session model - transient state of a multi-step login or
//! registration attempt and the per-plugin outcomes recorded against it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// What the subject is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthAction {
    Login,
    Register,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Login => "login",
            AuthAction::Register => "register",
        }
    }
}

impl FromStr for AuthAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(AuthAction::Login),
            "register" => Ok(AuthAction::Register),
            _ => Err(format!("Invalid auth action: {}", s)),
        }
    }
}

/// Kind of identifier used before an account exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Email,
    Phone,
    Username,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Email => "email",
            IdentifierKind::Phone => "phone",
            IdentifierKind::Username => "username",
        }
    }
}

impl FromStr for IdentifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(IdentifierKind::Email),
            "phone" => Ok(IdentifierKind::Phone),
            "username" => Ok(IdentifierKind::Username),
            _ => Err(format!("Invalid identifier kind: {}", s)),
        }
    }
}

/// Who a verification session is for.
///
/// Registration starts with an `Identifier` and only gains a `User` once the
/// account row exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    User(Uuid),
    Identifier { value: String, kind: IdentifierKind },
}

impl Subject {
    pub fn email(value: impl Into<String>) -> Self {
        Subject::Identifier {
            value: value.into().to_lowercase(),
            kind: IdentifierKind::Email,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Subject::User(id) => Some(*id),
            Subject::Identifier { .. } => None,
        }
    }

    /// Split into the `(user_id, identifier, identifier_kind)` storage columns.
    pub fn to_columns(&self) -> (Option<Uuid>, Option<String>, Option<String>) {
        match self {
            Subject::User(id) => (Some(*id), None, None),
            Subject::Identifier { value, kind } => {
                (None, Some(value.clone()), Some(kind.as_str().to_string()))
            }
        }
    }

    pub fn from_columns(
        user_id: Option<Uuid>,
        identifier: Option<String>,
        identifier_kind: Option<String>,
    ) -> Result<Self, String> {
        match (user_id, identifier, identifier_kind) {
            (Some(id), _, _) => Ok(Subject::User(id)),
            (None, Some(value), Some(kind)) => Ok(Subject::Identifier {
                value,
                kind: kind.parse()?,
            }),
            _ => Err("Session row has neither user id nor identifier".to_string()),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(id) => write!(f, "user:{}", id),
            Subject::Identifier { value, kind } => write!(f, "{}:{}", kind.as_str(), value),
        }
    }
}

/// Request context captured when the attempt starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "completed" => Ok(SessionStatus::Completed),
            "expired" => Ok(SessionStatus::Expired),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// In-progress authentication attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationSession {
    pub session_id: Uuid,
    pub app_id: Uuid,
    pub subject: Subject,
    pub action: AuthAction,
    pub context: VerificationContext,
    pub status: SessionStatus,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

impl VerificationSession {
    pub fn new(
        app_id: Uuid,
        subject: Subject,
        action: AuthAction,
        context: VerificationContext,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            app_id,
            subject,
            action,
            context,
            status: SessionStatus::Pending,
            created_utc: now,
            updated_utc: now,
            expiry_utc: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_utc <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Outcome of one plugin's check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Pending,
    Completed,
    Failed,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Pending => "pending",
            PluginState::Completed => "completed",
            PluginState::Failed => "failed",
        }
    }
}

impl FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PluginState::Pending),
            "completed" => Ok(PluginState::Completed),
            "failed" => Ok(PluginState::Failed),
            _ => Err(format!("Invalid plugin state: {}", s)),
        }
    }
}

/// Plugin outcome recorded against a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginStatus {
    pub status_id: Uuid,
    pub session_id: Uuid,
    pub app_id: Uuid,
    pub subject: Subject,
    pub action: AuthAction,
    pub plugin_name: String,
    pub state: PluginState,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PluginStatus {
    pub fn new(session: &VerificationSession, plugin_name: &str, state: PluginState) -> Self {
        let now = Utc::now();
        Self {
            status_id: Uuid::new_v4(),
            session_id: session.session_id,
            app_id: session.app_id,
            subject: session.subject.clone(),
            action: session.action,
            plugin_name: plugin_name.to_string(),
            state,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == PluginState::Completed
    }

    /// A completion recent enough to carry into a replacement session.
    pub fn is_reusable_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.is_completed() && now - self.updated_utc < window
    }
}

/// When a plugin runs relative to the primary credential check.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    PreAuthentication,
    PostAuthentication,
}

impl ExecutionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStage::PreAuthentication => "pre_authentication",
            ExecutionStage::PostAuthentication => "post_authentication",
        }
    }
}

impl FromStr for ExecutionStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_authentication" => Ok(ExecutionStage::PreAuthentication),
            "post_authentication" => Ok(ExecutionStage::PostAuthentication),
            _ => Err(format!("Invalid execution stage: {}", s)),
        }
    }
}

/// A plugin installed for an application.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInstallation {
    pub app_id: Uuid,
    pub plugin_name: String,
    pub required: bool,
    pub stage: ExecutionStage,
    pub actions: Vec<AuthAction>,
    pub enabled: bool,
}

impl PluginInstallation {
    pub fn applies_to(&self, action: AuthAction) -> bool {
        self.enabled && self.actions.contains(&action)
    }
}

/// Computed view of one verification step for the current attempt.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PluginRequirement {
    pub plugin_name: String,
    pub required: bool,
    pub stage: ExecutionStage,
    pub status: Option<PluginState>,
}
