//! OAuth client registrations and authorization codes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            _ => Err(format!("Unsupported grant type: {}", s)),
        }
    }
}

/// Registered OAuth client. `secret_hash` is lowercase SHA-256 hex.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthClient {
    pub client_id: String,
    pub app_id: Uuid,
    pub client_name: String,
    pub secret_hash: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub active_flag: bool,
    pub created_utc: DateTime<Utc>,
}

impl OAuthClient {
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.iter().any(|g| g == grant.as_str())
    }

    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }

    pub fn allows_scopes<'a>(&self, mut requested: impl Iterator<Item = &'a str>) -> bool {
        requested.all(|s| self.scopes.iter().any(|allowed| allowed == s))
    }
}

/// Single-use authorization code.
#[derive(Debug, Clone, FromRow)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub app_id: Uuid,
    pub user_id: Uuid,
    pub redirect_uri: String,
    pub scope: String,
    pub nonce: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

impl AuthorizationCode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        code: String,
        client_id: String,
        app_id: Uuid,
        user_id: Uuid,
        redirect_uri: String,
        scope: String,
        nonce: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            code,
            client_id,
            app_id,
            user_id,
            redirect_uri,
            scope,
            nonce,
            created_utc: now,
            expiry_utc: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expiry_utc <= Utc::now()
    }
}
