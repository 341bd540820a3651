//! Token lifecycle: issue, validate, rotate and revoke.
//!
//! Tokens are self-contained RS256 JWTs. The shared store holds the single
//! valid refresh token per subject and the set of revoked tokens, so a
//! validation never touches the relational database.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::ServiceError;
use super::jwt::{JwtService, TokenClaims, TokenType};
use super::redis::{keys, SharedStore};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

#[derive(Clone)]
pub struct TokenService {
    jwt: JwtService,
    store: Arc<dyn SharedStore>,
}

impl TokenService {
    pub fn new(jwt: JwtService, store: Arc<dyn SharedStore>) -> Self {
        Self { jwt, store }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.jwt.access_ttl_seconds()
    }

    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.jwt.refresh_ttl_seconds()
    }

    fn mint(
        &self,
        subject: &str,
        tenant_id: Uuid,
        username: &str,
        scope: &str,
    ) -> Result<TokenPair, ServiceError> {
        let access = self
            .jwt
            .claims(subject, tenant_id, username, scope, TokenType::Access);
        let refresh = self
            .jwt
            .claims(subject, tenant_id, username, scope, TokenType::Refresh);

        Ok(TokenPair {
            access_token: self.jwt.sign(&access)?,
            refresh_token: self.jwt.sign(&refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl_seconds(),
            refresh_expires_in: self.refresh_ttl_seconds(),
        })
    }

    /// Sign a new pair and make its refresh token the only valid one for the
    /// subject.
    #[tracing::instrument(skip(self, username))]
    pub async fn issue_pair(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        username: &str,
        scope: &str,
    ) -> Result<TokenPair, ServiceError> {
        let subject = user_id.to_string();
        let pair = self.mint(&subject, tenant_id, username, scope)?;

        self.store
            .set_ex(
                &keys::refresh_token(&subject),
                &pair.refresh_token,
                self.refresh_ttl_seconds() as u64,
            )
            .await?;

        tracing::info!(user_id = %user_id, "Issued token pair");
        Ok(pair)
    }

    /// Check signature, type, revocation and expiry, in that order.
    pub async fn validate(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<TokenClaims, ServiceError> {
        let claims = self.jwt.decode(token)?;

        if claims.typ != expected {
            tracing::debug!(expected = %expected, actual = %claims.typ, "Token type mismatch");
            return Err(ServiceError::InvalidToken);
        }

        if self.store.exists(&keys::revoked_token(token)).await? {
            return Err(ServiceError::TokenRevoked);
        }

        if claims.exp <= Utc::now().timestamp() {
            return Err(ServiceError::TokenExpired);
        }

        Ok(claims)
    }

    /// Rotate a refresh token. Only the currently stored token is accepted and
    /// the swap is atomic, so of two concurrent callers at most one succeeds.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ServiceError> {
        let claims = self.validate(refresh_token, TokenType::Refresh).await?;
        self.rotate(refresh_token, &claims).await
    }

    /// Rotate using claims the caller already validated.
    pub(crate) async fn rotate(
        &self,
        refresh_token: &str,
        claims: &TokenClaims,
    ) -> Result<TokenPair, ServiceError> {
        let pair = self.mint(&claims.sub, claims.tenant_id, &claims.username, &claims.scope)?;

        let swapped = self
            .store
            .compare_and_swap(
                &keys::refresh_token(&claims.sub),
                refresh_token,
                &pair.refresh_token,
                self.refresh_ttl_seconds() as u64,
            )
            .await?;

        if !swapped {
            tracing::warn!(
                user_id = %claims.sub,
                tenant_id = %claims.tenant_id,
                "Refresh token is not the current one for this subject"
            );
            return Err(ServiceError::InvalidToken);
        }

        tracing::info!(user_id = %claims.sub, "Refresh token rotated");
        Ok(pair)
    }

    /// Add a token to the revocation set for the rest of its lifetime.
    /// Revoking a refresh token also drops the subject's stored refresh token.
    #[tracing::instrument(skip(self, token))]
    pub async fn revoke(&self, token: &str, expected: TokenType) -> Result<(), ServiceError> {
        let claims = self.jwt.decode(token)?;
        if claims.typ != expected {
            return Err(ServiceError::InvalidToken);
        }

        let remaining = claims.exp - Utc::now().timestamp();
        if remaining <= 0 {
            tracing::debug!(user_id = %claims.sub, "Token already expired, nothing to revoke");
            return Ok(());
        }

        self.store
            .set_ex(&keys::revoked_token(token), "revoked", remaining as u64)
            .await?;

        if expected == TokenType::Refresh {
            self.store.delete(&keys::refresh_token(&claims.sub)).await?;
        }

        tracing::info!(user_id = %claims.sub, token_type = %expected, "Token revoked");
        Ok(())
    }
}
