//! OAuth2 authorization-code grant with OpenID Connect ID tokens.
//!
//! `authorize` runs for an already authenticated user and hands out a
//! single-use code; `issue_token` redeems that code (or a refresh token) for
//! tokens minted by the token lifecycle.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, Utc};
use std::sync::Arc;
use url::Url;

use super::error::ServiceError;
use super::jwt::{IdTokenClaims, TokenClaims, TokenType};
use super::repository::{OAuthRepository, UserDirectory};
use super::token::TokenService;
use crate::config::OAuthConfig;
use crate::dtos::oauth::{AuthorizeRequest, DiscoveryDocument, TokenRequest, TokenResponse};
use crate::models::{AuthorizationCode, GrantType, OAuthClient, User};
use crate::utils::{random_token, secret_matches};

/// Client id and secret, from HTTP Basic or the form body.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Parse an `Authorization: Basic ...` header value.
    pub fn from_basic(header: &str) -> Option<Self> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (client_id, client_secret) = decoded.split_once(':')?;
        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Basic wins over form fields when both are sent.
    pub fn resolve(basic: Option<&str>, request: &TokenRequest) -> Option<Self> {
        basic.and_then(Self::from_basic).or_else(|| {
            Some(Self {
                client_id: request.client_id.clone()?,
                client_secret: request.client_secret.clone()?,
            })
        })
    }
}

/// Redirect URIs compare without their query string.
fn strip_query(uri: &str) -> &str {
    uri.split(['?', '#']).next().unwrap_or(uri)
}

#[derive(Clone)]
pub struct OAuthService {
    repo: Arc<dyn OAuthRepository>,
    users: Arc<dyn UserDirectory>,
    tokens: TokenService,
    code_ttl: Duration,
}

impl OAuthService {
    pub fn new(
        repo: Arc<dyn OAuthRepository>,
        users: Arc<dyn UserDirectory>,
        tokens: TokenService,
        config: &OAuthConfig,
    ) -> Self {
        Self {
            repo,
            users,
            tokens,
            code_ttl: Duration::minutes(config.code_ttl_minutes),
        }
    }

    async fn active_client(&self, client_id: &str) -> Result<OAuthClient, ServiceError> {
        self.repo
            .find_client(client_id)
            .await?
            .filter(|c| c.active_flag)
            .ok_or(ServiceError::InvalidClient)
    }

    /// Validate an authorization request for the signed-in user and return the
    /// client redirect URI carrying a fresh code.
    #[tracing::instrument(skip(self, user, request), fields(client_id = %request.client_id))]
    pub async fn authorize(
        &self,
        user: &TokenClaims,
        request: AuthorizeRequest,
    ) -> Result<String, ServiceError> {
        let client = self.active_client(&request.client_id).await?;

        if client.app_id != user.tenant_id {
            tracing::warn!(tenant_id = %user.tenant_id, "Client belongs to another tenant");
            return Err(ServiceError::InvalidClient);
        }

        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(ServiceError::UnauthorizedClient);
        }

        let response_types: Vec<&str> = request.response_type.split_whitespace().collect();
        if !response_types.contains(&"code")
            || response_types.iter().any(|t| *t != "code" && *t != "id_token")
        {
            return Err(ServiceError::UnsupportedResponseType(request.response_type.clone()));
        }
        let wants_id_token = response_types.contains(&"id_token");

        if !client.has_redirect_uri(&request.redirect_uri) {
            return Err(ServiceError::InvalidRedirectUri);
        }
        let mut redirect = Url::parse(&request.redirect_uri).map_err(|_| ServiceError::InvalidRedirectUri)?;

        let scope = request.scope.unwrap_or_default();
        if !client.allows_scopes(scope.split_whitespace()) {
            return Err(ServiceError::InvalidScope(scope));
        }

        let user_id = user.user_id()?;
        let code = AuthorizationCode::new(
            random_token(),
            client.client_id.clone(),
            client.app_id,
            user_id,
            request.redirect_uri.clone(),
            scope,
            request.nonce,
            self.code_ttl,
        );

        let id_token = if wants_id_token {
            let account = self
                .users
                .find_user_by_id(user_id)
                .await?
                .ok_or(ServiceError::InvalidToken)?;
            Some(self.id_token(&account, &code)?)
        } else {
            None
        };

        self.repo.insert_code(&code).await?;

        {
            let mut query = redirect.query_pairs_mut();
            query.append_pair("code", &code.code);
            if let Some(state) = &request.state {
                query.append_pair("state", state);
            }
            if let Some(id_token) = &id_token {
                query.append_pair("id_token", id_token);
            }
        }

        tracing::info!(user_id = %user_id, "Authorization code issued");
        Ok(redirect.into())
    }

    /// Token endpoint.
    #[tracing::instrument(skip(self, credentials, request), fields(grant_type = %request.grant_type))]
    pub async fn issue_token(
        &self,
        credentials: Option<ClientCredentials>,
        request: TokenRequest,
    ) -> Result<TokenResponse, ServiceError> {
        let credentials = credentials.ok_or(ServiceError::InvalidClient)?;
        let client = self.active_client(&credentials.client_id).await?;
        if !secret_matches(&credentials.client_secret, &client.secret_hash) {
            tracing::warn!(client_id = %client.client_id, "Client secret mismatch");
            return Err(ServiceError::InvalidClient);
        }

        let grant: GrantType = request
            .grant_type
            .parse()
            .map_err(|_| ServiceError::UnsupportedGrantType(request.grant_type.clone()))?;
        if !client.allows_grant(grant) {
            return Err(ServiceError::UnauthorizedClient);
        }

        match grant {
            GrantType::AuthorizationCode => self.redeem_code(&client, request).await,
            GrantType::RefreshToken => self.refresh(&client, request).await,
        }
    }

    async fn redeem_code(
        &self,
        client: &OAuthClient,
        request: TokenRequest,
    ) -> Result<TokenResponse, ServiceError> {
        let presented = request
            .code
            .ok_or_else(|| ServiceError::InvalidRequest("code is required".to_string()))?;
        let redirect_uri = request
            .redirect_uri
            .ok_or_else(|| ServiceError::InvalidRequest("redirect_uri is required".to_string()))?;

        // Consumed before any check so a rejected redemption still burns it
        let code = self
            .repo
            .consume_code(&presented)
            .await?
            .ok_or_else(|| ServiceError::InvalidGrant("Authorization code is invalid or already used".to_string()))?;

        if code.client_id != client.client_id {
            return Err(ServiceError::InvalidGrant("Code was issued to another client".to_string()));
        }
        if strip_query(&code.redirect_uri) != strip_query(&redirect_uri) {
            return Err(ServiceError::InvalidGrant("redirect_uri does not match".to_string()));
        }
        if code.is_expired() {
            return Err(ServiceError::InvalidGrant("Authorization code expired".to_string()));
        }

        let user = self
            .users
            .find_user_by_id(code.user_id)
            .await?
            .filter(|u| u.is_active())
            .ok_or_else(|| ServiceError::InvalidGrant("User is not active".to_string()))?;

        let pair = self
            .tokens
            .issue_pair(user.user_id, code.app_id, &user.username, &code.scope)
            .await?;

        let id_token = if code.scope.split_whitespace().any(|s| s == "openid") {
            Some(self.id_token(&user, &code)?)
        } else {
            None
        };

        tracing::info!(user_id = %user.user_id, client_id = %client.client_id, "Authorization code redeemed");
        Ok(TokenResponse {
            access_token: pair.access_token,
            token_type: pair.token_type,
            expires_in: pair.expires_in,
            refresh_token: pair.refresh_token,
            id_token,
            scope: code.scope,
        })
    }

    async fn refresh(
        &self,
        client: &OAuthClient,
        request: TokenRequest,
    ) -> Result<TokenResponse, ServiceError> {
        let refresh_token = request
            .refresh_token
            .ok_or_else(|| ServiceError::InvalidRequest("refresh_token is required".to_string()))?;

        let claims = self
            .tokens
            .validate(&refresh_token, TokenType::Refresh)
            .await
            .map_err(Self::as_grant_error)?;

        if claims.tenant_id != client.app_id {
            tracing::warn!(
                client_id = %client.client_id,
                tenant_id = %claims.tenant_id,
                "Refresh token presented by a client of another tenant"
            );
            return Err(ServiceError::InvalidGrant("Refresh token was not issued for this client's application".to_string()));
        }

        let pair = self
            .tokens
            .rotate(&refresh_token, &claims)
            .await
            .map_err(Self::as_grant_error)?;

        Ok(TokenResponse {
            access_token: pair.access_token,
            token_type: pair.token_type,
            expires_in: pair.expires_in,
            refresh_token: pair.refresh_token,
            id_token: None,
            scope: claims.scope,
        })
    }

    /// Token failures surface as `invalid_grant` on the token endpoint.
    fn as_grant_error(err: ServiceError) -> ServiceError {
        match err {
            ServiceError::InvalidToken => ServiceError::InvalidGrant("Refresh token is invalid".to_string()),
            ServiceError::TokenExpired => ServiceError::InvalidGrant("Refresh token expired".to_string()),
            ServiceError::TokenRevoked => ServiceError::InvalidGrant("Refresh token revoked".to_string()),
            other => other,
        }
    }

    fn id_token(&self, user: &User, code: &AuthorizationCode) -> Result<String, ServiceError> {
        let has = |scope: &str| code.scope.split_whitespace().any(|s| s == scope);
        let now = Utc::now().timestamp();
        let jwt = self.tokens.jwt();

        let mut claims = IdTokenClaims {
            iss: jwt.issuer().to_string(),
            sub: user.user_id.to_string(),
            aud: code.client_id.clone(),
            exp: now + self.tokens.access_ttl_seconds(),
            iat: now,
            auth_time: code.created_utc.timestamp(),
            nonce: code.nonce.clone(),
            ..Default::default()
        };

        if has("profile") {
            claims.name = Some(user.display_name.clone().unwrap_or_else(|| user.username.clone()));
            claims.preferred_username = Some(user.username.clone());
        }
        if has("email") {
            claims.email = Some(user.email.clone());
            claims.email_verified = Some(user.email_verified);
        }
        if has("phone") {
            if let Some(phone) = &user.phone {
                claims.phone_number = Some(phone.clone());
                claims.phone_number_verified = Some(user.phone_verified);
            }
        }

        jwt.sign_id_token(&claims)
    }

    pub fn discovery(&self) -> DiscoveryDocument {
        let issuer = self.tokens.jwt().issuer().trim_end_matches('/').to_string();
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        DiscoveryDocument {
            authorization_endpoint: format!("{}/oauth/authorize", issuer),
            token_endpoint: format!("{}/oauth/token", issuer),
            jwks_uri: format!("{}/.well-known/jwks.json", issuer),
            response_types_supported: strings(&["code", "code id_token"]),
            grant_types_supported: strings(&["authorization_code", "refresh_token"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&["RS256"]),
            scopes_supported: strings(&["openid", "profile", "email", "phone"]),
            token_endpoint_auth_methods_supported: strings(&["client_secret_basic", "client_secret_post"]),
            claims_supported: strings(&[
                "iss",
                "sub",
                "aud",
                "exp",
                "iat",
                "auth_time",
                "nonce",
                "name",
                "preferred_username",
                "email",
                "email_verified",
                "phone_number",
                "phone_number_verified",
            ]),
            issuer,
        }
    }
}
