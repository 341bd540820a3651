use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::ServiceError;
use crate::config::JwtConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenType::Access => write!(f, "access"),
            TokenType::Refresh => write!(f, "refresh"),
        }
    }
}

/// Claims carried by both access and refresh tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Owning application
    pub tenant_id: Uuid,
    pub username: String,
    pub typ: TokenType,
    /// Space-delimited OAuth scope, empty for first-party logins
    #[serde(default)]
    pub scope: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token so two pairs minted in the same second still differ
    pub jti: String,
}

impl TokenClaims {
    pub fn user_id(&self) -> Result<Uuid, ServiceError> {
        Uuid::parse_str(&self.sub).map_err(|_| ServiceError::InvalidToken)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }
}

/// OpenID Connect ID token claims.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub auth_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number_verified: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// RS256 signer and verifier for every token the service issues.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
    issuer: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

impl JwtService {
    /// Load the RSA key pair from the configured PEM files.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;

        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        Self::from_pem(&private_key_pem, &public_key_pem, config)
    }

    pub fn from_pem(
        private_key_pem: &str,
        public_key_pem: &str,
        config: &JwtConfig,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
            .map_err(|e| anyhow::anyhow!("Failed to parse public key for JWKS: {}", e))?;

        let jwk = Jwk {
            kty: "RSA".to_string(),
            use_: "sig".to_string(),
            alg: "RS256".to_string(),
            kid: config.key_id.clone(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        };

        tracing::info!(kid = %config.key_id, "JWT service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            jwk,
            issuer: config.issuer.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_token_expiry_days * 24 * 60 * 60
    }

    /// Build claims for a new token of the given type.
    pub fn claims(
        &self,
        user_id: &str,
        tenant_id: Uuid,
        username: &str,
        scope: &str,
        typ: TokenType,
    ) -> TokenClaims {
        let now = Utc::now();
        let lifetime = match typ {
            TokenType::Access => Duration::minutes(self.access_token_expiry_minutes),
            TokenType::Refresh => Duration::days(self.refresh_token_expiry_days),
        };

        TokenClaims {
            sub: user_id.to_string(),
            tenant_id,
            username: username.to_string(),
            typ,
            scope: scope.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, ServiceError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.jwk.kid.clone());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to sign token: {}", e)))
    }

    pub fn sign_id_token(&self, claims: &IdTokenClaims) -> Result<String, ServiceError> {
        self.sign(claims)
    }

    /// Verify signature, issuer and format. Expiry is left to
    /// `TokenService::validate`, which checks it after type and revocation.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, ServiceError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token failed signature or format check");
                ServiceError::InvalidToken
            })
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jwt_config, jwt_service, TEST_PRIVATE_KEY, TEST_PUBLIC_KEY};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_keys_from_files() -> Result<(), anyhow::Error> {
        let mut private_file = NamedTempFile::new()?;
        private_file.write_all(TEST_PRIVATE_KEY.as_bytes())?;
        let mut public_file = NamedTempFile::new()?;
        public_file.write_all(TEST_PUBLIC_KEY.as_bytes())?;

        let mut config = jwt_config();
        config.private_key_path = private_file.path().to_string_lossy().to_string();
        config.public_key_path = public_file.path().to_string_lossy().to_string();

        let service = JwtService::new(&config)?;
        assert_eq!(service.access_ttl_seconds(), 15 * 60);
        assert_eq!(service.refresh_ttl_seconds(), 7 * 24 * 60 * 60);
        Ok(())
    }

    #[test]
    fn missing_key_file_is_reported() {
        let mut config = jwt_config();
        config.private_key_path = "/nonexistent/private.pem".to_string();
        let err = JwtService::new(&config).err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("/nonexistent/private.pem"));
    }

    #[test]
    fn signed_claims_round_trip() -> Result<(), ServiceError> {
        let service = jwt_service();
        let tenant = Uuid::new_v4();
        let claims = service.claims("user_123", tenant, "alice", "openid email", TokenType::Access);
        let token = service.sign(&claims)?;

        let decoded = service.decode(&token)?;
        assert_eq!(decoded, claims);
        assert!(decoded.has_scope("email"));
        assert!(!decoded.has_scope("phone"));
        Ok(())
    }

    #[test]
    fn expired_tokens_still_decode() -> Result<(), ServiceError> {
        let service = jwt_service();
        let mut claims = service.claims("u", Uuid::new_v4(), "alice", "", TokenType::Refresh);
        claims.exp = Utc::now().timestamp() - 3600;
        let token = service.sign(&claims)?;
        assert_eq!(service.decode(&token)?.exp, claims.exp);
        Ok(())
    }

    #[test]
    fn tampered_token_is_invalid() -> Result<(), ServiceError> {
        let service = jwt_service();
        let claims = service.claims("u", Uuid::new_v4(), "alice", "", TokenType::Access);
        let mut token = service.sign(&claims)?;
        token.push('x');
        assert!(matches!(service.decode(&token), Err(ServiceError::InvalidToken)));
        assert!(matches!(service.decode("not-a-jwt"), Err(ServiceError::InvalidToken)));
        Ok(())
    }

    #[test]
    fn jwks_exposes_public_modulus() {
        let jwks = jwt_service().jwks();
        assert_eq!(jwks.keys.len(), 1);
        let key = &jwks.keys[0];
        assert_eq!(key.kty, "RSA");
        assert_eq!(key.alg, "RS256");
        // 65537
        assert_eq!(key.e, "AQAB");
        // 2048-bit modulus is 256 bytes, 342 base64url chars without padding
        assert_eq!(key.n.len(), 342);
    }

    #[test]
    fn id_token_omits_unrequested_claims() -> Result<(), ServiceError> {
        let service = jwt_service();
        let claims = IdTokenClaims {
            iss: service.issuer().to_string(),
            sub: "u".to_string(),
            aud: "client".to_string(),
            exp: Utc::now().timestamp() + 60,
            iat: Utc::now().timestamp(),
            auth_time: Utc::now().timestamp(),
            email: Some("a@example.com".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&claims).map_err(anyhow::Error::from)?;
        assert!(json.get("phone_number").is_none());
        assert!(json.get("nonce").is_none());
        assert!(!service.sign_id_token(&claims)?.is_empty());
        Ok(())
    }
}
