//! Engine services: token lifecycle, verification orchestration, rule
//! evaluation and the OAuth2/OIDC flow, plus their persistence seams.

pub mod auth;
mod database;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod oauth;
pub mod plugins;
pub mod redis;
pub mod repository;
pub mod rules;
pub mod token;
pub mod verification;

pub use auth::{AuthOutcome, AuthService, PendingVerification};
pub use database::Database;
pub use error::ServiceError;
pub use jwt::{IdTokenClaims, JwtService, Jwks, TokenClaims, TokenType};
pub use oauth::{ClientCredentials, OAuthService};
pub use plugins::{Plugin, PluginRegistry, Verifiable};
pub use redis::{MockStore, RedisService, SharedStore};
pub use repository::{
    ApplicationStore, MockRepository, OAuthRepository, RuleRepository, UserDirectory,
    VerificationRepository,
};
pub use rules::{RuleDecision, RuleEngine};
pub use token::{TokenPair, TokenService};
pub use verification::{VerificationService, VerificationStatus};
