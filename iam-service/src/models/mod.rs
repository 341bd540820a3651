pub mod application;
pub mod oauth;
pub mod rule;
pub mod user;
pub mod verification;

pub use application::Application;
pub use oauth::{AuthorizationCode, GrantType, OAuthClient};
pub use rule::{NewCondition, NewRule, Rule, RuleCondition, RuleEffect};
pub use user::{NewUser, User, UserSnapshot, UserStatus};
pub use verification::{
    AuthAction, ExecutionStage, IdentifierKind, PluginInstallation, PluginRequirement,
    PluginState, PluginStatus, SessionStatus, Subject, VerificationContext, VerificationSession,
};
