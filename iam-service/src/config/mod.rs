use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct IamConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub verification: VerificationConfig,
    pub rules: RulesConfig,
    pub oauth: OAuthConfig,
    pub security: SecurityConfig,
    pub swagger: SwaggerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Deadline applied to every shared-store command.
    pub operation_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub issuer: String,
    pub key_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    pub session_ttl_minutes: i64,
    pub status_reuse_minutes: i64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub code_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwaggerConfig {
    pub enabled: SwaggerMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SwaggerMode {
    Public,
    Disabled,
}

impl IamConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = IamConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("iam-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_parsed("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: get_parsed("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
                acquire_timeout_seconds: get_parsed("DATABASE_ACQUIRE_TIMEOUT_SECONDS", "5", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
                operation_timeout_ms: get_parsed("REDIS_OPERATION_TIMEOUT_MS", "2000", is_prod)?,
            },
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                access_token_expiry_minutes: get_parsed(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: get_parsed(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "7",
                    is_prod,
                )?,
                issuer: get_env("JWT_ISSUER", Some("http://localhost:8080"), is_prod)?,
                key_id: get_env("JWT_KEY_ID", Some("iam-signing-key"), is_prod)?,
            },
            verification: VerificationConfig {
                session_ttl_minutes: get_parsed("VERIFICATION_SESSION_TTL_MINUTES", "30", is_prod)?,
                status_reuse_minutes: get_parsed(
                    "VERIFICATION_STATUS_REUSE_MINUTES",
                    "30",
                    is_prod,
                )?,
                sweep_interval_seconds: get_parsed(
                    "VERIFICATION_SWEEP_INTERVAL_SECONDS",
                    "300",
                    is_prod,
                )?,
            },
            rules: RulesConfig {
                cache_ttl_seconds: get_parsed("RULES_CACHE_TTL_SECONDS", "86400", is_prod)?,
            },
            oauth: OAuthConfig {
                code_ttl_minutes: get_parsed("OAUTH_CODE_TTL_MINUTES", "10", is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                admin_api_key: get_env("ADMIN_API_KEY", None, true)?,
            },
            swagger: SwaggerConfig {
                enabled: get_env("ENABLE_SWAGGER", Some("public"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(config_error("JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(config_error("JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"));
        }

        if self.verification.session_ttl_minutes <= 0 {
            return Err(config_error("VERIFICATION_SESSION_TTL_MINUTES must be positive"));
        }

        if self.oauth.code_ttl_minutes <= 0 {
            return Err(config_error("OAUTH_CODE_TTL_MINUTES must be positive"));
        }

        if self.redis.operation_timeout_ms == 0 {
            return Err(config_error("REDIS_OPERATION_TIMEOUT_MS must be positive"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(config_error(
                "DATABASE_MIN_CONNECTIONS cannot exceed DATABASE_MAX_CONNECTIONS",
            ));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(config_error("Wildcard CORS origin not allowed in production"));
            }

            if self.swagger.enabled == SwaggerMode::Public {
                tracing::error!("Swagger is publicly accessible in production - consider 'disabled'");
            }
        }

        Ok(())
    }
}

fn config_error(msg: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(msg.to_string()))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!(format!("{}: {}", key, e))))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for SwaggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(SwaggerMode::Public),
            "disabled" => Ok(SwaggerMode::Disabled),
            _ => Err(format!("Invalid swagger mode: {}", s)),
        }
    }
}
