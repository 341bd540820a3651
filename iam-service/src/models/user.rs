//! User model - read and created through the user directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// User state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Disabled,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Disabled => "disabled",
        }
    }
}

/// User entity.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub app_id: Uuid,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub phone: Option<String>,
    pub phone_verified: bool,
    pub display_name: Option<String>,
    pub user_state_code: String,
    pub password_hash: String,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.user_state_code == UserStatus::Active.as_str()
    }

    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            user_id: self.user_id,
            app_id: self.app_id,
            username: self.username.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Fields needed to create a user once registration verification completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub app_id: Uuid,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: String,
}

impl NewUser {
    pub fn into_user(self) -> User {
        User {
            user_id: Uuid::new_v4(),
            app_id: self.app_id,
            username: self.username,
            email: self.email,
            email_verified: false,
            phone: self.phone,
            phone_verified: false,
            display_name: self.display_name,
            user_state_code: UserStatus::Active.as_str().to_string(),
            password_hash: self.password_hash,
            created_utc: Utc::now(),
        }
    }
}

/// User fields safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserSnapshot {
    pub user_id: Uuid,
    pub app_id: Uuid,
    pub username: String,
    pub email: String,
    pub display_name: Option<String>,
}
