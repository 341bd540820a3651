//! Application model - the tenant boundary every other entity is scoped to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Application (tenant) entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Application {
    pub app_id: Uuid,
    pub app_name: String,
    pub active_flag: bool,
    pub created_utc: DateTime<Utc>,
}

impl Application {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_id: Uuid::new_v4(),
            app_name: app_name.into(),
            active_flag: true,
            created_utc: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_flag
    }
}
