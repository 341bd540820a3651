//! Verification plugin contract.
//!
//! A plugin is identified by name. Plugins that gate authentication also
//! expose the `Verifiable` capability; the orchestrator only ever talks to a
//! plugin through these two traits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::{AuthAction, Subject, VerificationContext};

#[async_trait]
pub trait Verifiable: Send + Sync {
    /// Whether an optional plugin still has to run for this attempt,
    /// e.g. false when the device was already seen.
    async fn needs_verification(
        &self,
        subject: &Subject,
        action: AuthAction,
        context: &VerificationContext,
    ) -> Result<bool, ServiceError>;

    /// Live re-check of a stored completion.
    async fn validate_verification(
        &self,
        subject: &Subject,
        action: AuthAction,
        status_id: Uuid,
    ) -> Result<bool, ServiceError>;

    /// Called once a step completes. `status_id` is the id later handed to
    /// `validate_verification` for the same completion.
    async fn on_verification_success(
        &self,
        subject: &Subject,
        action: AuthAction,
        context: &VerificationContext,
        status_id: Uuid,
    ) -> Result<(), ServiceError>;
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn verifiable(&self) -> Option<&dyn Verifiable> {
        None
    }
}

/// Plugins available to this process, by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            tracing::warn!(plugin = %name, "Plugin registered twice, keeping the latest");
        }
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
