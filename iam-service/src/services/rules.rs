//! Attribute-based rule evaluation.
//!
//! A tenant's enabled rules are evaluated in descending priority (oldest first
//! on ties). Each rule's conditions form a conjunction of leaf predicates; the
//! first rule that matches decides. Nothing matching means deny.
//!
//! A condition that cannot be evaluated (missing attribute, incompatible
//! types, unknown operator) disqualifies only its own rule. The failure is
//! reported in the decision and evaluation moves on to the next rule.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::ServiceError;
use super::metrics;
use super::redis::{keys, SharedStore};
use super::repository::RuleRepository;
use crate::models::{NewRule, Rule, RuleEffect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
}

impl FromStr for Operator {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" | "==" => Ok(Operator::Eq),
            "ne" | "!=" => Ok(Operator::Ne),
            "gt" | ">" => Ok(Operator::Gt),
            "gte" | ">=" => Ok(Operator::Gte),
            "lt" | "<" => Ok(Operator::Lt),
            "lte" | "<=" => Ok(Operator::Lte),
            "in" => Ok(Operator::In),
            "not_in" => Ok(Operator::NotIn),
            "contains" => Ok(Operator::Contains),
            "not_contains" => Ok(Operator::NotContains),
            other => Err(ConditionError::InvalidOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("Attribute not found: {0}")]
    FieldNotFound(String),

    #[error("Type mismatch on {field}: cannot apply {operator} to {actual} and {expected}")]
    TypeMismatch {
        field: String,
        operator: Operator,
        actual: &'static str,
        expected: &'static str,
    },

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),
}

impl ConditionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConditionError::FieldNotFound(_) => "field_not_found",
            ConditionError::TypeMismatch { .. } => "type_mismatch",
            ConditionError::InvalidOperator(_) => "invalid_operator",
        }
    }
}

/// Parsed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Leaf {
        field: String,
        operator: Operator,
        value: Value,
    },
}

impl Expr {
    /// Build the tree for a rule. An empty condition set is an empty
    /// conjunction and always matches.
    pub fn parse(rule: &Rule) -> Result<Expr, ConditionError> {
        let mut conditions: Vec<_> = rule.conditions.iter().collect();
        conditions.sort_by_key(|c| c.position);

        let leaves = conditions
            .into_iter()
            .map(|c| {
                Ok(Expr::Leaf {
                    field: c.field.clone(),
                    operator: c.operator.parse()?,
                    value: c.value.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConditionError>>()?;

        Ok(Expr::And(leaves))
    }

    pub fn evaluate(&self, attributes: &Map<String, Value>) -> Result<bool, ConditionError> {
        match self {
            Expr::And(children) => {
                for child in children {
                    if !child.evaluate(attributes)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Leaf {
                field,
                operator,
                value,
            } => {
                let actual = lookup(attributes, field)
                    .ok_or_else(|| ConditionError::FieldNotFound(field.clone()))?;
                apply(field, *operator, actual, value)
            }
        }
    }
}

/// Resolve a possibly dotted attribute path. A literal key containing dots
/// wins over descending into nested objects.
fn lookup<'a>(attributes: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = attributes.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// JSON equality with 1 == 1.0.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn apply(field: &str, operator: Operator, actual: &Value, expected: &Value) -> Result<bool, ConditionError> {
    let mismatch = || ConditionError::TypeMismatch {
        field: field.to_string(),
        operator,
        actual: type_name(actual),
        expected: type_name(expected),
    };

    match operator {
        Operator::Eq => Ok(json_eq(actual, expected)),
        Operator::Ne => Ok(!json_eq(actual, expected)),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let ordering = match (actual, expected) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b))
                    .ok_or_else(mismatch)?,
                // Lexicographic, which also orders RFC 3339 timestamps
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return Err(mismatch()),
            };
            Ok(match operator {
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Gte => ordering != Ordering::Less,
                Operator::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        Operator::In | Operator::NotIn => {
            let set = expected.as_array().ok_or_else(mismatch)?;
            let found = set.iter().any(|candidate| json_eq(actual, candidate));
            Ok(found == (operator == Operator::In))
        }
        Operator::Contains | Operator::NotContains => {
            let found = match (actual, expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| json_eq(item, needle)),
                _ => return Err(mismatch()),
            };
            Ok(found == (operator == Operator::Contains))
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MatchedRule {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub effect: RuleEffect,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RuleFailure {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RuleDecision {
    pub allowed: bool,
    pub matched_rule: Option<MatchedRule>,
    /// Rules skipped because a condition could not be evaluated.
    pub errors: Vec<RuleFailure>,
}

/// Decide against an already ordered rule list.
pub fn decide(rules: &[Rule], attributes: &Map<String, Value>) -> RuleDecision {
    let mut errors = Vec::new();

    for rule in rules.iter().filter(|r| r.enabled) {
        let outcome = Expr::parse(rule).and_then(|expr| expr.evaluate(attributes));
        match outcome {
            Ok(true) => {
                return RuleDecision {
                    allowed: rule.effect == RuleEffect::Allow,
                    matched_rule: Some(MatchedRule {
                        rule_id: rule.rule_id,
                        rule_name: rule.rule_name.clone(),
                        effect: rule.effect,
                        priority: rule.priority,
                    }),
                    errors,
                };
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(rule_id = %rule.rule_id, error = %e, "Rule could not be evaluated");
                errors.push(RuleFailure {
                    rule_id: rule.rule_id,
                    rule_name: rule.rule_name.clone(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    RuleDecision {
        allowed: false,
        matched_rule: None,
        errors,
    }
}

#[derive(Clone)]
pub struct RuleEngine {
    repo: Arc<dyn RuleRepository>,
    store: Arc<dyn SharedStore>,
    cache_ttl_seconds: u64,
}

impl RuleEngine {
    pub fn new(
        repo: Arc<dyn RuleRepository>,
        store: Arc<dyn SharedStore>,
        cache_ttl_seconds: u64,
    ) -> Self {
        Self {
            repo,
            store,
            cache_ttl_seconds,
        }
    }

    /// Enabled rules in evaluation order, from cache when possible.
    ///
    /// The cache is only filled if no mutation bumped the tenant's rule
    /// version while the rules were loading.
    async fn enabled_rules(&self, app_id: Uuid) -> Result<Vec<Rule>, ServiceError> {
        let key = keys::rules(app_id);
        let version_key = keys::rules_version(app_id);

        if let Some(cached) = self.store.get(&key).await? {
            match serde_json::from_str::<Vec<Rule>>(&cached) {
                Ok(rules) => return Ok(rules),
                Err(e) => {
                    tracing::warn!(app_id = %app_id, error = %e, "Discarding unreadable rule cache entry");
                }
            }
        }

        let version = self
            .store
            .get(&version_key)
            .await?
            .unwrap_or_else(|| "0".to_string());

        let mut rules: Vec<Rule> = self
            .repo
            .load_rules(app_id)
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        rules.sort_by(Rule::evaluation_order);

        let payload = serde_json::to_string(&rules).map_err(anyhow::Error::from)?;
        let filled = self
            .store
            .set_ex_if_guard(&key, &payload, self.cache_ttl_seconds, &version_key, &version)
            .await?;
        if filled {
            tracing::debug!(app_id = %app_id, count = rules.len(), "Rule cache filled");
        } else {
            tracing::debug!(app_id = %app_id, "Rules changed while loading, cache left empty");
        }

        Ok(rules)
    }

    #[tracing::instrument(skip(self, attributes))]
    pub async fn evaluate(
        &self,
        app_id: Uuid,
        attributes: &Map<String, Value>,
    ) -> Result<RuleDecision, ServiceError> {
        let rules = self.enabled_rules(app_id).await?;
        let decision = decide(&rules, attributes);

        let result = match (&decision.matched_rule, decision.allowed) {
            (None, _) => "no_match",
            (Some(_), true) => "allow",
            (Some(_), false) => "deny",
        };
        metrics::record_rule_evaluation(result);
        tracing::info!(
            result,
            matched_rule = ?decision.matched_rule.as_ref().map(|m| m.rule_id),
            errors = decision.errors.len(),
            "Rules evaluated"
        );

        Ok(decision)
    }

    /// Bump the version first so an in-flight fill cannot land after the
    /// delete.
    async fn evict(&self, app_id: Uuid) -> Result<(), ServiceError> {
        self.store.incr(&keys::rules_version(app_id)).await?;
        self.store.delete(&keys::rules(app_id)).await?;
        Ok(())
    }

    fn check(rule: &NewRule) -> Result<(), ServiceError> {
        if rule.rule_name.trim().is_empty() {
            return Err(ServiceError::Validation("rule_name must not be empty".to_string()));
        }
        for condition in &rule.conditions {
            if condition.field.trim().is_empty() {
                return Err(ServiceError::Validation(
                    "condition field must not be empty".to_string(),
                ));
            }
            condition
                .operator
                .parse::<Operator>()
                .map_err(|e| ServiceError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn list_rules(&self, app_id: Uuid) -> Result<Vec<Rule>, ServiceError> {
        let mut rules = self.repo.load_rules(app_id).await?;
        rules.sort_by(Rule::evaluation_order);
        Ok(rules)
    }

    pub async fn get_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<Rule, ServiceError> {
        self.repo
            .find_rule(app_id, rule_id)
            .await?
            .ok_or(ServiceError::RuleNotFound)
    }

    #[tracing::instrument(skip(self, new_rule))]
    pub async fn create_rule(&self, app_id: Uuid, new_rule: NewRule) -> Result<Rule, ServiceError> {
        Self::check(&new_rule)?;
        let rule = new_rule.into_rule(Uuid::new_v4(), app_id, Utc::now());
        self.repo.insert_rule(&rule).await?;
        self.evict(app_id).await?;
        tracing::info!(rule_id = %rule.rule_id, "Rule created");
        Ok(rule)
    }

    #[tracing::instrument(skip(self, new_rule))]
    pub async fn update_rule(
        &self,
        app_id: Uuid,
        rule_id: Uuid,
        new_rule: NewRule,
    ) -> Result<Rule, ServiceError> {
        Self::check(&new_rule)?;
        let existing = self.get_rule(app_id, rule_id).await?;
        let rule = new_rule.into_rule(rule_id, app_id, existing.created_utc);

        if !self.repo.replace_rule(&rule).await? {
            return Err(ServiceError::RuleNotFound);
        }
        self.evict(app_id).await?;
        tracing::info!("Rule updated");
        Ok(rule)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_rule(&self, app_id: Uuid, rule_id: Uuid) -> Result<(), ServiceError> {
        if !self.repo.delete_rule(app_id, rule_id).await? {
            return Err(ServiceError::RuleNotFound);
        }
        self.evict(app_id).await?;
        tracing::info!("Rule deleted");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_enabled(
        &self,
        app_id: Uuid,
        rule_id: Uuid,
        enabled: bool,
    ) -> Result<Rule, ServiceError> {
        if !self.repo.set_rule_enabled(app_id, rule_id, enabled).await? {
            return Err(ServiceError::RuleNotFound);
        }
        self.evict(app_id).await?;
        self.get_rule(app_id, rule_id).await
    }
}
