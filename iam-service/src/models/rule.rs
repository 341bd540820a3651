//! Authorization rule model.
//!
//! Rules are cached as JSON in the shared store, so every type here round-trips
//! through serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    Allow,
    Deny,
}

impl RuleEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleEffect::Allow => "allow",
            RuleEffect::Deny => "deny",
        }
    }
}

impl FromStr for RuleEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(RuleEffect::Allow),
            "deny" => Ok(RuleEffect::Deny),
            _ => Err(format!("Invalid rule effect: {}", s)),
        }
    }
}

/// One leaf predicate. The operator stays a string so that a bad stored value
/// is reported at evaluation time instead of poisoning the whole rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RuleCondition {
    pub condition_id: Uuid,
    pub rule_id: Uuid,
    pub position: i32,
    pub field: String,
    pub operator: String,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Rule {
    pub rule_id: Uuid,
    pub app_id: Uuid,
    pub rule_name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub effect: RuleEffect,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub conditions: Vec<RuleCondition>,
}

impl Rule {
    /// Evaluation order: priority descending, then oldest first.
    pub fn evaluation_order(a: &Rule, b: &Rule) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_utc.cmp(&b.created_utc))
    }
}

/// Condition payload for create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NewCondition {
    pub field: String,
    pub operator: String,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

/// Rule payload for create/update. Conditions are replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NewRule {
    pub rule_name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub effect: RuleEffect,
    pub enabled: bool,
    pub conditions: Vec<NewCondition>,
}

impl NewRule {
    pub fn into_rule(self, rule_id: Uuid, app_id: Uuid, created_utc: DateTime<Utc>) -> Rule {
        let now = Utc::now();
        let conditions = self
            .conditions
            .into_iter()
            .enumerate()
            .map(|(i, c)| RuleCondition {
                condition_id: Uuid::new_v4(),
                rule_id,
                position: i as i32,
                field: c.field,
                operator: c.operator,
                value: c.value,
            })
            .collect();

        Rule {
            rule_id,
            app_id,
            rule_name: self.rule_name,
            description: self.description,
            priority: self.priority,
            effect: self.effect,
            enabled: self.enabled,
            created_utc,
            updated_utc: now,
            conditions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn rule(priority: i32, age_minutes: i64) -> Rule {
        NewRule {
            rule_name: format!("p{}", priority),
            description: None,
            priority,
            effect: RuleEffect::Allow,
            enabled: true,
            conditions: vec![],
        }
        .into_rule(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Utc::now() - Duration::minutes(age_minutes),
        )
    }

    #[test]
    fn orders_by_priority_then_age() {
        let mut rules = vec![rule(5, 10), rule(10, 1), rule(10, 5)];
        rules.sort_by(Rule::evaluation_order);

        assert_eq!(rules[0].priority, 10);
        assert!(rules[0].created_utc < rules[1].created_utc);
        assert_eq!(rules[2].priority, 5);
    }

    #[test]
    fn conditions_keep_submission_order() {
        let new_rule = NewRule {
            rule_name: "r".to_string(),
            description: None,
            priority: 1,
            effect: RuleEffect::Deny,
            enabled: true,
            conditions: vec![
                NewCondition {
                    field: "a".to_string(),
                    operator: "eq".to_string(),
                    value: serde_json::json!(1),
                },
                NewCondition {
                    field: "b".to_string(),
                    operator: "eq".to_string(),
                    value: serde_json::json!(2),
                },
            ],
        };
        let rule_id = Uuid::new_v4();
        let rule = new_rule.into_rule(rule_id, Uuid::new_v4(), Utc::now());

        assert_eq!(rule.conditions[0].position, 0);
        assert_eq!(rule.conditions[1].field, "b");
        assert!(rule.conditions.iter().all(|c| c.rule_id == rule_id));
    }
}
