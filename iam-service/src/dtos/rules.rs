use serde::Deserialize;
use serde_json::{Map, Value};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct EvaluateRequest {
    /// Attribute map the conditions are matched against
    #[schema(value_type = Object, example = json!({"role": "editor", "user": {"dept": "sales"}}))]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}
