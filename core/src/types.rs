/// Persistent data model: definitions, instances and gate rows
use crate::errors::{WorkflowError, WorkflowResult};
use crate::state_machine::LifecycleStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Registered kind of workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub definition_id: String,
    pub display_name: String,
    #[serde(default)]
    pub form_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema: Option<PayloadSchema>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One invocation of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub definition_id: String,
    pub cached_display_name: String,
    pub principal: String,
    pub lifecycle_status: LifecycleStatus,
    #[serde(default)]
    pub user_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Predicates for listing instances; all optional and ANDed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default)]
    pub definition_id: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub lifecycle_status: Option<LifecycleStatus>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        self.definition_id
            .as_ref()
            .map_or(true, |d| d == &instance.definition_id)
            && self
                .principal
                .as_ref()
                .map_or(true, |p| p == &instance.principal)
            && self
                .lifecycle_status
                .map_or(true, |s| s == instance.lifecycle_status)
    }
}

/// Field type accepted by a payload schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

/// Minimal declarative schema for start payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, FieldType>,
}

impl PayloadSchema {
    /// Validate a payload, reporting the first violation
    pub fn validate(&self, payload: &Value) -> WorkflowResult<()> {
        let object = payload
            .as_object()
            .ok_or_else(|| WorkflowError::Validation("payload must be an object".to_string()))?;

        for field in &self.required {
            if object.get(field).map_or(true, Value::is_null) {
                return Err(WorkflowError::Validation(format!(
                    "missing required field: {}",
                    field
                )));
            }
        }

        for (field, expected) in &self.properties {
            if let Some(value) = object.get(field) {
                if !value.is_null() && !expected.accepts(value) {
                    return Err(WorkflowError::Validation(format!(
                        "field {} must be of type {:?}",
                        field, expected
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Per-entity enable/disable switch of the event-driven gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRow {
    pub scope: String,
    pub entity_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GateRow {
    /// Row used when nothing is stored for `(scope, entity_id)`
    pub fn default_for(scope: &str, entity_id: &str, enabled: bool) -> Self {
        let now = Utc::now();
        GateRow {
            scope: scope.to_string(),
            entity_id: entity_id.to_string(),
            enabled,
            reason: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of gate mutation recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Enable,
    Disable,
    ClearScope,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateAction::Enable => "enable",
            GateAction::Disable => "disable",
            GateAction::ClearScope => "clear_scope",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enable" => Some(GateAction::Enable),
            "disable" => Some(GateAction::Disable),
            "clear_scope" => Some(GateAction::ClearScope),
            _ => None,
        }
    }
}

/// Append-only record of a gate mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateHistoryEntry {
    pub id: i64,
    pub scope: String,
    pub entity_id: Option<String>,
    pub action: GateAction,
    pub reason: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
}
