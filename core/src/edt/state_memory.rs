//! State memoriser: remembers the last value per entity and flags changes
use crate::edt::memory::BOOKKEEPING_FIELDS;
use crate::edt::DEFAULT_ENTITY_FIELD;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::{lookup, value_to_key, FlowMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

pub const KIND: &str = "edt-state";

fn default_entity_field() -> String {
    DEFAULT_ENTITY_FIELD.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateMemoryConfig {
    /// Defaults to the node id
    #[serde(default)]
    pub memory_name: Option<String>,
    #[serde(default = "default_entity_field")]
    pub entity_id_field: String,
    /// Paths relative to `payload`; the whole payload when absent
    #[serde(default)]
    pub tracked_fields: Option<Vec<String>>,
}

pub struct StateMemoryOperator {
    memory_name: String,
    config: StateMemoryConfig,
}

impl StateMemoryOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        let config: StateMemoryConfig = spec.parse_config()?;
        Ok(StateMemoryOperator {
            memory_name: config.memory_name.clone().unwrap_or_else(|| spec.id.clone()),
            config,
        })
    }

    pub fn memory_name(&self) -> &str {
        &self.memory_name
    }
}

/// The part of a payload that makes up an entity's state
pub fn extract_state(payload: &Value, tracked_fields: Option<&[String]>) -> Value {
    match tracked_fields {
        Some(fields) => Value::Object(
            fields
                .iter()
                .map(|field| {
                    let value = lookup(payload, field).cloned().unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect::<Map<String, Value>>(),
        ),
        None => match payload {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !BOOKKEEPING_FIELDS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other.clone(),
        },
    }
}

#[async_trait]
impl Operator for StateMemoryOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn on_message(
        &self,
        mut message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let entity_id = message
            .field(&self.config.entity_id_field)
            .as_ref()
            .and_then(value_to_key)
            .ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "no entity id at {}",
                    self.config.entity_id_field
                ))
            })?;

        let state = extract_state(&message.payload, self.config.tracked_fields.as_deref());
        let observation = ctx.services.memory.observe(&self.memory_name, &entity_id, state);

        message.set_field("entity_id", json!(entity_id));
        message.set_field(
            "previous_state",
            observation
                .previous
                .as_ref()
                .map(|p| p.state.clone())
                .unwrap_or(Value::Null),
        );
        message.set_field("current_state", observation.current.state.clone());
        message.set_field("state_changed", json!(observation.state_changed));
        message.set_field("last_state_change", json!(observation.current.last_state_change));
        message.set_field("update_count", json!(observation.current.update_count));
        message.set_field("last_updated", json!(observation.current.last_updated));
        Ok(vec![(0, message)])
    }
}
