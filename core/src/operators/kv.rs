//! Set/get operators over the instance-scoped key/value store
use crate::errors::{WorkflowError, WorkflowResult};
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::FlowMessage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SET_KIND: &str = "task-package-kv-set";
pub const GET_KIND: &str = "task-package-kv-get";

fn default_output_field() -> String {
    "kv".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KvSetConfig {
    /// Overrides the store default
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub struct KvSetOperator {
    config: KvSetConfig,
}

impl KvSetOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        let config: KvSetConfig = spec.parse_config()?;
        if matches!(config.ttl_secs, Some(ttl) if ttl <= 0) {
            return Err(WorkflowError::Config(format!(
                "node {}: ttl_secs must be positive",
                spec.id
            )));
        }
        Ok(KvSetOperator { config })
    }
}

#[async_trait]
impl Operator for KvSetOperator {
    fn kind(&self) -> &'static str {
        SET_KIND
    }

    async fn on_message(
        &self,
        message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let instance_id = ctx.require_instance(&message)?;
        let metadata = self
            .config
            .metadata
            .clone()
            .unwrap_or_else(|| json!({ "node_id": ctx.node_id, "topic": message.topic }));

        ctx.services.kv.set(
            instance_id,
            message.payload.clone(),
            metadata,
            self.config.ttl_secs.map(chrono::Duration::seconds),
        );
        Ok(vec![(0, message)])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvGetConfig {
    /// Fail (failure port 1) instead of writing `null`
    #[serde(default)]
    pub fail_on_missing: bool,
    /// Top-level message field receiving the entry
    #[serde(default = "default_output_field")]
    pub output_field: String,
}

pub struct KvGetOperator {
    config: KvGetConfig,
}

impl KvGetOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(KvGetOperator {
            config: spec.parse_config()?,
        })
    }
}

#[async_trait]
impl Operator for KvGetOperator {
    fn kind(&self) -> &'static str {
        GET_KIND
    }

    fn outputs(&self) -> usize {
        2
    }

    fn failure_port(&self) -> Option<usize> {
        Some(1)
    }

    async fn on_message(
        &self,
        mut message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let instance_id = ctx.require_instance(&message)?.to_string();

        let value = match ctx.services.kv.get(&instance_id) {
            Some(entry) => serde_json::to_value(entry)?,
            None if self.config.fail_on_missing => {
                return Err(WorkflowError::NotFound(format!(
                    "no stored value for {}",
                    instance_id
                )))
            }
            None => Value::Null,
        };
        message.set_field(&self.config.output_field, value);
        Ok(vec![(0, message)])
    }
}
