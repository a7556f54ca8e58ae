//! Starts a workflow from a message that passed the event-driven gate
use crate::errors::{WorkflowError, WorkflowResult};
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::FlowMessage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

pub const KIND: &str = "task-package-trigger";

/// Principal recorded on instances started by the event-driven gate
pub const TRIGGER_PRINCIPAL: &str = "edt";

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub definition_id: String,
}

pub struct TriggerOperator {
    config: TriggerConfig,
}

impl TriggerOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(TriggerOperator {
            config: spec.parse_config()?,
        })
    }
}

#[async_trait]
impl Operator for TriggerOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn on_message(
        &self,
        mut message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let definition = ctx
            .services
            .store
            .get_definition(&self.config.definition_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!(
                    "Definition not found: {}",
                    self.config.definition_id
                ))
            })?;

        let instance = ctx
            .services
            .registry
            .start_instance(&definition, TRIGGER_PRINCIPAL, message.payload.clone())
            .await?;
        info!(
            "{}: started {} for {}",
            ctx.node_id, instance.instance_id, definition.definition_id
        );

        message.set_field("instance_id", Value::String(instance.instance_id));
        Ok(vec![(0, message)])
    }
}
