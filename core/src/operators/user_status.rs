//! Writes the free-form `user_status` of an instance
use crate::errors::{WorkflowError, WorkflowResult};
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::{FlowMessage, WorkflowContext};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

pub const KIND: &str = "task-package-user-status";

fn default_field() -> String {
    "payload.user_status".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserStatusConfig {
    /// Fixed text; wins over `field`
    #[serde(default)]
    pub status: Option<String>,
    /// Message path holding the text
    #[serde(default = "default_field")]
    pub field: String,
}

pub struct UserStatusOperator {
    config: UserStatusConfig,
}

impl UserStatusOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(UserStatusOperator {
            config: spec.parse_config()?,
        })
    }

    fn resolve(&self, message: &FlowMessage) -> WorkflowResult<String> {
        if let Some(status) = &self.config.status {
            return Ok(status.clone());
        }
        match message.field(&self.config.field) {
            Some(Value::String(s)) => Ok(s),
            Some(Value::Null) | None => Err(WorkflowError::Validation(format!(
                "no user status at {}",
                self.config.field
            ))),
            Some(other) => Ok(other.to_string()),
        }
    }
}

#[async_trait]
impl Operator for UserStatusOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn on_message(
        &self,
        mut message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        // Only the nested workflow_context identifies the instance
        let instance_id = ctx.require_instance(&message)?.to_string();
        let status = self.resolve(&message)?;

        let instance = ctx
            .services
            .registry
            .set_user_status(&instance_id, &status)
            .await?;
        message.workflow_context = Some(WorkflowContext::from(&instance));
        Ok(vec![(0, message)])
    }
}
