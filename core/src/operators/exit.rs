//! Workflow exit point: picks and persists the terminal state
use crate::errors::WorkflowResult;
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::FlowMessage;
use crate::registry::TerminalRequest;
use async_trait::async_trait;
use tracing::debug;

pub const KIND: &str = "task-package-end";

pub struct ExitOperator;

impl ExitOperator {
    pub fn from_spec(_spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(ExitOperator)
    }
}

#[async_trait]
impl Operator for ExitOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn outputs(&self) -> usize {
        0
    }

    async fn on_message(
        &self,
        message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let instance_id = ctx.require_instance(&message)?;

        let request = match &message.error {
            Some(error) => TerminalRequest::Failure(error.clone()),
            None => TerminalRequest::Exit {
                cancelled: ctx.is_cancelled(instance_id),
            },
        };

        let instance = ctx.services.registry.finish(instance_id, request).await?;
        ctx.graph.remove(instance_id);
        debug!(
            "{}: {} ended as {}",
            ctx.node_id, instance_id, instance.lifecycle_status
        );
        Ok(Vec::new())
    }
}
