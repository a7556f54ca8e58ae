//! Non-blocking cancellation check point
use crate::errors::WorkflowResult;
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::FlowMessage;
use crate::operators::cancel_router::CANCEL_REASON;
use async_trait::async_trait;
use serde::Deserialize;

pub const KIND: &str = "task-package-cancel-check";

pub const PROCEED: usize = 0;
pub const CANCELLED: usize = 1;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelCheckConfig {
    /// Mark the instance `ongoing` when it passes the check
    #[serde(default)]
    pub report_progress: bool,
}

pub struct CancelCheckOperator {
    config: CancelCheckConfig,
}

impl CancelCheckOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(CancelCheckOperator {
            config: spec.parse_config()?,
        })
    }
}

#[async_trait]
impl Operator for CancelCheckOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn outputs(&self) -> usize {
        2
    }

    async fn on_message(
        &self,
        mut message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        if message.is_cleanup() {
            return Ok(vec![(PROCEED, message)]);
        }
        let instance_id = ctx.require_instance(&message)?;
        if ctx.is_cancelled(instance_id) {
            return Ok(vec![(CANCELLED, message.into_cleanup(CANCEL_REASON))]);
        }
        if self.config.report_progress {
            ctx.report_progress(&mut message).await;
        }
        Ok(vec![(PROCEED, message)])
    }
}
