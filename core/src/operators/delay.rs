//! Guarded delay: sleeps, waking early when the instance is cancelled
use crate::errors::WorkflowResult;
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::FlowMessage;
use crate::operators::cancel_router::CANCEL_REASON;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const KIND: &str = "task-package-delay";

pub const PROCEED: usize = 0;
pub const CANCELLED: usize = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct DelayConfig {
    pub delay_ms: u64,
    /// Overrides the runtime poll interval (still capped at 100 ms)
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Mark the instance `ongoing` when the delay elapses
    #[serde(default)]
    pub report_progress: bool,
}

pub struct DelayOperator {
    config: DelayConfig,
}

impl DelayOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(DelayOperator {
            config: spec.parse_config()?,
        })
    }
}

#[async_trait]
impl Operator for DelayOperator {
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
        let duration = Duration::from_millis(self.config.delay_ms);

        if message.is_cleanup() {
            tokio::time::sleep(duration).await;
            return Ok(vec![(PROCEED, message)]);
        }

        let instance_id = ctx.require_instance(&message)?.to_string();
        let poll = ctx
            .services
            .config
            .cancel_poll_interval_with(self.config.poll_interval_ms);
        let deadline = Instant::now() + duration;

        loop {
            if ctx.is_cancelled(&instance_id) {
                debug!("{}: {} cancelled during delay", ctx.node_id, instance_id);
                return Ok(vec![(CANCELLED, message.into_cleanup(CANCEL_REASON))]);
            }
            let now = Instant::now();
            if now >= deadline {
                if self.config.report_progress {
                    ctx.report_progress(&mut message).await;
                }
                return Ok(vec![(PROCEED, message)]);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}
