//! Per-instance cancellation router
//!
//! Keeps one `cancel/<instance_id>` subscription per live descriptor of the
//! graph. Descriptors are discovered by sampling the graph context; a
//! descriptor already flagged when first seen is routed immediately, so a
//! cancel published before the subscription existed is never lost.

use crate::context::ActiveTask;
use crate::errors::WorkflowResult;
use crate::events::topics;
use crate::graph::{NodeContext, NodeSpec, Operator};
use crate::message::FlowMessage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const KIND: &str = "task-package-cancel";

pub const CANCEL_REASON: &str = "cancelled";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRouterConfig {
    /// Only route descriptors of this definition; all when absent
    #[serde(default)]
    pub definition_id: Option<String>,
}

pub struct CancelRouterOperator {
    config: CancelRouterConfig,
}

impl CancelRouterOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(CancelRouterOperator {
            config: spec.parse_config()?,
        })
    }
}

#[async_trait]
impl Operator for CancelRouterOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&self, ctx: &NodeContext) -> WorkflowResult<Vec<JoinHandle<()>>> {
        let ctx = ctx.clone();
        let filter = self.config.definition_id.clone();
        Ok(vec![tokio::spawn(discovery_loop(ctx, filter))])
    }
}

struct Watch {
    handle: JoinHandle<()>,
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn discovery_loop(ctx: NodeContext, filter: Option<String>) {
    let interval = ctx.services.config.discovery_interval();
    let mut ticker = tokio::time::interval(interval);
    let mut watches: HashMap<String, Watch> = HashMap::new();

    loop {
        ticker.tick().await;

        let live: Vec<ActiveTask> = ctx
            .graph
            .snapshot()
            .into_iter()
            .filter(|task| {
                filter
                    .as_deref()
                    .map_or(true, |def| task.definition_id == def)
            })
            .collect();

        // Vanished descriptors: dropping the watch aborts its subscription
        watches.retain(|instance_id, _| live.iter().any(|t| &t.instance_id == instance_id));

        for task in live {
            if watches.contains_key(&task.instance_id) {
                continue;
            }
            let handle = if task.cancelled {
                debug!("{}: {} was cancelled before discovery", ctx.node_id, task.instance_id);
                let ctx = ctx.clone();
                let instance_id = task.instance_id.clone();
                tokio::spawn(async move {
                    route(&ctx, &instance_id, json!({ "instance_id": instance_id })).await
                })
            } else {
                watch(ctx.clone(), task.instance_id.clone())
            };
            watches.insert(task.instance_id, Watch { handle });
        }
    }
}

/// Wait for one cancel event of an instance
fn watch(ctx: NodeContext, instance_id: String) -> JoinHandle<()> {
    let mut sub = ctx.services.bus.subscribe_topic(topics::cancel(&instance_id));
    tokio::spawn(async move {
        // The flag may have been set between sampling and subscribing
        if ctx.is_cancelled(&instance_id) {
            route(&ctx, &instance_id, json!({ "instance_id": instance_id })).await;
            return;
        }
        if let Some(event) = sub.recv().await {
            ctx.graph.mark_cancelled(&instance_id);
            route(&ctx, &instance_id, event.data).await;
        }
    })
}

async fn route(ctx: &NodeContext, instance_id: &str, payload: Value) {
    let context = match ctx.workflow_context(instance_id).await {
        Ok(context) => context,
        Err(e) => {
            warn!("{}: cannot route cancel of {}: {}", ctx.node_id, instance_id, e);
            return;
        }
    };
    info!("{}: routing cancellation of {}", ctx.node_id, instance_id);
    let message = FlowMessage::new(topics::cancel(instance_id), payload)
        .with_context(context)
        .into_cleanup(CANCEL_REASON);
    ctx.emit(0, message);
}
