//! Listener for `update/<instance_id>` and `update/<definition_id>` events
use crate::errors::WorkflowResult;
use crate::events::{topics, TopicFilter};
use crate::graph::{NodeContext, NodeSpec, Operator};
use crate::message::FlowMessage;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const KIND: &str = "task-package-update";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConfig {
    /// Only fan out definition-addressed updates for this definition; unset means any
    /// definition with live instances in the graph
    #[serde(default)]
    pub definition_id: Option<String>,
}

pub struct UpdateListenerOperator {
    config: UpdateConfig,
}

impl UpdateListenerOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        Ok(UpdateListenerOperator {
            config: spec.parse_config()?,
        })
    }
}

#[async_trait]
impl Operator for UpdateListenerOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn start(&self, ctx: &NodeContext) -> WorkflowResult<Vec<JoinHandle<()>>> {
        let prefix = topics::update("");
        let mut sub = ctx.services.bus.subscribe(TopicFilter::Prefix(prefix.clone()));
        let ctx = ctx.clone();
        let definition_id = self.config.definition_id.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let target = &event.topic[prefix.len()..];

                // One message per addressed live instance of this graph
                let instances: Vec<String> = if ctx.graph.contains(target) {
                    vec![target.to_string()]
                } else if definition_id.as_deref().map_or(true, |d| d == target) {
                    ctx.graph
                        .snapshot()
                        .into_iter()
                        .filter(|task| task.definition_id == target)
                        .map(|task| task.instance_id)
                        .collect()
                } else {
                    continue;
                };

                for instance_id in instances {
                    match ctx.workflow_context(&instance_id).await {
                        Ok(context) => {
                            debug!("{}: update for {}", ctx.node_id, instance_id);
                            let message = FlowMessage::new(event.topic.clone(), event.data.clone())
                                .with_context(context);
                            ctx.emit(0, message);
                        }
                        Err(e) => warn!("{}: update for {} dropped: {}", ctx.node_id, instance_id, e),
                    }
                }
            }
        });

        Ok(vec![handle])
    }
}
