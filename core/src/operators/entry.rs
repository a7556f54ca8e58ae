//! Workflow entry point: turns `create/<definition_id>` events into messages
use crate::context::ActiveTask;
use crate::errors::WorkflowResult;
use crate::events::topics;
use crate::graph::{NodeContext, NodeSpec, Operator};
use crate::message::{FlowMessage, WorkflowContext};
use crate::registry::StartEvent;
use crate::state_machine::LifecycleStatus;
use crate::types::PayloadSchema;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const KIND: &str = "task-package-start";

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    pub definition_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub form_path: Option<String>,
    #[serde(default)]
    pub payload_schema: Option<PayloadSchema>,
}

pub struct EntryOperator {
    config: EntryConfig,
}

impl EntryOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        let config: EntryConfig = spec.parse_config()?;
        if config.definition_id.trim().is_empty() {
            return Err(crate::errors::WorkflowError::Config(format!(
                "node {}: definition_id is empty",
                spec.id
            )));
        }
        Ok(EntryOperator { config })
    }

    fn display_name(&self) -> &str {
        self.config
            .display_name
            .as_deref()
            .unwrap_or(&self.config.definition_id)
    }
}

#[async_trait]
impl Operator for EntryOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    /// Register (or refresh) the definition this entry serves
    async fn deploy(&self, ctx: &NodeContext) -> WorkflowResult<()> {
        ctx.services
            .store
            .upsert_definition(
                &self.config.definition_id,
                self.display_name(),
                self.config.form_path.as_deref(),
                self.config.payload_schema.as_ref(),
            )
            .await?;
        info!(
            "{} serves definition {} in graph {}",
            ctx.node_id,
            self.config.definition_id,
            ctx.graph_id()
        );
        Ok(())
    }

    fn start(&self, ctx: &NodeContext) -> WorkflowResult<Vec<JoinHandle<()>>> {
        let mut sub = ctx
            .services
            .bus
            .subscribe_topic(topics::create(&self.config.definition_id));
        let ctx = ctx.clone();
        let schema = self.config.payload_schema.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let start: StartEvent = match serde_json::from_value(event.data) {
                    Ok(start) => start,
                    Err(e) => {
                        warn!("{}: malformed start event: {}", ctx.node_id, e);
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let schema = schema.clone();
                tokio::spawn(async move { accept(ctx, schema, start).await });
            }
            debug!("{}: create subscription closed", ctx.node_id);
        });

        Ok(vec![handle])
    }
}

async fn accept(ctx: NodeContext, schema: Option<PayloadSchema>, start: StartEvent) {
    let registry = &ctx.services.registry;

    if let Some(schema) = &schema {
        if let Err(e) = schema.validate(&start.payload) {
            warn!("{}: payload of {} rejected: {}", ctx.node_id, start.instance_id, e);
            if let Err(fail_err) = registry.fail(&start.instance_id, &e.to_string()).await {
                warn!("Could not mark {} failed: {}", start.instance_id, fail_err);
            }
            return;
        }
    }

    let instance = match registry.get(&start.instance_id).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!("{}: {}", ctx.node_id, e);
            return;
        }
    };

    // The descriptor must exist before anything downstream sees the message
    if !ctx.graph.register(ActiveTask::new(
        &instance.instance_id,
        &instance.definition_id,
        &instance.cached_display_name,
    )) {
        debug!("{}: {} already registered", ctx.node_id, instance.instance_id);
        return;
    }

    let instance = match registry.mark_started(&instance.instance_id).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!("{}: cannot start {}: {}", ctx.node_id, start.instance_id, e);
            ctx.graph.remove(&start.instance_id);
            return;
        }
    };

    if instance.lifecycle_status == LifecycleStatus::Cancelling {
        ctx.graph.mark_cancelled(&instance.instance_id);
    }

    debug!("{}: started {}", ctx.node_id, instance.instance_id);
    let message = FlowMessage::new(topics::create(&instance.definition_id), start.payload)
        .with_context(WorkflowContext::from(&instance));
    ctx.emit(0, message);
}
