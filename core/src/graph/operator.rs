//! Operator trait, per-node context and the operator type registry
use crate::context::GraphContext;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::graph::spec::NodeSpec;
use crate::message::{FlowMessage, WorkflowContext};
use crate::runtime::RuntimeServices;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A message leaving a node on one of its output ports
pub type Output = (usize, FlowMessage);

/// Instructions for the graph dispatcher
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Route `message` along the wires of `from`'s output `port`
    Emit {
        from: String,
        port: usize,
        message: FlowMessage,
    },
    /// Hand `message` straight to node `to`
    Deliver { to: String, message: FlowMessage },
}

/// Sending half of a graph's dispatcher queue
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl Emitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Dispatch>) -> Self {
        Emitter { tx }
    }

    pub(crate) fn dispatch(&self, dispatch: Dispatch) -> bool {
        self.tx.send(dispatch).is_ok()
    }
}

/// Everything a node sees of the world
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub graph: Arc<GraphContext>,
    pub services: Arc<RuntimeServices>,
    emitter: Emitter,
}

impl NodeContext {
    pub(crate) fn new(
        node_id: &str,
        graph: Arc<GraphContext>,
        services: Arc<RuntimeServices>,
        emitter: Emitter,
    ) -> Self {
        NodeContext {
            node_id: node_id.to_string(),
            graph,
            services,
            emitter,
        }
    }

    pub fn graph_id(&self) -> &str {
        self.graph.graph_id()
    }

    /// Send a message out of one of this node's ports
    pub fn emit(&self, port: usize, message: FlowMessage) {
        if !self.emitter.dispatch(Dispatch::Emit {
            from: self.node_id.clone(),
            port,
            message,
        }) {
            debug!("{}/{}: graph stopped, message dropped", self.graph_id(), self.node_id);
        }
    }

    /// Instance id of a message, or an invariant error naming this node
    pub fn require_instance<'a>(&self, message: &'a FlowMessage) -> WorkflowResult<&'a str> {
        message.instance_id().ok_or_else(|| {
            WorkflowError::Internal(format!(
                "node {} received a message without workflow_context",
                self.node_id
            ))
        })
    }

    /// Whether the descriptor of `instance_id` in this graph is flagged
    pub fn is_cancelled(&self, instance_id: &str) -> bool {
        self.graph.is_cancelled(instance_id)
    }

    /// Opt-in `started -> ongoing`; refreshes the message's context when recorded
    pub async fn report_progress(&self, message: &mut FlowMessage) {
        let Some(instance_id) = message.instance_id().map(str::to_string) else {
            return;
        };
        if let Some(instance) = self.services.registry.mark_ongoing(&instance_id).await {
            message.workflow_context = Some(WorkflowContext::from(&instance));
        }
    }

    /// Fresh workflow context read from the store
    pub async fn workflow_context(&self, instance_id: &str) -> WorkflowResult<WorkflowContext> {
        let instance = self.services.registry.get(instance_id).await?;
        Ok(WorkflowContext::from(&instance))
    }
}

/// One processing step of a graph
///
/// Operators that produce messages on their own (listeners, routers) spawn
/// their tasks in `start`; the runtime aborts them on undeploy.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Registered type name
    fn kind(&self) -> &'static str;

    /// Number of output ports
    fn outputs(&self) -> usize {
        1
    }

    /// Port receiving error-tagged cleanup messages when `on_message` fails
    fn failure_port(&self) -> Option<usize> {
        None
    }

    /// One-time setup with access to the store, before `start`
    async fn deploy(&self, _ctx: &NodeContext) -> WorkflowResult<()> {
        Ok(())
    }

    /// Spawn background tasks
    fn start(&self, _ctx: &NodeContext) -> WorkflowResult<Vec<JoinHandle<()>>> {
        Ok(Vec::new())
    }

    /// Handle one delivered message
    async fn on_message(
        &self,
        message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        debug!("{} has no input, dropping {}", ctx.node_id, message.topic);
        Ok(Vec::new())
    }
}

/// Builds an operator from its node description
pub type OperatorFactory =
    Arc<dyn Fn(&NodeSpec) -> WorkflowResult<Arc<dyn Operator>> + Send + Sync>;

/// Type name to factory mapping
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in operator type
    pub fn with_builtins() -> Self {
        use crate::edt::{FilterOperator, ModeGateOperator, StateMemoryOperator};
        use crate::operators::*;

        let mut registry = Self::new();
        registry.register(entry::KIND, |spec| Ok(Arc::new(EntryOperator::from_spec(spec)?)));
        registry.register(exit::KIND, |spec| Ok(Arc::new(ExitOperator::from_spec(spec)?)));
        registry.register(cancel_router::KIND, |spec| {
            Ok(Arc::new(CancelRouterOperator::from_spec(spec)?))
        });
        registry.register(delay::KIND, |spec| Ok(Arc::new(DelayOperator::from_spec(spec)?)));
        registry.register(cancel_check::KIND, |spec| {
            Ok(Arc::new(CancelCheckOperator::from_spec(spec)?))
        });
        registry.register(user_status::KIND, |spec| {
            Ok(Arc::new(UserStatusOperator::from_spec(spec)?))
        });
        registry.register(kv::SET_KIND, |spec| Ok(Arc::new(KvSetOperator::from_spec(spec)?)));
        registry.register(kv::GET_KIND, |spec| Ok(Arc::new(KvGetOperator::from_spec(spec)?)));
        registry.register(update::KIND, |spec| {
            Ok(Arc::new(UpdateListenerOperator::from_spec(spec)?))
        });
        registry.register(trigger::KIND, |spec| {
            Ok(Arc::new(TriggerOperator::from_spec(spec)?))
        });
        registry.register(crate::edt::state_memory::KIND, |spec| {
            Ok(Arc::new(StateMemoryOperator::from_spec(spec)?))
        });
        registry.register(crate::edt::filter::KIND, |spec| {
            Ok(Arc::new(FilterOperator::from_spec(spec)?))
        });
        registry.register(crate::edt::mode_gate::KIND, |spec| {
            Ok(Arc::new(ModeGateOperator::from_spec(spec)?))
        });
        registry
    }

    /// Add or replace a type
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&NodeSpec) -> WorkflowResult<Arc<dyn Operator>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, spec: &NodeSpec) -> WorkflowResult<Arc<dyn Operator>> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            WorkflowError::Config(format!("node {}: unknown type {}", spec.id, spec.kind))
        })?;
        factory(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = OperatorRegistry::with_builtins();
        for kind in [
            "task-package-start",
            "task-package-end",
            "task-package-cancel",
            "task-package-delay",
            "task-package-cancel-check",
            "task-package-user-status",
            "task-package-kv-set",
            "task-package-kv-get",
            "task-package-update",
            "task-package-trigger",
            "edt-state",
            "edt-filter",
            "edt-mode",
        ] {
            assert!(registry.contains(kind), "missing {}", kind);
        }
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let registry = OperatorRegistry::with_builtins();
        let spec = NodeSpec::new("n1", "no-such-node", json!({}), vec![]);
        assert!(matches!(registry.build(&spec), Err(WorkflowError::Config(_))));
    }

    #[test]
    fn test_bad_config_rejected() {
        let registry = OperatorRegistry::with_builtins();
        let spec = NodeSpec::new("start", "task-package-start", json!({}), vec![]);
        assert!(registry.build(&spec).is_err());
    }
}
