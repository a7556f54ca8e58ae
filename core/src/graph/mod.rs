//! Graph runtime: wires operators together and delivers messages
//!
//! Every delivery of a message to a node runs as its own task, so a node
//! suspended on one instance never holds up another.

pub mod operator;
pub mod spec;

pub use operator::{Emitter, NodeContext, Operator, OperatorFactory, OperatorRegistry, Output};
pub use spec::{GraphSpec, NodeSpec};

use crate::context::GraphContext;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::message::FlowMessage;
use crate::runtime::RuntimeServices;
use operator::Dispatch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Node {
    spec: NodeSpec,
    operator: Arc<dyn Operator>,
    ctx: NodeContext,
}

/// A deployed graph
pub struct Graph {
    spec: GraphSpec,
    context: Arc<GraphContext>,
    emitter: Emitter,
    nodes: Arc<HashMap<String, Node>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Graph {
    /// Build every node, run their deploy hooks and start the dispatcher
    pub(crate) async fn build(
        spec: GraphSpec,
        registry: &OperatorRegistry,
        services: Arc<RuntimeServices>,
    ) -> WorkflowResult<Graph> {
        spec.validate()?;

        let context = services.contexts.context(&spec.id);
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Emitter::new(tx);

        let mut nodes = HashMap::new();
        for node_spec in &spec.nodes {
            let operator = registry.build(node_spec)?;
            if node_spec.wires.len() > operator.outputs() {
                return Err(WorkflowError::Config(format!(
                    "node {} ({}) has {} output(s) but {} are wired",
                    node_spec.id,
                    operator.kind(),
                    operator.outputs(),
                    node_spec.wires.len()
                )));
            }
            let ctx = NodeContext::new(
                &node_spec.id,
                context.clone(),
                services.clone(),
                emitter.clone(),
            );
            nodes.insert(
                node_spec.id.clone(),
                Node {
                    spec: node_spec.clone(),
                    operator,
                    ctx,
                },
            );
        }

        for node in nodes.values() {
            node.operator.deploy(&node.ctx).await?;
        }

        let nodes = Arc::new(nodes);
        let mut handles = vec![tokio::spawn(run_dispatcher(nodes.clone(), rx))];

        for node in nodes.values() {
            match node.operator.start(&node.ctx) {
                Ok(started) => handles.extend(started),
                Err(e) => {
                    handles.iter().for_each(JoinHandle::abort);
                    return Err(e);
                }
            }
        }

        info!("Deployed graph {} ({} nodes)", spec.id, nodes.len());
        Ok(Graph {
            spec,
            context,
            emitter,
            nodes,
            handles: Mutex::new(handles),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    /// Active-task descriptors of this graph
    pub fn context(&self) -> &Arc<GraphContext> {
        &self.context
    }

    /// Feed an external message into a node
    pub fn inject(&self, node_id: &str, message: FlowMessage) -> WorkflowResult<()> {
        if !self.nodes.contains_key(node_id) {
            return Err(WorkflowError::NotFound(format!(
                "graph {} has no node {}",
                self.spec.id, node_id
            )));
        }
        if !self.emitter.dispatch(Dispatch::Deliver {
            to: node_id.to_string(),
            message,
        }) {
            return Err(WorkflowError::Internal(format!(
                "graph {} is stopped",
                self.spec.id
            )));
        }
        Ok(())
    }

    /// Abort the dispatcher and every background task
    pub fn stop(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if !handles.is_empty() {
            info!("Stopping graph {}", self.spec.id);
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_dispatcher(
    nodes: Arc<HashMap<String, Node>>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
) {
    while let Some(dispatch) = rx.recv().await {
        match dispatch {
            Dispatch::Emit {
                from,
                port,
                message,
            } => {
                let Some(node) = nodes.get(&from) else {
                    warn!("Emit from unknown node {}", from);
                    continue;
                };
                let targets = node.spec.targets(port);
                if targets.is_empty() {
                    debug!("{} port {}: no wires, message dropped", from, port);
                    continue;
                }
                for target in targets {
                    deliver(&nodes, target, message.clone());
                }
            }
            Dispatch::Deliver { to, message } => deliver(&nodes, &to, message),
        }
    }
}

fn deliver(nodes: &HashMap<String, Node>, to: &str, message: FlowMessage) {
    let Some(node) = nodes.get(to) else {
        warn!("Delivery to unknown node {}", to);
        return;
    };
    debug!("-> {} ({})", to, node.operator.kind());
    let operator = node.operator.clone();
    let ctx = node.ctx.clone();
    tokio::spawn(async move { run_node(operator, ctx, message).await });
}

async fn run_node(operator: Arc<dyn Operator>, ctx: NodeContext, message: FlowMessage) {
    let original = message.clone();
    match operator.on_message(message, &ctx).await {
        Ok(outputs) => {
            for (port, out) in outputs {
                ctx.emit(port, out);
            }
        }
        Err(e) => handle_failure(operator.as_ref(), &ctx, original, e).await,
    }
}

/// Failure port if the operator has one, otherwise the instance fails
async fn handle_failure(
    operator: &dyn Operator,
    ctx: &NodeContext,
    message: FlowMessage,
    err: WorkflowError,
) {
    let Some(instance_id) = message.instance_id().map(str::to_string) else {
        warn!("{} ({}): {}", ctx.node_id, operator.kind(), err);
        return;
    };

    if let Some(port) = operator.failure_port() {
        debug!("{}: routing error for {} to port {}", ctx.node_id, instance_id, port);
        ctx.emit(port, message.into_error(err.to_string()));
        return;
    }

    warn!("{} failed on {}: {}", ctx.node_id, instance_id, err);
    if let Err(e) = ctx
        .services
        .registry
        .fail(&instance_id, &format!("{}: {}", ctx.node_id, err))
        .await
    {
        error!("Could not mark {} failed: {}", instance_id, e);
    }
}
