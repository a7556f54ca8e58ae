//! Composition root: shared services plus the set of deployed graphs
use crate::context::ContextRegistry;
use crate::edt::{EdtMemory, GateService};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::events::EventBus;
use crate::graph::{Graph, GraphSpec, Operator, OperatorRegistry, NodeSpec};
use crate::kv::{ScopedKvStore, MAX_SWEEP_INTERVAL_SECS};
use crate::registry::{InstanceRegistry, RegistryConfig};
use crate::store::SqliteTaskStore;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Upper bound on descriptor discovery sampling
pub const MAX_DISCOVERY_INTERVAL: Duration = Duration::from_millis(1000);

/// Upper bound on cancellation polling during delays
pub const MAX_CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables of the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub kv_default_ttl: Duration,
    pub kv_sweep_interval: Duration,
    pub discovery_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub terminal_retry_attempts: u32,
    pub terminal_retry_base: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            kv_default_ttl: Duration::from_secs(3600),
            kv_sweep_interval: Duration::from_secs(60),
            discovery_interval: Duration::from_millis(500),
            cancel_poll_interval: Duration::from_millis(50),
            terminal_retry_attempts: 5,
            terminal_retry_base: Duration::from_millis(50),
        }
    }
}

fn clamp(value: Duration, max: Duration) -> Duration {
    value.clamp(Duration::from_millis(1), max)
}

impl RuntimeConfig {
    pub fn discovery_interval(&self) -> Duration {
        clamp(self.discovery_interval, MAX_DISCOVERY_INTERVAL)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        clamp(self.cancel_poll_interval, MAX_CANCEL_POLL_INTERVAL)
    }

    /// Per-node override, still bounded by the cap
    pub fn cancel_poll_interval_with(&self, override_ms: Option<u64>) -> Duration {
        match override_ms {
            Some(ms) => clamp(Duration::from_millis(ms), MAX_CANCEL_POLL_INTERVAL),
            None => self.cancel_poll_interval(),
        }
    }

    pub fn kv_sweep_interval(&self) -> Duration {
        clamp(
            self.kv_sweep_interval,
            Duration::from_secs(MAX_SWEEP_INTERVAL_SECS),
        )
    }
}

/// Process-wide dependencies handed to every operator
pub struct RuntimeServices {
    pub store: Arc<SqliteTaskStore>,
    pub bus: Arc<EventBus>,
    pub contexts: Arc<ContextRegistry>,
    pub registry: Arc<InstanceRegistry>,
    pub kv: Arc<ScopedKvStore>,
    pub gates: Arc<GateService>,
    pub memory: Arc<EdtMemory>,
    pub config: RuntimeConfig,
}

impl RuntimeServices {
    pub fn new(store: Arc<SqliteTaskStore>, config: RuntimeConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let contexts = Arc::new(ContextRegistry::new());
        let ttl = chrono::Duration::from_std(config.kv_default_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(crate::kv::DEFAULT_TTL_SECS));
        let kv = Arc::new(ScopedKvStore::with_default_ttl(ttl));
        let registry = Arc::new(InstanceRegistry::new(
            store.clone(),
            bus.clone(),
            contexts.clone(),
            kv.clone(),
            RegistryConfig {
                terminal_retry_attempts: config.terminal_retry_attempts,
                terminal_retry_base: config.terminal_retry_base,
            },
        ));
        let gates = Arc::new(GateService::new(store.clone(), bus.clone()));

        RuntimeServices {
            store,
            bus,
            contexts,
            registry,
            kv,
            gates,
            memory: Arc::new(EdtMemory::new()),
            config,
        }
    }
}

/// Deployed graphs sharing one set of services
pub struct Runtime {
    services: Arc<RuntimeServices>,
    operators: OperatorRegistry,
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Runtime with the built-in operators. Must be called inside a tokio
    /// runtime: the key/value sweeper starts immediately.
    pub fn new(store: Arc<SqliteTaskStore>, config: RuntimeConfig) -> Self {
        Self::with_operators(store, config, OperatorRegistry::with_builtins())
    }

    pub fn with_operators(
        store: Arc<SqliteTaskStore>,
        config: RuntimeConfig,
        operators: OperatorRegistry,
    ) -> Self {
        let services = Arc::new(RuntimeServices::new(store, config));
        let sweeper = services
            .kv
            .spawn_sweeper(services.config.kv_sweep_interval());

        Runtime {
            services,
            operators,
            graphs: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Open the store at `db_path` and build a runtime on it
    pub async fn init<P: AsRef<Path>>(
        db_path: P,
        max_connections: u32,
        config: RuntimeConfig,
    ) -> WorkflowResult<Self> {
        let store = Arc::new(SqliteTaskStore::new(db_path, max_connections).await?);
        Ok(Self::new(store, config))
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.services.registry
    }

    pub fn store(&self) -> &Arc<SqliteTaskStore> {
        &self.services.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn gates(&self) -> &Arc<GateService> {
        &self.services.gates
    }

    /// Add an operator type; affects later deploys only
    pub fn register_operator<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&NodeSpec) -> WorkflowResult<Arc<dyn Operator>> + Send + Sync + 'static,
    {
        self.operators.register(kind, factory);
    }

    /// Deploy a graph, replacing any graph with the same id
    pub async fn deploy(&self, spec: GraphSpec) -> WorkflowResult<Arc<Graph>> {
        if self.graphs.read().contains_key(&spec.id) {
            self.undeploy(&spec.id);
        }
        let graph = Arc::new(Graph::build(spec, &self.operators, self.services.clone()).await?);
        self.graphs
            .write()
            .insert(graph.id().to_string(), graph.clone());
        Ok(graph)
    }

    pub async fn deploy_file<P: AsRef<Path>>(&self, path: P) -> WorkflowResult<Arc<Graph>> {
        let spec = GraphSpec::from_file(path.as_ref())?;
        info!("Deploying {} from {}", spec.id, path.as_ref().display());
        self.deploy(spec).await
    }

    /// Stop a graph and forget its descriptors
    pub fn undeploy(&self, graph_id: &str) -> bool {
        let removed = self.graphs.write().remove(graph_id);
        match removed {
            Some(graph) => {
                graph.stop();
                self.services.contexts.drop_context(graph_id);
                info!("Undeployed graph {}", graph_id);
                true
            }
            None => false,
        }
    }

    pub fn graph(&self, graph_id: &str) -> WorkflowResult<Arc<Graph>> {
        self.graphs
            .read()
            .get(graph_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("graph {}", graph_id)))
    }

    pub fn graph_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graphs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every graph and background task
    pub fn shutdown(&self) {
        for graph_id in self.graph_ids() {
            self.undeploy(&graph_id);
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.services.bus.close();
        info!("Runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals_are_capped() {
        let config = RuntimeConfig {
            discovery_interval: Duration::from_secs(10),
            cancel_poll_interval: Duration::from_secs(1),
            kv_sweep_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        assert_eq!(config.discovery_interval(), MAX_DISCOVERY_INTERVAL);
        assert_eq!(config.cancel_poll_interval(), MAX_CANCEL_POLL_INTERVAL);
        assert_eq!(config.kv_sweep_interval(), Duration::from_secs(300));
        assert_eq!(
            config.cancel_poll_interval_with(Some(20)),
            Duration::from_millis(20)
        );
    }

    #[tokio::test]
    async fn test_deploy_registers_definition_and_undeploy() {
        let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
        let runtime = Runtime::new(store.clone(), RuntimeConfig::default());

        let spec = GraphSpec::from_json(
            r#"{"id": "g1", "nodes": [
                {"id": "start", "type": "task-package-start",
                 "config": {"definition_id": "tp01", "display_name": "Room cleaning"},
                 "wires": [["end"]]},
                {"id": "end", "type": "task-package-end"}
            ]}"#,
        )
        .unwrap();
        runtime.deploy(spec).await.unwrap();

        let definition = store.get_definition("tp01").await.unwrap().unwrap();
        assert_eq!(definition.display_name, "Room cleaning");
        assert_eq!(runtime.graph_ids(), vec!["g1".to_string()]);

        assert!(runtime.undeploy("g1"));
        assert!(runtime.graph("g1").is_err());
        assert!(!runtime.undeploy("g1"));
    }

    #[tokio::test]
    async fn test_too_many_wires_rejected() {
        let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
        let runtime = Runtime::new(store, RuntimeConfig::default());
        let spec = GraphSpec::from_json(
            r#"{"id": "g", "nodes": [
                {"id": "c", "type": "task-package-cancel-check", "wires": [["e"], ["e"], ["e"]]},
                {"id": "e", "type": "task-package-end"}
            ]}"#,
        )
        .unwrap();
        assert!(runtime.deploy(spec).await.is_err());
    }
}
