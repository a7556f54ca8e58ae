/// Control-plane operations over the workflow runtime
use crate::auth::{AuthContext, IdentityGate};
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::MetricsCollector;
use crate::types::*;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use taskpack_core::{topics, CancelOutcome, Definition, GateRow, Instance, Runtime};
use tracing::{debug, info, warn};

/// Control-plane adapter; rebuilt whenever the configuration is reloaded
pub struct TaskPackageApi {
    runtime: Arc<Runtime>,
    identity: Arc<IdentityGate>,
    metrics: Arc<MetricsCollector>,
    request_timeout: Duration,
}

fn required(value: Option<String>, name: &str) -> DaemonResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| DaemonError::InvalidRequest(format!("{} is required", name)))
}

impl TaskPackageApi {
    pub fn new(
        runtime: Arc<Runtime>,
        identity: Arc<IdentityGate>,
        metrics: Arc<MetricsCollector>,
        request_timeout: Duration,
    ) -> Self {
        TaskPackageApi {
            runtime,
            identity,
            metrics,
            request_timeout,
        }
    }

    /// Open the store, deploy the configured graphs and wire the identity gate
    pub async fn from_config(
        config: &DaemonConfig,
        metrics: Arc<MetricsCollector>,
    ) -> DaemonResult<Self> {
        let identity = Arc::new(IdentityGate::new(&config.auth)?);
        match identity.userinfo_endpoint() {
            Some(endpoint) => info!("Identity provider: {}", endpoint),
            None => warn!("No identity provider configured; every caller is admin"),
        }

        let runtime = Runtime::init(
            &config.storage.db_path,
            config.storage.max_connections,
            config.runtime.to_runtime_config(),
        )
        .await
        .map_err(|e| {
            DaemonError::ConfigError(format!(
                "Cannot open store {}: {}",
                config.storage.db_path.display(),
                e
            ))
        })?;

        for path in &config.runtime.graphs {
            if let Err(e) = runtime.deploy_file(path).await {
                runtime.shutdown();
                return Err(DaemonError::ConfigError(format!(
                    "Cannot deploy {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        info!(
            "Runtime ready with {} graph(s) on {}",
            config.runtime.graphs.len(),
            config.storage.db_path.display()
        );

        Ok(Self::new(
            Arc::new(runtime),
            identity,
            metrics,
            config.request_timeout(),
        ))
    }

    /// Stop the runtime's graphs and close the store
    pub async fn shutdown(&self) {
        self.runtime.shutdown();
        self.runtime.store().close().await;
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Resolve the caller; runs before any other work of a request
    pub async fn authenticate(&self, authorization: Option<&str>) -> DaemonResult<AuthContext> {
        self.identity.authenticate(authorization).await
    }

    async fn bounded<T, F>(&self, fut: F) -> DaemonResult<T>
    where
        F: std::future::Future<Output = DaemonResult<T>>,
    {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| DaemonError::Timeout)?
    }

    async fn definition(&self, definition_id: &str) -> DaemonResult<Definition> {
        self.runtime
            .store()
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| {
                DaemonError::NotFound(format!(
                    "Task package definition not found: {}",
                    definition_id
                ))
            })
    }

    fn describe(&self, instance: Instance) -> InstanceStatus {
        let orphaned = self.runtime.registry().is_orphaned(&instance);
        InstanceStatus { instance, orphaned }
    }

    pub async fn start(
        &self,
        auth: &AuthContext,
        request: StartRequest,
    ) -> DaemonResult<StartResponse> {
        let definition_id = required(request.definition_id, "definition_id")?;
        auth.require(&definition_id)?;
        let definition = self.definition(&definition_id).await?;

        let instance = self
            .runtime
            .registry()
            .start_instance(&definition, &auth.principal, Value::Object(request.payload))
            .await?;
        self.metrics.record_start();

        Ok(StartResponse {
            instance_id: instance.instance_id,
            status: instance.lifecycle_status,
        })
    }

    pub async fn cancel(
        &self,
        auth: &AuthContext,
        request: CancelRequest,
    ) -> DaemonResult<CancelResponse> {
        let definition_id = required(request.definition_id, "definition_id")?;
        let instance_id = required(request.instance_id, "instance_id")?;
        auth.require(&definition_id)?;

        let registry = self.runtime.registry();
        let instance = registry.get(&instance_id).await?;
        if instance.definition_id != definition_id {
            return Err(DaemonError::InvalidRequest(format!(
                "Task {} does not belong to definition {}",
                instance_id, definition_id
            )));
        }

        let outcome = self
            .bounded(async {
                registry
                    .request_cancel(&instance_id)
                    .await
                    .map_err(DaemonError::from)
            })
            .await?;

        match outcome {
            CancelOutcome::Requested(instance) => {
                self.metrics.record_cancel();
                info!("{} requested cancel of {}", auth.principal, instance_id);
                Ok(CancelResponse {
                    status: instance.lifecycle_status,
                    message: None,
                })
            }
            CancelOutcome::AlreadyCancelling(instance) => {
                debug!("Cancel of {} already in progress", instance_id);
                Ok(CancelResponse {
                    status: instance.lifecycle_status,
                    message: Some(ALREADY_CANCELLING.to_string()),
                })
            }
        }
    }

    pub async fn status(
        &self,
        auth: &AuthContext,
        query: StatusQuery,
    ) -> DaemonResult<OneOrMany<InstanceStatus>> {
        if let Some(instance_id) = &query.instance_id {
            let instance = self.runtime.registry().get(instance_id).await?;
            if !auth.permits(&instance.definition_id) {
                return Err(DaemonError::Forbidden(format!(
                    "Access denied to task {}",
                    instance_id
                )));
            }
            return Ok(OneOrMany::One(self.describe(instance)));
        }

        let filter = query.to_filter()?;
        let rows = self
            .runtime
            .store()
            .list_instances(&filter)
            .await?
            .into_iter()
            .filter(|i| auth.permits(&i.definition_id))
            .map(|i| self.describe(i))
            .collect();
        Ok(OneOrMany::Many(rows))
    }

    pub async fn info(
        &self,
        auth: &AuthContext,
        query: InfoQuery,
    ) -> DaemonResult<OneOrMany<Definition>> {
        if let Some(definition_id) = &query.definition_id {
            let definition = self.definition(definition_id).await?;
            auth.require(definition_id)?;
            return Ok(OneOrMany::One(definition));
        }

        let definitions = self
            .runtime
            .store()
            .list_definitions()
            .await?
            .into_iter()
            .filter(|d| auth.permits(&d.definition_id))
            .collect();
        Ok(OneOrMany::Many(definitions))
    }

    /// Publish `update/<id>`; the fields are passed through untouched
    pub async fn update(
        &self,
        auth: &AuthContext,
        request: UpdateRequest,
    ) -> DaemonResult<UpdateResponse> {
        let target = required(
            request.instance_id.or(request.definition_id),
            "instance_id or definition_id",
        )?;
        let topic = topics::update(&target);

        let listeners = self
            .bounded(async {
                self.runtime
                    .bus()
                    .publish(topic.clone(), Value::Object(request.fields))
                    .map_err(DaemonError::from)
            })
            .await?;
        debug!("{} published {} to {} listener(s)", auth.principal, topic, listeners);

        Ok(UpdateResponse { topic, listeners })
    }

    /// Enable or disable one entity, or every entity of `entity_ids`
    pub async fn set_mode(
        &self,
        auth: &AuthContext,
        request: ModeRequest,
        enabled: bool,
    ) -> DaemonResult<ModeResponse> {
        let scope = request.scope().to_string();
        let updated_by = request
            .updated_by
            .clone()
            .unwrap_or_else(|| auth.principal.clone());
        let reason = request.reason.as_deref();
        let gates = self.runtime.gates();

        if let Some(entity_ids) = &request.entity_ids {
            if entity_ids.is_empty() {
                return Err(DaemonError::InvalidRequest(
                    "entity_ids must not be empty".to_string(),
                ));
            }
            let mut results: Vec<GateRow> = Vec::with_capacity(entity_ids.len());
            for entity_id in entity_ids {
                let row = gates
                    .set_enabled(&scope, entity_id, enabled, reason, Some(&updated_by))
                    .await?;
                results.push(row);
            }
            self.metrics.record_gate_mutations(results.len() as u64);
            return Ok(ModeResponse::Bulk(BulkModeResponse {
                count: results.len(),
                results,
            }));
        }

        let entity_id = request.entity_id.as_deref().unwrap_or(DEFAULT_ENTITY);
        let row = gates
            .set_enabled(&scope, entity_id, enabled, reason, Some(&updated_by))
            .await?;
        self.metrics.record_gate_mutations(1);
        Ok(ModeResponse::Single(row))
    }

    pub async fn mode_status(&self, query: ModeStatusQuery) -> DaemonResult<GateRow> {
        let scope = query.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        let entity_id = query.entity_id.as_deref().unwrap_or(DEFAULT_ENTITY);
        Ok(self.runtime.gates().status(scope, entity_id).await?)
    }
}
