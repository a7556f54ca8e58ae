//! Instance registry: the authoritative view of live workflow instances
//!
//! Owns lifecycle transitions (through the state machine), the cancel
//! fan-out and terminal bookkeeping. Persistence happens before any bus
//! emission so listeners that read the store see the new state.

use crate::context::ContextRegistry;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::events::{topics, EventBus};
use crate::kv::ScopedKvStore;
use crate::state_machine::{LifecycleStatus, TransitionEvent};
use crate::store::SqliteTaskStore;
use crate::types::{Definition, Instance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Concurrent writers may race a compare-and-set this many times
const MAX_CAS_ATTEMPTS: usize = 4;

/// Body of a `create/<definition_id>` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartEvent {
    pub instance_id: String,
    pub definition_id: String,
    pub principal: String,
    pub payload: Value,
}

/// Result of a cancel request
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// Instance moved to `cancelling` by this call
    Requested(Instance),
    /// Instance was already `cancelling`; nothing changed
    AlreadyCancelling(Instance),
}

/// How an instance ends
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalRequest {
    /// Reached the exit operator; `cancelled` reflects the descriptor flag
    Exit { cancelled: bool },
    /// Unrecoverable error
    Failure(String),
}

/// Retry policy for terminal persistence
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub terminal_retry_attempts: u32,
    pub terminal_retry_base: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            terminal_retry_attempts: 5,
            terminal_retry_base: Duration::from_millis(50),
        }
    }
}

pub struct InstanceRegistry {
    store: Arc<SqliteTaskStore>,
    bus: Arc<EventBus>,
    contexts: Arc<ContextRegistry>,
    kv: Arc<ScopedKvStore>,
    config: RegistryConfig,
    started_at: DateTime<Utc>,
}

impl InstanceRegistry {
    pub fn new(
        store: Arc<SqliteTaskStore>,
        bus: Arc<EventBus>,
        contexts: Arc<ContextRegistry>,
        kv: Arc<ScopedKvStore>,
        config: RegistryConfig,
    ) -> Self {
        InstanceRegistry {
            store,
            bus,
            contexts,
            kv,
            config,
            started_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &Arc<SqliteTaskStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn contexts(&self) -> &Arc<ContextRegistry> {
        &self.contexts
    }

    /// Load an instance or fail with `NotFound`
    pub async fn get(&self, instance_id: &str) -> WorkflowResult<Instance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Task not found: {}", instance_id)))
    }

    /// Whether a graph currently holds a descriptor for the instance
    pub fn is_live(&self, instance_id: &str) -> bool {
        self.contexts.is_live(instance_id)
    }

    /// Non-terminal, not live, and created before this process started
    pub fn is_orphaned(&self, instance: &Instance) -> bool {
        !instance.lifecycle_status.is_terminal()
            && instance.created_at < self.started_at
            && !self.is_live(&instance.instance_id)
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    /// Insert a `created` row and publish `create/<definition_id>`
    pub async fn start_instance(
        &self,
        definition: &Definition,
        principal: &str,
        payload: Value,
    ) -> WorkflowResult<Instance> {
        let now = Utc::now();
        let instance = Instance {
            instance_id: Uuid::new_v4().to_string(),
            definition_id: definition.definition_id.clone(),
            cached_display_name: definition.display_name.clone(),
            principal: principal.to_string(),
            lifecycle_status: LifecycleStatus::Created,
            user_status: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_instance(&instance).await?;

        let event = StartEvent {
            instance_id: instance.instance_id.clone(),
            definition_id: instance.definition_id.clone(),
            principal: instance.principal.clone(),
            payload,
        };

        if let Err(e) = self
            .bus
            .publish(topics::create(&instance.definition_id), serde_json::to_value(&event)?)
        {
            error!(
                "Failed to publish start of {}: {}",
                instance.instance_id, e
            );
            if let Err(fail_err) = self
                .finish(&instance.instance_id, TerminalRequest::Failure(e.to_string()))
                .await
            {
                warn!("Could not mark {} failed: {}", instance.instance_id, fail_err);
            }
            return Err(WorkflowError::ProviderUnavailable(e.to_string()));
        }

        info!(
            "Created instance {} of {} for {}",
            instance.instance_id, instance.definition_id, instance.principal
        );
        Ok(instance)
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Apply an event through the state machine with compare-and-set
    pub async fn transition(
        &self,
        instance_id: &str,
        event: TransitionEvent,
    ) -> WorkflowResult<Instance> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let instance = self.get(instance_id).await?;
            let current = instance.lifecycle_status;
            let next = current.apply(event)?;
            if next == current {
                return Ok(instance);
            }

            if self
                .store
                .compare_and_set_status(instance_id, current, next)
                .await?
            {
                debug!("{}: {} -> {} ({})", instance_id, current, next, event);
                return self.get(instance_id).await;
            }
        }

        Err(WorkflowError::Internal(format!(
            "{}: status kept changing while applying {}",
            instance_id, event
        )))
    }

    /// Entry operator picked the instance up. A `cancelling` instance stays
    /// `cancelling`; the caller flags its descriptor instead.
    pub async fn mark_started(&self, instance_id: &str) -> WorkflowResult<Instance> {
        let instance = self.get(instance_id).await?;
        match instance.lifecycle_status {
            LifecycleStatus::Created => {
                self.transition(instance_id, TransitionEvent::EntryReceived)
                    .await
            }
            LifecycleStatus::Cancelling
            | LifecycleStatus::Started
            | LifecycleStatus::Ongoing => Ok(instance),
            status => Err(WorkflowError::StateConflict {
                message: format!("Task {} already finished", instance_id),
                current_status: status,
            }),
        }
    }

    /// Best-effort `started -> ongoing`
    pub async fn mark_ongoing(&self, instance_id: &str) -> Option<Instance> {
        match self.get(instance_id).await {
            Ok(instance) if instance.lifecycle_status == LifecycleStatus::Started => {
                match self.transition(instance_id, TransitionEvent::Progress).await {
                    Ok(updated) => Some(updated),
                    Err(e) => {
                        debug!("Progress of {} not recorded: {}", instance_id, e);
                        None
                    }
                }
            }
            Ok(instance) => Some(instance),
            Err(e) => {
                debug!("Progress of {} not recorded: {}", instance_id, e);
                None
            }
        }
    }

    /// Update the free-form display status; `lifecycle_status` is untouched
    pub async fn set_user_status(
        &self,
        instance_id: &str,
        user_status: &str,
    ) -> WorkflowResult<Instance> {
        if !self.store.set_user_status(instance_id, user_status).await? {
            return Err(WorkflowError::NotFound(format!(
                "Task not found: {}",
                instance_id
            )));
        }
        self.get(instance_id).await
    }

    // ------------------------------------------------------------------------
    // Cancel
    // ------------------------------------------------------------------------

    /// Persist `cancelling`, flag descriptors, then publish `cancel/<id>`.
    /// Any failure rolls back the steps already done.
    pub async fn request_cancel(&self, instance_id: &str) -> WorkflowResult<CancelOutcome> {
        let mut previous = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let instance = self.get(instance_id).await?;
            let current = instance.lifecycle_status;

            if current == LifecycleStatus::Cancelling {
                return Ok(CancelOutcome::AlreadyCancelling(instance));
            }
            if current.is_terminal() {
                return Err(WorkflowError::StateConflict {
                    message: format!("Cannot cancel task in status {}", current),
                    current_status: current,
                });
            }

            let next = current.apply(TransitionEvent::CancelRequested)?;
            if self
                .store
                .compare_and_set_status(instance_id, current, next)
                .await?
            {
                previous = Some(current);
                break;
            }
        }

        let previous = previous.ok_or_else(|| {
            WorkflowError::Internal(format!("{}: status kept changing during cancel", instance_id))
        })?;

        let flagged = self.contexts.mark_cancelled(instance_id);

        if let Err(e) = self.bus.publish(
            topics::cancel(instance_id),
            serde_json::json!({ "instance_id": instance_id }),
        ) {
            error!("Cancel fan-out for {} failed, rolling back: {}", instance_id, e);
            self.contexts.clear_cancelled(instance_id, &flagged);
            match self
                .store
                .compare_and_set_status(instance_id, LifecycleStatus::Cancelling, previous)
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!("Rollback of {} skipped, status moved on", instance_id),
                Err(rollback_err) => {
                    error!("Rollback of {} failed: {}", instance_id, rollback_err)
                }
            }
            return Err(WorkflowError::ProviderUnavailable(e.to_string()));
        }

        info!(
            "Cancellation requested for {} ({} live descriptor(s))",
            instance_id,
            flagged.len()
        );
        self.get(instance_id).await.map(CancelOutcome::Requested)
    }

    // ------------------------------------------------------------------------
    // Terminal
    // ------------------------------------------------------------------------

    /// Move an instance to its terminal state, retrying with backoff.
    /// Calling this on an already terminal instance changes nothing.
    pub async fn finish(
        &self,
        instance_id: &str,
        request: TerminalRequest,
    ) -> WorkflowResult<Instance> {
        let attempts = self.config.terminal_retry_attempts.max(1);
        let mut delay = self.config.terminal_retry_base;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_finish(instance_id, &request).await {
                Ok(Some(instance)) => {
                    self.contexts.remove_everywhere(instance_id);
                    if matches!(
                        instance.lifecycle_status,
                        LifecycleStatus::Completed | LifecycleStatus::Cancelled
                    ) {
                        self.kv.extend_after_terminal(instance_id);
                    }
                    return Ok(instance);
                }
                Ok(None) => {
                    debug!("{}: lost a race finishing, attempt {}", instance_id, attempt);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Terminal write for {} failed (attempt {}/{}): {}",
                        instance_id, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            WorkflowError::Internal(format!("{}: could not reach a terminal state", instance_id))
        }))
    }

    /// One attempt. `Ok(None)` means a concurrent writer won the CAS.
    async fn try_finish(
        &self,
        instance_id: &str,
        request: &TerminalRequest,
    ) -> WorkflowResult<Option<Instance>> {
        let instance = self.get(instance_id).await?;
        let current = instance.lifecycle_status;
        if current.is_terminal() {
            debug!("{} already {}", instance_id, current);
            return Ok(Some(instance));
        }

        let target = match request {
            TerminalRequest::Failure(_) => current.apply(TransitionEvent::Failure)?,
            TerminalRequest::Exit { cancelled: true } if current != LifecycleStatus::Cancelling => {
                // Descriptor was flagged but the store never saw the request
                if !self
                    .store
                    .compare_and_set_status(instance_id, current, LifecycleStatus::Cancelling)
                    .await?
                {
                    return Ok(None);
                }
                return self
                    .cas_terminal(instance_id, LifecycleStatus::Cancelling, LifecycleStatus::Cancelled)
                    .await;
            }
            TerminalRequest::Exit { .. } => current.apply(TransitionEvent::ExitReached)?,
        };

        if let TerminalRequest::Failure(reason) = request {
            warn!("Instance {} failed: {}", instance_id, reason);
        }
        self.cas_terminal(instance_id, current, target).await
    }

    async fn cas_terminal(
        &self,
        instance_id: &str,
        current: LifecycleStatus,
        target: LifecycleStatus,
    ) -> WorkflowResult<Option<Instance>> {
        if self
            .store
            .compare_and_set_status(instance_id, current, target)
            .await?
        {
            info!("Instance {} {}", instance_id, target);
            self.get(instance_id).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Shorthand for an unrecoverable error
    pub async fn fail(&self, instance_id: &str, reason: &str) -> WorkflowResult<Instance> {
        self.finish(instance_id, TerminalRequest::Failure(reason.to_string()))
            .await
    }
}
