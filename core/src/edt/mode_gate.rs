//! Mode gate: per-entity enable/disable switch backed by the store
//!
//! Output 0 forwards messages of enabled entities, output 1 reports status
//! changes. Control messages use topics `edt-mode/<scope>/<action>`.

use crate::edt::gate::{ModeChangeEvent, DEFAULT_ENABLED};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::events::topics;
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::{value_to_key, FlowMessage};
use crate::types::GateRow;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const KIND: &str = "edt-mode";

pub const PASS: usize = 0;
pub const STATUS: usize = 1;

/// Topic prefix of control messages
pub const CONTROL_PREFIX: &str = "edt-mode";

/// Entity used when the gate switches a whole scope
pub const SCOPE_ENTITY: &str = "default";

fn default_enabled() -> bool {
    DEFAULT_ENABLED
}

fn default_updated_by() -> String {
    KIND.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeGateConfig {
    pub scope: String,
    /// Message path of the entity id; the gate is scope-wide when absent
    #[serde(default)]
    pub entity_id_field: Option<String>,
    /// State of auto-created rows
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
    #[serde(default = "default_updated_by")]
    pub updated_by: String,
}

/// Action carried by a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Enable,
    Disable,
    Toggle,
    Status,
}

impl ControlAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enable" => Some(ControlAction::Enable),
            "disable" => Some(ControlAction::Disable),
            "toggle" => Some(ControlAction::Toggle),
            "status" => Some(ControlAction::Status),
            _ => None,
        }
    }
}

pub struct ModeGateOperator {
    config: ModeGateConfig,
    /// Last known state per entity, for display
    displayed: Arc<DashMap<String, bool>>,
}

impl ModeGateOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        let config: ModeGateConfig = spec.parse_config()?;
        if config.scope.trim().is_empty() {
            return Err(WorkflowError::Config(format!("node {}: scope is empty", spec.id)));
        }
        Ok(ModeGateOperator {
            config,
            displayed: Arc::new(DashMap::new()),
        })
    }

    pub fn displayed(&self, entity_id: &str) -> Option<bool> {
        self.displayed.get(entity_id).map(|v| *v)
    }

    /// Action of a control message addressed to this gate's scope
    fn control_action<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let mut parts = topic.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(CONTROL_PREFIX), Some(scope), Some(action)) if scope == self.config.scope => {
                Some(action)
            }
            _ => None,
        }
    }

    fn entity_of(&self, message: &FlowMessage) -> WorkflowResult<String> {
        match &self.config.entity_id_field {
            None => Ok(SCOPE_ENTITY.to_string()),
            Some(path) => message
                .field(path)
                .as_ref()
                .and_then(value_to_key)
                .ok_or_else(|| WorkflowError::Validation(format!("no entity id at {}", path))),
        }
    }

    /// `payload.entity_id` first, then the configured field, then the scope-wide row
    fn control_entity(&self, message: &FlowMessage) -> String {
        message
            .payload
            .get("entity_id")
            .and_then(value_to_key)
            .or_else(|| {
                self.config
                    .entity_id_field
                    .as_ref()
                    .and_then(|_| self.entity_of(message).ok())
            })
            .unwrap_or_else(|| SCOPE_ENTITY.to_string())
    }

    fn status_message(&self, row: &GateRow, action: &str) -> FlowMessage {
        FlowMessage::new(
            format!("{}/{}/status", CONTROL_PREFIX, row.scope),
            json!({
                "scope": row.scope,
                "entity_id": row.entity_id,
                "enabled": row.enabled,
                "action": action,
                "reason": row.reason,
                "updated_by": row.updated_by,
            }),
        )
    }

    async fn handle_control(
        &self,
        action: &str,
        message: &FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let action = ControlAction::parse(action)
            .ok_or_else(|| WorkflowError::Validation(format!("unknown mode action {}", action)))?;
        let entity_id = self.control_entity(message);
        let gates = &ctx.services.gates;
        let scope = &self.config.scope;
        let reason = message.payload.get("reason").and_then(Value::as_str);
        let updated_by = message
            .payload
            .get("updated_by")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.updated_by);

        // Mutations are reported through the mode-change listener
        match action {
            ControlAction::Enable | ControlAction::Disable => {
                gates
                    .set_enabled(
                        scope,
                        &entity_id,
                        action == ControlAction::Enable,
                        reason,
                        Some(updated_by),
                    )
                    .await?;
                Ok(Vec::new())
            }
            ControlAction::Toggle => {
                gates.toggle(scope, &entity_id, reason, Some(updated_by)).await?;
                Ok(Vec::new())
            }
            ControlAction::Status => {
                let row = gates.status(scope, &entity_id).await?;
                Ok(vec![(STATUS, self.status_message(&row, "status"))])
            }
        }
    }
}

#[async_trait]
impl Operator for ModeGateOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn outputs(&self) -> usize {
        2
    }

    /// Seed the displayed status from stored rows
    async fn deploy(&self, ctx: &NodeContext) -> WorkflowResult<()> {
        for row in ctx.services.gates.list(&self.config.scope).await? {
            self.displayed.insert(row.entity_id, row.enabled);
        }
        Ok(())
    }

    fn start(&self, ctx: &NodeContext) -> WorkflowResult<Vec<JoinHandle<()>>> {
        let mut sub = ctx
            .services
            .bus
            .subscribe_topic(topics::mode_change(&self.config.scope));
        let ctx = ctx.clone();
        let displayed = self.displayed.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let change: ModeChangeEvent = match serde_json::from_value(event.data) {
                    Ok(change) => change,
                    Err(e) => {
                        warn!("{}: malformed mode change: {}", ctx.node_id, e);
                        continue;
                    }
                };

                match (&change.entity_id, change.enabled) {
                    (Some(entity_id), Some(enabled)) => {
                        displayed.insert(entity_id.clone(), enabled);
                    }
                    _ => displayed.clear(),
                }
                debug!("{}: {:?} {:?}", ctx.node_id, change.action, change.entity_id);

                ctx.emit(
                    STATUS,
                    FlowMessage::new(event.topic, serde_json::to_value(&change).unwrap_or(Value::Null)),
                );
            }
        });

        Ok(vec![handle])
    }

    async fn on_message(
        &self,
        message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        if let Some(action) = self.control_action(&message.topic) {
            let action = action.to_string();
            return self.handle_control(&action, &message, ctx).await;
        }

        let entity_id = self.entity_of(&message)?;
        let (row, created) = ctx
            .services
            .gates
            .ensure(
                &self.config.scope,
                &entity_id,
                self.config.default_enabled,
                &self.config.updated_by,
            )
            .await?;

        let mut outputs = Vec::new();
        if created {
            self.displayed.insert(entity_id.clone(), row.enabled);
            outputs.push((STATUS, self.status_message(&row, "auto_create")));
        }

        if row.enabled {
            outputs.push((PASS, message));
        } else {
            debug!(
                "{}: {}/{} disabled, message dropped",
                ctx.node_id, self.config.scope, entity_id
            );
        }
        Ok(outputs)
    }
}
