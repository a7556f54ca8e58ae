//! Gate service: the single writer of per-entity gate rows
use crate::errors::WorkflowResult;
use crate::events::{topics, EventBus};
use crate::store::SqliteTaskStore;
use crate::types::{GateAction, GateHistoryEntry, GateRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Absent rows behave as enabled
pub const DEFAULT_ENABLED: bool = true;

/// Body of an `edt-mode-change/<scope>` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeChangeEvent {
    pub scope: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub action: GateAction,
    /// New state; absent for `clear_scope`
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct GateService {
    store: Arc<SqliteTaskStore>,
    bus: Arc<EventBus>,
}

impl GateService {
    pub fn new(store: Arc<SqliteTaskStore>, bus: Arc<EventBus>) -> Self {
        GateService { store, bus }
    }

    /// Stored row, or the enabled default when none exists
    pub async fn status(&self, scope: &str, entity_id: &str) -> WorkflowResult<GateRow> {
        Ok(self
            .store
            .get_gate(scope, entity_id)
            .await?
            .unwrap_or_else(|| GateRow::default_for(scope, entity_id, DEFAULT_ENABLED)))
    }

    pub async fn list(&self, scope: &str) -> WorkflowResult<Vec<GateRow>> {
        self.store.list_gates(scope).await
    }

    /// Create the row at `default_enabled` unless present. Returns the row and
    /// whether this call created it; concurrent callers create exactly one.
    pub async fn ensure(
        &self,
        scope: &str,
        entity_id: &str,
        default_enabled: bool,
        updated_by: &str,
    ) -> WorkflowResult<(GateRow, bool)> {
        if let Some(row) = self.store.get_gate(scope, entity_id).await? {
            return Ok((row, false));
        }
        let (row, created) = self
            .store
            .insert_gate_if_absent(
                scope,
                entity_id,
                default_enabled,
                Some("auto-created"),
                Some(updated_by),
            )
            .await?;
        if created {
            info!("Auto-created gate {}/{} (enabled={})", scope, entity_id, row.enabled);
        }
        Ok((row, created))
    }

    pub async fn set_enabled(
        &self,
        scope: &str,
        entity_id: &str,
        enabled: bool,
        reason: Option<&str>,
        updated_by: Option<&str>,
    ) -> WorkflowResult<GateRow> {
        let row = self
            .store
            .set_gate(scope, entity_id, enabled, reason, updated_by)
            .await?;
        info!(
            "Gate {}/{} {} by {}",
            scope,
            entity_id,
            if enabled { "enabled" } else { "disabled" },
            updated_by.unwrap_or("unknown")
        );

        self.announce(ModeChangeEvent {
            scope: scope.to_string(),
            entity_id: Some(entity_id.to_string()),
            action: if enabled {
                GateAction::Enable
            } else {
                GateAction::Disable
            },
            enabled: Some(enabled),
            reason: reason.map(str::to_string),
            updated_by: updated_by.map(str::to_string),
            at: row.updated_at,
        });
        Ok(row)
    }

    /// Flip the current (or default) state
    pub async fn toggle(
        &self,
        scope: &str,
        entity_id: &str,
        reason: Option<&str>,
        updated_by: Option<&str>,
    ) -> WorkflowResult<GateRow> {
        let current = self.status(scope, entity_id).await?;
        self.set_enabled(scope, entity_id, !current.enabled, reason, updated_by)
            .await
    }

    /// Remove every row of a scope; entities fall back to the default
    pub async fn clear_scope(
        &self,
        scope: &str,
        reason: Option<&str>,
        updated_by: Option<&str>,
    ) -> WorkflowResult<u64> {
        let removed = self.store.clear_scope(scope, reason, updated_by).await?;
        info!("Cleared {} gate row(s) of scope {}", removed, scope);

        self.announce(ModeChangeEvent {
            scope: scope.to_string(),
            entity_id: None,
            action: GateAction::ClearScope,
            enabled: None,
            reason: reason.map(str::to_string),
            updated_by: updated_by.map(str::to_string),
            at: Utc::now(),
        });
        Ok(removed)
    }

    pub async fn history(
        &self,
        scope: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<Vec<GateHistoryEntry>> {
        self.store.gate_history(scope, entity_id).await
    }

    /// The row is already durable; a failed announcement only delays the
    /// displayed status of listening gates.
    fn announce(&self, event: ModeChangeEvent) {
        let topic = topics::mode_change(&event.scope);
        let data = match serde_json::to_value(&event) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot encode mode change for {}: {}", topic, e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, data) {
            warn!("Mode change for scope {} not announced: {}", event.scope, e);
        }
    }
}
