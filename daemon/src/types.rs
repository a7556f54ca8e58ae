/// Request and response bodies of the control-plane API
use crate::errors::{DaemonError, DaemonResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskpack_core::{GateRow, Instance, InstanceFilter, LifecycleStatus};

/// Scope used by mode endpoints when the request names none
pub const DEFAULT_SCOPE: &str = "default";

/// Entity used by mode endpoints when the request names none
pub const DEFAULT_ENTITY: &str = "default";

pub const ALREADY_CANCELLING: &str = "Task is already being cancelled";

/// `POST /start` body: `definition_id` plus an open payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub definition_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub instance_id: String,
    pub status: LifecycleStatus,
}

/// `POST /cancel` body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub definition_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: LifecycleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `POST /update` body: addressed by instance or definition id
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub definition_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub topic: String,
    pub listeners: usize,
}

/// `GET /status` query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub definition_id: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub lifecycle_status: Option<String>,
}

impl StatusQuery {
    pub fn to_filter(&self) -> DaemonResult<InstanceFilter> {
        let lifecycle_status = match &self.lifecycle_status {
            Some(raw) => Some(raw.parse::<LifecycleStatus>().map_err(|_| {
                DaemonError::InvalidRequest(format!("Unknown lifecycle_status: {}", raw))
            })?),
            None => None,
        };
        Ok(InstanceFilter {
            definition_id: self.definition_id.clone(),
            principal: self.principal.clone(),
            lifecycle_status,
        })
    }
}

/// Instance row as reported by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(default)]
    pub orphaned: bool,
}

/// A single row when addressed by id, the filtered list otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// `GET /info` query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    pub definition_id: Option<String>,
}

/// `POST /edt/mode/{enable,disable}` body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeRequest {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl ModeRequest {
    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }
}

/// `GET /edt/mode/status` query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeStatusQuery {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
}

/// Result of a bulk mode mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkModeResponse {
    pub count: usize,
    pub results: Vec<GateRow>,
}

/// Single or bulk mode mutation result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModeResponse {
    Single(GateRow),
    Bulk(BulkModeResponse),
}
