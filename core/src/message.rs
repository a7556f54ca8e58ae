/// Message envelope passed between graph operators
use crate::state_machine::LifecycleStatus;
use crate::types::Instance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity and status of the workflow a message belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub instance_id: String,
    pub definition_id: String,
    pub cached_display_name: String,
    pub lifecycle_status: LifecycleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Instance> for WorkflowContext {
    fn from(instance: &Instance) -> Self {
        WorkflowContext {
            instance_id: instance.instance_id.clone(),
            definition_id: instance.definition_id.clone(),
            cached_display_name: instance.cached_display_name.clone(),
            lifecycle_status: instance.lifecycle_status,
            user_status: instance.user_status.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Structured message flowing through a graph
///
/// A message routed out of a cancellation or failure output carries
/// `_cleanup = true`; downstream operators skip cancellation checks for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_context: Option<WorkflowContext>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub topic: String,
    #[serde(rename = "_cleanup", default, skip_serializing_if = "is_false")]
    pub cleanup: bool,
    #[serde(rename = "_cleanup_reason", default, skip_serializing_if = "Option::is_none")]
    pub cleanup_reason: Option<String>,
    #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Any other top-level fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FlowMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        FlowMessage {
            topic: topic.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: WorkflowContext) -> Self {
        self.workflow_context = Some(context);
        self
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.workflow_context
            .as_ref()
            .map(|ctx| ctx.instance_id.as_str())
    }

    /// Tag as cleanup (routed through a cancellation output)
    pub fn into_cleanup(mut self, reason: impl Into<String>) -> Self {
        self.cleanup = true;
        if self.cleanup_reason.is_none() {
            self.cleanup_reason = Some(reason.into());
        }
        self
    }

    /// Tag as failed cleanup (routed through a failure output)
    pub fn into_error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        self.cleanup = true;
        self.cleanup_reason = Some("error".to_string());
        self.error = Some(error);
        self
    }

    pub fn is_cleanup(&self) -> bool {
        self.cleanup
    }

    /// Whole message as JSON (for field-path lookups)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Resolve a dotted path such as `payload.sensor.id` against the message
    pub fn field(&self, path: &str) -> Option<Value> {
        lookup(&self.to_value(), path).cloned()
    }

    /// Set a top-level field (outside `payload`)
    pub fn set_field(&mut self, name: &str, value: Value) {
        self.extra.insert(name.to_string(), value);
    }
}

/// Dotted-path lookup; numeric segments index arrays
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a JSON scalar as an identifier string
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cleanup_fields_serialize_with_underscore() {
        let msg = FlowMessage::new("t", json!({})).into_cleanup("cancelled");
        let value = msg.to_value();
        assert_eq!(value["_cleanup"], true);
        assert_eq!(value["_cleanup_reason"], "cancelled");

        let plain = FlowMessage::new("t", json!({})).to_value();
        assert!(plain.get("_cleanup").is_none());
    }

    #[test]
    fn test_extra_fields_round_trip() {
        let raw = json!({
            "topic": "sensor",
            "payload": {"bed": {"id": "bed_1"}},
            "_cleanup": true,
            "source": "gateway"
        });
        let msg: FlowMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.is_cleanup());
        assert_eq!(msg.extra["source"], "gateway");
        assert_eq!(msg.field("payload.bed.id"), Some(json!("bed_1")));
    }

    #[test]
    fn test_lookup_arrays_and_missing() {
        let value = json!({"a": [{"b": 1}, {"b": 2}]});
        assert_eq!(lookup(&value, "a.1.b"), Some(&json!(2)));
        assert_eq!(lookup(&value, "a.5.b"), None);
        assert_eq!(lookup(&value, "x"), None);
    }

    #[test]
    fn test_into_error_marks_cleanup() {
        let msg = FlowMessage::new("t", json!({})).into_error("boom");
        assert!(msg.cleanup);
        assert_eq!(msg.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_value_to_key() {
        assert_eq!(value_to_key(&json!("bed_1")), Some("bed_1".to_string()));
        assert_eq!(value_to_key(&json!(7)), Some("7".to_string()));
        assert_eq!(value_to_key(&json!("")), None);
        assert_eq!(value_to_key(&json!({"a": 1})), None);
    }
}
