//! Rate limit and duplicate filter per entity
use crate::edt::memory::FilterDecision;
use crate::edt::state_memory::extract_state;
use crate::edt::DEFAULT_ENTITY_FIELD;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::graph::{NodeContext, NodeSpec, Operator, Output};
use crate::message::{value_to_key, FlowMessage};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

pub const KIND: &str = "edt-filter";

fn default_entity_field() -> String {
    DEFAULT_ENTITY_FIELD.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Defaults to the node id
    #[serde(default)]
    pub filter_name: Option<String>,
    #[serde(default = "default_entity_field")]
    pub entity_id_field: String,
    #[serde(default)]
    pub min_interval_ms: u64,
    /// Duplicate detection over these payload paths
    #[serde(default)]
    pub tracked_fields: Option<Vec<String>>,
}

pub struct FilterOperator {
    filter_name: String,
    config: FilterConfig,
}

impl FilterOperator {
    pub fn from_spec(spec: &NodeSpec) -> WorkflowResult<Self> {
        let config: FilterConfig = spec.parse_config()?;
        Ok(FilterOperator {
            filter_name: config.filter_name.clone().unwrap_or_else(|| spec.id.clone()),
            config,
        })
    }

    fn min_interval(&self) -> Duration {
        Duration::from_millis(self.config.min_interval_ms)
    }
}

#[async_trait]
impl Operator for FilterOperator {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn on_message(
        &self,
        message: FlowMessage,
        ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let entity_id = message
            .field(&self.config.entity_id_field)
            .as_ref()
            .and_then(value_to_key)
            .ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "no entity id at {}",
                    self.config.entity_id_field
                ))
            })?;

        let snapshot = self
            .config
            .tracked_fields
            .as_deref()
            .map(|fields| extract_state(&message.payload, Some(fields)));

        match ctx.services.memory.evaluate_filter(
            &self.filter_name,
            &entity_id,
            Instant::now(),
            self.min_interval(),
            snapshot,
        ) {
            FilterDecision::Pass => Ok(vec![(0, message)]),
            decision => {
                debug!("{}: {} dropped ({:?})", ctx.node_id, entity_id, decision);
                Ok(Vec::new())
            }
        }
    }
}
