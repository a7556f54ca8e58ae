//! Declarative graph description loaded from JSON
use crate::errors::{WorkflowError, WorkflowResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// A deployable composition of operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub nodes: Vec<NodeSpec>,
}

/// One operator instance inside a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    /// Targets per output port
    #[serde(default)]
    pub wires: Vec<Vec<String>>,
}

impl NodeSpec {
    pub fn new(id: &str, kind: &str, config: Value, wires: Vec<Vec<&str>>) -> Self {
        NodeSpec {
            id: id.to_string(),
            kind: kind.to_string(),
            config,
            wires: wires
                .into_iter()
                .map(|port| port.into_iter().map(str::to_string).collect())
                .collect(),
        }
    }

    /// Deserialize the node's config; `null` reads as an empty object
    pub fn parse_config<T: DeserializeOwned>(&self) -> WorkflowResult<T> {
        let raw = if self.config.is_null() {
            Value::Object(Default::default())
        } else {
            self.config.clone()
        };
        serde_json::from_value(raw).map_err(|e| {
            WorkflowError::Config(format!("node {} ({}): {}", self.id, self.kind, e))
        })
    }

    /// Targets wired to a port
    pub fn targets(&self, port: usize) -> &[String] {
        self.wires.get(port).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl GraphSpec {
    pub fn from_json(raw: &str) -> WorkflowResult<Self> {
        let spec: GraphSpec = serde_json::from_str(raw)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> WorkflowResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Config(format!("cannot read graph {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Node ids are unique and every wire points at an existing node
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::Config("graph id is empty".to_string()));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(WorkflowError::Config(format!(
                    "graph {}: duplicate node id {}",
                    self.id, node.id
                )));
            }
        }

        for node in &self.nodes {
            for target in node.wires.iter().flatten() {
                if !ids.contains(target.as_str()) {
                    return Err(WorkflowError::Config(format!(
                        "graph {}: node {} is wired to unknown node {}",
                        self.id, node.id, target
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_graph() {
        let spec = GraphSpec::from_json(
            r#"{
                "id": "cleaning",
                "nodes": [
                    {"id": "start", "type": "task-package-start",
                     "config": {"definition_id": "tp01"}, "wires": [["end"]]},
                    {"id": "end", "type": "task-package-end"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.node("start").unwrap().targets(0), ["end".to_string()]);
        assert!(spec.node("end").unwrap().targets(0).is_empty());
    }

    #[test]
    fn test_rejects_dangling_wire() {
        let spec = GraphSpec {
            id: "g".into(),
            label: None,
            nodes: vec![NodeSpec::new("a", "x", json!({}), vec![vec!["b"]])],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let spec = GraphSpec {
            id: "g".into(),
            label: None,
            nodes: vec![
                NodeSpec::new("a", "x", json!({}), vec![]),
                NodeSpec::new("a", "y", json!({}), vec![]),
            ],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_parse_config_null_is_empty() {
        #[derive(Deserialize)]
        struct Cfg {
            #[serde(default)]
            delay_ms: u64,
        }
        let node = NodeSpec::new("d", "task-package-delay", Value::Null, vec![]);
        let cfg: Cfg = node.parse_config().unwrap();
        assert_eq!(cfg.delay_ms, 0);

        let bad = NodeSpec::new("d", "task-package-delay", json!({"delay_ms": "x"}), vec![]);
        assert!(bad.parse_config::<Cfg>().is_err());
    }
}
