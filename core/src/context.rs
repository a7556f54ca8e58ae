//! Per-graph arena of active-task descriptors
//!
//! Operators never hold descriptors directly, only the `instance_id` key.
//! The arena owns descriptor lifetime and guarantees that a graph never lists
//! the same instance twice.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// In-memory record of a live instance inside one graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub instance_id: String,
    pub definition_id: String,
    pub cached_display_name: String,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ActiveTask {
    pub fn new(instance_id: &str, definition_id: &str, cached_display_name: &str) -> Self {
        ActiveTask {
            instance_id: instance_id.to_string(),
            definition_id: definition_id.to_string(),
            cached_display_name: cached_display_name.to_string(),
            created_at: Utc::now(),
            cancelled: false,
            cancelled_at: None,
        }
    }
}

/// Ordered descriptor list of one deployed graph
#[derive(Debug)]
pub struct GraphContext {
    graph_id: String,
    tasks: RwLock<Vec<ActiveTask>>,
}

impl GraphContext {
    pub fn new(graph_id: impl Into<String>) -> Self {
        GraphContext {
            graph_id: graph_id.into(),
            tasks: RwLock::new(Vec::new()),
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Register a descriptor. Returns false if the instance is already present.
    pub fn register(&self, task: ActiveTask) -> bool {
        let mut tasks = self.tasks.write();
        if tasks.iter().any(|t| t.instance_id == task.instance_id) {
            return false;
        }
        tasks.push(task);
        true
    }

    pub fn get(&self, instance_id: &str) -> Option<ActiveTask> {
        self.tasks
            .read()
            .iter()
            .find(|t| t.instance_id == instance_id)
            .cloned()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.tasks.read().iter().any(|t| t.instance_id == instance_id)
    }

    /// Flip the cancelled flag. Returns the previous flag, or `None` if the
    /// instance is not registered here.
    pub fn mark_cancelled(&self, instance_id: &str) -> Option<bool> {
        let mut tasks = self.tasks.write();
        let task = tasks.iter_mut().find(|t| t.instance_id == instance_id)?;
        let previous = task.cancelled;
        if !previous {
            task.cancelled = true;
            task.cancelled_at = Some(Utc::now());
        }
        Some(previous)
    }

    /// Undo `mark_cancelled`
    pub fn clear_cancelled(&self, instance_id: &str) -> bool {
        let mut tasks = self.tasks.write();
        match tasks.iter_mut().find(|t| t.instance_id == instance_id) {
            Some(task) => {
                task.cancelled = false;
                task.cancelled_at = None;
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, instance_id: &str) -> bool {
        self.tasks
            .read()
            .iter()
            .any(|t| t.instance_id == instance_id && t.cancelled)
    }

    pub fn remove(&self, instance_id: &str) -> Option<ActiveTask> {
        let mut tasks = self.tasks.write();
        let index = tasks.iter().position(|t| t.instance_id == instance_id)?;
        Some(tasks.remove(index))
    }

    /// Point-in-time copy of the descriptor list
    pub fn snapshot(&self) -> Vec<ActiveTask> {
        self.tasks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

/// All graph contexts of the process, keyed by graph id
#[derive(Debug, Default)]
pub struct ContextRegistry {
    graphs: DashMap<String, Arc<GraphContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the context of a graph
    pub fn context(&self, graph_id: &str) -> Arc<GraphContext> {
        self.graphs
            .entry(graph_id.to_string())
            .or_insert_with(|| Arc::new(GraphContext::new(graph_id)))
            .clone()
    }

    pub fn drop_context(&self, graph_id: &str) -> Option<Arc<GraphContext>> {
        self.graphs.remove(graph_id).map(|(_, ctx)| ctx)
    }

    fn contexts(&self) -> Vec<Arc<GraphContext>> {
        self.graphs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Flip the flag wherever the instance is registered. Returns the ids of
    /// graphs whose descriptor changed from not-cancelled to cancelled.
    pub fn mark_cancelled(&self, instance_id: &str) -> Vec<String> {
        self.contexts()
            .into_iter()
            .filter(|ctx| ctx.mark_cancelled(instance_id) == Some(false))
            .map(|ctx| ctx.graph_id().to_string())
            .collect()
    }

    /// Roll back `mark_cancelled` for the given graphs
    pub fn clear_cancelled(&self, instance_id: &str, graph_ids: &[String]) {
        for graph_id in graph_ids {
            if let Some(ctx) = self.graphs.get(graph_id) {
                ctx.clear_cancelled(instance_id);
            }
        }
    }

    /// Remove the descriptor from every graph
    pub fn remove_everywhere(&self, instance_id: &str) -> usize {
        self.contexts()
            .into_iter()
            .filter(|ctx| ctx.remove(instance_id).is_some())
            .count()
    }

    /// Whether any graph holds a descriptor for the instance
    pub fn is_live(&self, instance_id: &str) -> bool {
        self.contexts().iter().any(|ctx| ctx.contains(instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicates() {
        let ctx = GraphContext::new("g1");
        assert!(ctx.register(ActiveTask::new("i-1", "tp01", "Cleaning")));
        assert!(!ctx.register(ActiveTask::new("i-1", "tp01", "Cleaning")));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_cancel_flag_is_per_instance() {
        let ctx = GraphContext::new("g1");
        ctx.register(ActiveTask::new("a", "tp01", "Cleaning"));
        ctx.register(ActiveTask::new("b", "tp01", "Cleaning"));

        assert_eq!(ctx.mark_cancelled("a"), Some(false));
        assert_eq!(ctx.mark_cancelled("a"), Some(true));
        assert!(ctx.is_cancelled("a"));
        assert!(!ctx.is_cancelled("b"));
        assert!(ctx.get("a").unwrap().cancelled_at.is_some());
        assert_eq!(ctx.mark_cancelled("zzz"), None);
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let ctx = GraphContext::new("g1");
        for id in ["c", "a", "b"] {
            ctx.register(ActiveTask::new(id, "tp01", "Cleaning"));
        }
        let order: Vec<_> = ctx.snapshot().into_iter().map(|t| t.instance_id).collect();
        assert_eq!(order, vec!["c", "a", "b"]);

        ctx.remove("a");
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_registry_mark_and_rollback() {
        let registry = ContextRegistry::new();
        registry.context("g1").register(ActiveTask::new("a", "tp01", "x"));
        registry.context("g2").register(ActiveTask::new("b", "tp01", "x"));

        let touched = registry.mark_cancelled("a");
        assert_eq!(touched, vec!["g1".to_string()]);
        assert!(registry.context("g1").is_cancelled("a"));
        assert!(!registry.context("g2").is_cancelled("b"));

        registry.clear_cancelled("a", &touched);
        assert!(!registry.context("g1").is_cancelled("a"));

        assert!(registry.is_live("b"));
        assert_eq!(registry.remove_everywhere("b"), 1);
        assert!(!registry.is_live("b"));
    }
}
