//! End-to-end runs of workflow graphs on an in-memory store

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskpack_core::context::ActiveTask;
use taskpack_core::{
    topics, CancelOutcome, FlowMessage, GraphSpec, Instance, LifecycleStatus, NodeContext, NodeSpec,
    Operator, OperatorRegistry, Output, Runtime, RuntimeConfig, SqliteTaskStore,
    WorkflowContext, WorkflowResult,
};
use tokio::sync::mpsc;

/// Forwards every message it receives to the test, tagged with its label
struct Capture {
    label: String,
    tx: mpsc::UnboundedSender<(String, FlowMessage)>,
}

#[derive(Deserialize)]
struct CaptureConfig {
    label: String,
}

#[async_trait]
impl Operator for Capture {
    fn kind(&self) -> &'static str {
        "capture"
    }

    fn outputs(&self) -> usize {
        0
    }

    async fn on_message(
        &self,
        message: FlowMessage,
        _ctx: &NodeContext,
    ) -> WorkflowResult<Vec<Output>> {
        let _ = self.tx.send((self.label.clone(), message));
        Ok(Vec::new())
    }
}

async fn runtime_with_capture() -> (Runtime, mpsc::UnboundedReceiver<(String, FlowMessage)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut operators = OperatorRegistry::with_builtins();
    operators.register("capture", move |spec: &NodeSpec| {
        let config: CaptureConfig = spec.parse_config()?;
        Ok(Arc::new(Capture {
            label: config.label,
            tx: tx.clone(),
        }))
    });

    let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
    let config = RuntimeConfig {
        discovery_interval: Duration::from_millis(20),
        cancel_poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    (Runtime::with_operators(store, config, operators), rx)
}

async fn wait_for_status(
    runtime: &Runtime,
    instance_id: &str,
    expected: LifecycleStatus,
) -> Instance {
    for _ in 0..400 {
        let instance = runtime.registry().get(instance_id).await.unwrap();
        if instance.lifecycle_status == expected {
            return instance;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", instance_id, expected);
}

async fn wait_for_descriptor(runtime: &Runtime, graph_id: &str, instance_id: &str) {
    let graph = runtime.graph(graph_id).unwrap();
    for _ in 0..200 {
        if graph.context().contains(instance_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never registered in {}", instance_id, graph_id);
}

fn cleaning_graph(delay_ms: u64) -> GraphSpec {
    GraphSpec::from_json(&format!(
        r#"{{"id": "cleaning", "nodes": [
            {{"id": "start", "type": "task-package-start",
              "config": {{"definition_id": "tp01", "display_name": "Room cleaning"}},
              "wires": [["wait"]]}},
            {{"id": "wait", "type": "task-package-delay",
              "config": {{"delay_ms": {}}},
              "wires": [["end"], ["end"]]}},
            {{"id": "router", "type": "task-package-cancel",
              "config": {{"definition_id": "tp01"}},
              "wires": [["cleanup"]]}},
            {{"id": "cleanup", "type": "capture", "config": {{"label": "cleanup"}}}},
            {{"id": "end", "type": "task-package-end"}}
        ]}}"#,
        delay_ms
    ))
    .unwrap()
}

#[tokio::test]
async fn test_workflow_runs_to_completion() {
    let (runtime, _rx) = runtime_with_capture().await;
    runtime.deploy(cleaning_graph(20)).await.unwrap();

    let definition = runtime.store().get_definition("tp01").await.unwrap().unwrap();
    let instance = runtime
        .registry()
        .start_instance(&definition, "admin", json!({"room": "101"}))
        .await
        .unwrap();

    let done = wait_for_status(&runtime, &instance.instance_id, LifecycleStatus::Completed).await;
    assert_eq!(done.cached_display_name, "Room cleaning");

    let graph = runtime.graph("cleaning").unwrap();
    assert!(!graph.context().contains(&instance.instance_id));
}

#[tokio::test]
async fn test_cancel_only_touches_addressed_instance() {
    let (runtime, mut rx) = runtime_with_capture().await;
    runtime.deploy(cleaning_graph(1_500)).await.unwrap();
    let definition = runtime.store().get_definition("tp01").await.unwrap().unwrap();
    let registry = runtime.registry();

    let a = registry
        .start_instance(&definition, "admin", json!({"room": "101"}))
        .await
        .unwrap();
    let b = registry
        .start_instance(&definition, "admin", json!({"room": "102"}))
        .await
        .unwrap();
    wait_for_descriptor(&runtime, "cleaning", &a.instance_id).await;
    wait_for_descriptor(&runtime, "cleaning", &b.instance_id).await;
    // Let the router pick both up
    tokio::time::sleep(Duration::from_millis(100)).await;

    match registry.request_cancel(&a.instance_id).await.unwrap() {
        CancelOutcome::Requested(instance) => {
            assert_eq!(instance.lifecycle_status, LifecycleStatus::Cancelling)
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let graph = runtime.graph("cleaning").unwrap();
    assert!(!graph.context().is_cancelled(&b.instance_id));

    wait_for_status(&runtime, &a.instance_id, LifecycleStatus::Cancelled).await;

    // The router's cleanup message carries the cancelled instance only
    let (label, cleanup) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "cleanup");
    assert!(cleanup.is_cleanup());
    assert_eq!(cleanup.instance_id(), Some(a.instance_id.as_str()));

    let b_now = registry.get(&b.instance_id).await.unwrap();
    assert!(matches!(
        b_now.lifecycle_status,
        LifecycleStatus::Started | LifecycleStatus::Ongoing
    ));

    wait_for_status(&runtime, &b.instance_id, LifecycleStatus::Completed).await;
}

#[tokio::test]
async fn test_cleanup_messages_bypass_cancellation() {
    let (runtime, mut rx) = runtime_with_capture().await;
    let spec = GraphSpec::from_json(
        r#"{"id": "bypass", "nodes": [
            {"id": "wait", "type": "task-package-delay", "config": {"delay_ms": 30},
             "wires": [["wait_proceed"], ["wait_cancelled"]]},
            {"id": "check", "type": "task-package-cancel-check",
             "wires": [["check_proceed"], ["check_cancelled"]]},
            {"id": "wait_proceed", "type": "capture", "config": {"label": "wait_proceed"}},
            {"id": "wait_cancelled", "type": "capture", "config": {"label": "wait_cancelled"}},
            {"id": "check_proceed", "type": "capture", "config": {"label": "check_proceed"}},
            {"id": "check_cancelled", "type": "capture", "config": {"label": "check_cancelled"}}
        ]}"#,
    )
    .unwrap();
    let graph = runtime.deploy(spec).await.unwrap();

    let store = runtime.store();
    let definition = store
        .upsert_definition("tp01", "Room cleaning", None, None)
        .await
        .unwrap();
    let instance = runtime
        .registry()
        .start_instance(&definition, "admin", json!({}))
        .await
        .unwrap();
    let id = instance.instance_id.clone();
    graph
        .context()
        .register(ActiveTask::new(&id, "tp01", "Room cleaning"));
    runtime.registry().request_cancel(&id).await.unwrap();
    assert!(graph.context().is_cancelled(&id));

    let context = WorkflowContext::from(&runtime.registry().get(&id).await.unwrap());
    let plain = FlowMessage::new("tick", json!({})).with_context(context.clone());
    let cleanup = plain.clone().into_cleanup("cancelled");

    for node in ["wait", "check"] {
        graph.inject(node, cleanup.clone()).unwrap();
        graph.inject(node, plain.clone()).unwrap();
    }

    let mut labels = Vec::new();
    for _ in 0..4 {
        let (label, message) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        labels.push((label, message.is_cleanup(), message.topic.clone()));
    }
    labels.sort();

    // Cleanup copies proceed; plain copies are diverted and tagged on the way
    let proceed: Vec<_> = labels.iter().filter(|(l, _, _)| l.ends_with("proceed")).collect();
    let diverted: Vec<_> = labels.iter().filter(|(l, _, _)| l.ends_with("cancelled")).collect();
    assert_eq!(proceed.len(), 2);
    assert_eq!(diverted.len(), 2);
    assert!(proceed.iter().all(|(_, cleanup, _)| *cleanup));
}

#[tokio::test]
async fn test_invalid_payload_fails_instance() {
    let (runtime, _rx) = runtime_with_capture().await;
    let spec = GraphSpec::from_json(
        r#"{"id": "strict", "nodes": [
            {"id": "start", "type": "task-package-start",
             "config": {"definition_id": "tp09",
                        "payload_schema": {"required": ["room"], "properties": {"room": "string"}}},
             "wires": [["end"]]},
            {"id": "end", "type": "task-package-end"}
        ]}"#,
    )
    .unwrap();
    runtime.deploy(spec).await.unwrap();
    let definition = runtime.store().get_definition("tp09").await.unwrap().unwrap();
    assert!(definition.payload_schema.is_some());

    let bad = runtime
        .registry()
        .start_instance(&definition, "admin", json!({"room": 101}))
        .await
        .unwrap();
    let good = runtime
        .registry()
        .start_instance(&definition, "admin", json!({"room": "101"}))
        .await
        .unwrap();

    wait_for_status(&runtime, &bad.instance_id, LifecycleStatus::Failed).await;
    wait_for_status(&runtime, &good.instance_id, LifecycleStatus::Completed).await;
}

#[tokio::test]
async fn test_user_status_and_kv_in_flow() {
    let (runtime, mut rx) = runtime_with_capture().await;
    let spec = GraphSpec::from_json(
        r#"{"id": "report", "nodes": [
            {"id": "start", "type": "task-package-start",
             "config": {"definition_id": "tp02", "display_name": "Linen change"},
             "wires": [["status"]]},
            {"id": "status", "type": "task-package-user-status",
             "config": {"status": "Linen collected"}, "wires": [["remember"]]},
            {"id": "remember", "type": "task-package-kv-set", "wires": [["recall"]]},
            {"id": "recall", "type": "task-package-kv-get",
             "wires": [["seen"], ["missing"]]},
            {"id": "seen", "type": "capture", "config": {"label": "seen"}},
            {"id": "missing", "type": "capture", "config": {"label": "missing"}}
        ]}"#,
    )
    .unwrap();
    runtime.deploy(spec).await.unwrap();
    let definition = runtime.store().get_definition("tp02").await.unwrap().unwrap();

    let instance = runtime
        .registry()
        .start_instance(&definition, "admin", json!({"room": "7"}))
        .await
        .unwrap();

    let (label, message) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "seen");
    assert_eq!(message.field("kv.payload.room"), Some(json!("7")));

    // Writing the user status leaves the lifecycle where the entry put it
    let row = runtime.registry().get(&instance.instance_id).await.unwrap();
    assert_eq!(row.user_status.as_deref(), Some("Linen collected"));
    assert_eq!(row.lifecycle_status, LifecycleStatus::Started);
}

#[tokio::test]
async fn test_progress_reporting_is_opt_in() {
    let (runtime, mut rx) = runtime_with_capture().await;
    let spec = GraphSpec::from_json(
        r#"{"id": "progress", "nodes": [
            {"id": "start", "type": "task-package-start",
             "config": {"definition_id": "tp03", "display_name": "Bed making"},
             "wires": [["quiet"]]},
            {"id": "quiet", "type": "task-package-cancel-check",
             "wires": [["seen_quiet"], []]},
            {"id": "seen_quiet", "type": "capture", "config": {"label": "quiet"}},
            {"id": "check", "type": "task-package-cancel-check",
             "config": {"report_progress": true}, "wires": [["wait"], []]},
            {"id": "wait", "type": "task-package-delay",
             "config": {"delay_ms": 10, "report_progress": true},
             "wires": [["seen_progress"], []]},
            {"id": "seen_progress", "type": "capture", "config": {"label": "progress"}}
        ]}"#,
    )
    .unwrap();
    let graph = runtime.deploy(spec).await.unwrap();
    let definition = runtime.store().get_definition("tp03").await.unwrap().unwrap();

    let instance = runtime
        .registry()
        .start_instance(&definition, "admin", json!({}))
        .await
        .unwrap();
    let id = instance.instance_id.clone();

    let (label, quiet) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "quiet");
    assert_eq!(
        quiet.workflow_context.as_ref().unwrap().lifecycle_status,
        LifecycleStatus::Started
    );
    let row = runtime.registry().get(&id).await.unwrap();
    assert_eq!(row.lifecycle_status, LifecycleStatus::Started);

    graph.inject("check", quiet).unwrap();
    let (label, progressed) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "progress");
    assert_eq!(
        progressed.workflow_context.as_ref().unwrap().lifecycle_status,
        LifecycleStatus::Ongoing
    );
    let row = runtime.registry().get(&id).await.unwrap();
    assert_eq!(row.lifecycle_status, LifecycleStatus::Ongoing);
}

#[tokio::test]
async fn test_updates_reach_live_instances_by_either_id() {
    let (runtime, mut rx) = runtime_with_capture().await;
    let spec = GraphSpec::from_json(
        r#"{"id": "updates", "nodes": [
            {"id": "start", "type": "task-package-start",
             "config": {"definition_id": "tp04", "display_name": "Window cleaning"},
             "wires": [["wait"]]},
            {"id": "wait", "type": "task-package-delay",
             "config": {"delay_ms": 1500}, "wires": [["end"], ["end"]]},
            {"id": "end", "type": "task-package-end"},
            {"id": "listen", "type": "task-package-update", "wires": [["got"]]},
            {"id": "got", "type": "capture", "config": {"label": "update"}}
        ]}"#,
    )
    .unwrap();
    runtime.deploy(spec).await.unwrap();
    let definition = runtime.store().get_definition("tp04").await.unwrap().unwrap();
    let instance = runtime
        .registry()
        .start_instance(&definition, "admin", json!({}))
        .await
        .unwrap();
    wait_for_descriptor(&runtime, "updates", &instance.instance_id).await;

    runtime
        .bus()
        .publish(topics::update("tp04"), json!({"priority": "high"}))
        .unwrap();
    let (label, message) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(label, "update");
    assert_eq!(message.instance_id(), Some(instance.instance_id.as_str()));
    assert_eq!(message.payload, json!({"priority": "high"}));

    runtime
        .bus()
        .publish(topics::update(&instance.instance_id), json!({"floor": 2}))
        .unwrap();
    let (_, message) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, json!({"floor": 2}));

    // Nothing live for other definitions
    runtime
        .bus()
        .publish(topics::update("tp05"), json!({}))
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .is_err());
}
