//! Control-plane requests driven through the HTTP handler on an in-memory runtime

use chrono::{Duration as ChronoDuration, Utc};
use hyper::{Body, Method, Request, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use taskpack_core::{
    topics, GateAction, Instance, LifecycleStatus, Runtime, RuntimeConfig, SqliteTaskStore,
    TerminalRequest, TopicFilter,
};
use taskpack_daemon::config::AuthConfig;
use taskpack_daemon::{handle_request, AppState, IdentityGate, MetricsCollector, TaskPackageApi};

struct Harness {
    state: Arc<AppState>,
    runtime: Arc<Runtime>,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
        store
            .upsert_definition("tp01", "Room cleaning", None, None)
            .await
            .unwrap();
        store
            .upsert_definition("tp02", "Linen change", None, None)
            .await
            .unwrap();
        let runtime = Arc::new(Runtime::new(store, RuntimeConfig::default()));
        let api = TaskPackageApi::new(
            runtime.clone(),
            Arc::new(IdentityGate::new(&AuthConfig::default()).unwrap()),
            Arc::new(MetricsCollector::new().unwrap()),
            Duration::from_secs(5),
        );
        Harness {
            state: Arc::new(AppState::new(Arc::new(api))),
            runtime,
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("Content-Type", "application/json")
            .body(body)
            .unwrap();
        let response = handle_request(req, self.state.clone()).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn start(&self, definition_id: &str, payload: Value) -> String {
        let mut body = payload;
        body["definition_id"] = json!(definition_id);
        let (status, value) = self
            .call(Method::POST, "/task-package/start", Some(body))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", value);
        value["instance_id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn test_start_persists_and_publishes_create() {
    let harness = Harness::new().await;
    let mut creates = harness
        .runtime
        .bus()
        .subscribe(TopicFilter::Prefix("task-package/create/".into()));

    let instance_id = harness.start("tp01", json!({"room": "101"})).await;
    assert!(uuid::Uuid::parse_str(&instance_id).is_ok());

    let row = harness.runtime.registry().get(&instance_id).await.unwrap();
    assert_eq!(row.lifecycle_status, LifecycleStatus::Created);
    assert_eq!(row.principal, "admin");
    assert_eq!(row.cached_display_name, "Room cleaning");

    let event = tokio::time::timeout(Duration::from_secs(1), creates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.topic, topics::create("tp01"));
    assert_eq!(event.data["instance_id"], json!(instance_id));
    assert_eq!(event.data["principal"], "admin");
    assert_eq!(event.data["payload"], json!({"room": "101"}));
}

#[tokio::test]
async fn test_start_ids_are_unique() {
    let harness = Harness::new().await;
    let mut ids = HashSet::new();
    for _ in 0..20 {
        ids.insert(harness.start("tp01", json!({})).await);
    }
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn test_start_unknown_definition_is_not_found() {
    let harness = Harness::new().await;
    let (status, body) = harness
        .call(
            Method::POST,
            "/task-package/start",
            Some(json!({"definition_id": "tp99"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("tp99"));
}

#[tokio::test]
async fn test_cancel_then_repeat() {
    let harness = Harness::new().await;
    let instance_id = harness.start("tp01", json!({"room": "101"})).await;
    let mut cancels = harness
        .runtime
        .bus()
        .subscribe_topic(topics::cancel(&instance_id));

    let body = json!({"definition_id": "tp01", "instance_id": instance_id});
    let (status, first) = harness
        .call(Method::POST, "/task-package/cancel", Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "cancelling");
    assert!(first.get("message").is_none());
    assert!(cancels.try_recv().is_some());

    let before = harness.runtime.registry().get(&instance_id).await.unwrap();

    let (status, second) = harness
        .call(Method::POST, "/task-package/cancel", Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "cancelling");
    assert_eq!(second["message"], "Task is already being cancelled");
    assert!(cancels.try_recv().is_none());

    let after = harness.runtime.registry().get(&instance_id).await.unwrap();
    assert_eq!(before.updated_at, after.updated_at);
}

#[tokio::test]
async fn test_cancel_terminal_instance_conflicts() {
    let harness = Harness::new().await;
    let instance_id = harness.start("tp01", json!({})).await;
    harness
        .runtime
        .registry()
        .finish(&instance_id, TerminalRequest::Exit { cancelled: false })
        .await
        .unwrap();

    let (status, body) = harness
        .call(
            Method::POST,
            "/task-package/cancel",
            Some(json!({"definition_id": "tp01", "instance_id": instance_id})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["current_status"], "completed");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_status_by_id_and_by_filter() {
    let harness = Harness::new().await;
    let a = harness.start("tp01", json!({})).await;
    harness.start("tp02", json!({})).await;

    let (status, one) = harness
        .call(
            Method::GET,
            &format!("/task-package/status?instance_id={}", a),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["instance_id"], json!(a));
    assert_eq!(one["orphaned"], false);

    let (_, many) = harness
        .call(Method::GET, "/task-package/status?definition_id=tp02", None)
        .await;
    let rows = many.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["definition_id"], "tp02");

    let (status, _) = harness
        .call(
            Method::GET,
            "/task-package/status?lifecycle_status=sleeping",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rows_from_a_previous_run_are_orphaned() {
    let harness = Harness::new().await;
    let earlier = Utc::now() - ChronoDuration::hours(1);
    let stale = Instance {
        instance_id: "stale-1".to_string(),
        definition_id: "tp01".to_string(),
        cached_display_name: "Room cleaning".to_string(),
        principal: "admin".to_string(),
        lifecycle_status: LifecycleStatus::Ongoing,
        user_status: None,
        created_at: earlier,
        updated_at: earlier,
    };
    harness.runtime.store().insert_instance(&stale).await.unwrap();

    let (_, body) = harness
        .call(Method::GET, "/task-package/status?instance_id=stale-1", None)
        .await;
    assert_eq!(body["orphaned"], true);
    assert_eq!(body["lifecycle_status"], "ongoing");
}

#[tokio::test]
async fn test_info_lists_definitions() {
    let harness = Harness::new().await;
    let (status, body) = harness.call(Method::GET, "/task-package/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (_, one) = harness
        .call(Method::GET, "/task-package/info?definition_id=tp02", None)
        .await;
    assert_eq!(one["display_name"], "Linen change");
}

#[tokio::test]
async fn test_update_reaches_subscribers() {
    let harness = Harness::new().await;
    let mut updates = harness.runtime.bus().subscribe_topic(topics::update("tp01"));

    let (status, body) = harness
        .call(
            Method::POST,
            "/task-package/update",
            Some(json!({"definition_id": "tp01", "priority": "high"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["topic"], "task-package/update/tp01");
    assert_eq!(body["listeners"], 1);

    let event = updates.try_recv().unwrap();
    assert_eq!(event.data, json!({"priority": "high"}));
}

#[tokio::test]
async fn test_bulk_mode_disable() {
    let harness = Harness::new().await;
    let (status, body) = harness
        .call(
            Method::POST,
            "/task-package/edt/mode/disable",
            Some(json!({
                "scope": "bed_monitoring",
                "entity_ids": ["bed_1", "bed_2"],
                "reason": "night shift"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    let results = body["results"].as_array().unwrap();
    assert!(results.iter().all(|r| r["enabled"] == false));
    assert!(results.iter().all(|r| r["updated_by"] == "admin"));

    let history = harness
        .runtime
        .gates()
        .history("bed_monitoring", None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|h| h.action == GateAction::Disable));

    let (_, row) = harness
        .call(
            Method::GET,
            "/task-package/edt/mode/status?scope=bed_monitoring&entity_id=bed_2",
            None,
        )
        .await;
    assert_eq!(row["enabled"], false);
    assert_eq!(row["reason"], "night shift");

    let (status, _) = harness
        .call(
            Method::POST,
            "/task-package/edt/mode/enable",
            Some(json!({"scope": "bed_monitoring", "entity_ids": []})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_routing_edges() {
    let harness = Harness::new().await;

    let (status, _) = harness.call(Method::OPTIONS, "/task-package/start", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = harness.call(Method::GET, "/task-package", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["routes"].as_array().unwrap().len() >= 8);

    let (status, _) = harness.call(Method::GET, "/task-package/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = harness.call(Method::GET, "/elsewhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/task-package/start")
        .body(Body::from("{not json"))
        .unwrap();
    let response = handle_request(req, harness.state.clone()).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("Access-Control-Allow-Origin").unwrap(),
        "*"
    );
}
