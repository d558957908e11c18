use incident_lifecycle::{
    IncidentService, SledRepository,
    api::{Decorator, Dispatcher, Method, PanicGuard, Request, Response},
    clock::SystemClock,
    config::ServiceConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::{TempDir, tempdir};

fn dispatcher() -> anyhow::Result<(TempDir, Dispatcher<SledRepository, SystemClock>)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("api.db"))?;
    let service = IncidentService::new(SledRepository::new(Arc::new(db)), ServiceConfig::default());
    Ok((temp_dir, Dispatcher::with_default_decorators(service)))
}

fn create(dispatcher: &Dispatcher<SledRepository, SystemClock>) -> anyhow::Result<String> {
    let response = dispatcher.dispatch(
        &Request::new(Method::Post, "/api/v1/incidents", "user_ops")
            .with_body(json!({ "title": "DB down", "severity": "high" })),
    );
    assert_eq!(response.status, 201, "{}", response.body);
    response.body["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no id in {}", response.body))
}

#[test]
fn full_flow_over_the_boundary() -> anyhow::Result<()> {
    let (_dir, dispatcher) = dispatcher()?;
    let id = create(&dispatcher)?;
    let path = |suffix: &str| format!("/incidents/{id}{suffix}");

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, path("/transition"), "user_ops")
            .with_body(json!({ "status": "in_progress" })),
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body["status"], "in_progress");
    assert_eq!(response.body["version"], 2);

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, path("/transition"), "user_ops")
            .with_body(json!({ "status": "closed" })),
    );
    assert_eq!(response.status, 422);
    assert_eq!(response.error_kind(), Some("invalid_transition"));

    let response = dispatcher.dispatch(&Request::new(Method::Post, path("/resolve"), "user_ops"));
    assert_eq!(response.status, 200);
    assert!(response.body["resolved_at"].is_string());

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, path("/assign"), "user_ops")
            .with_body(json!({ "assignee_id": "resp_a" })),
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body["value"]["assignee_id"], "resp_a");
    assert_eq!(response.body["incident"]["current_assignee_id"], "resp_a");

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, path("/comments"), "user_ops")
            .with_body(json!({ "body": "  " })),
    );
    assert_eq!(response.status, 400);
    assert_eq!(response.error_kind(), Some("invalid_input"));

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, path("/comments"), "user_ops")
            .with_body(json!({ "body": "fixed" })),
    );
    assert_eq!(response.status, 201);
    assert_eq!(response.body["value"]["body"], "fixed");

    let response = dispatcher.dispatch(&Request::new(Method::Get, path("/timeline"), "user_ops"));
    assert_eq!(response.status, 200);
    let kinds: Vec<&str> = response.body["items"]
        .as_array()
        .map(|items| items.iter().filter_map(|e| e["payload"]["type"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(
        kinds,
        vec![
            "created",
            "status_changed",
            "status_changed",
            "assigned",
            "comment_added"
        ]
    );
    assert!(response.body["next_cursor"].is_null());

    let response = dispatcher.dispatch(&Request::new(Method::Get, path("/comments"), "user_ops"));
    assert_eq!(response.body["items"][0]["body"], "fixed");

    let request = Request::new(Method::Get, path("/assignments"), "user_ops");
    let response = dispatcher.dispatch(&request);
    assert_eq!(response.body.as_array().map(Vec::len), Some(1));

    let response = dispatcher.dispatch(&Request::new(Method::Post, path("/unassign"), "user_ops"));
    assert_eq!(response.status, 200);
    assert!(response.body["incident"]["current_assignee_id"].is_null());

    let response = dispatcher.dispatch(&Request::new(Method::Post, path("/unassign"), "user_ops"));
    assert_eq!(response.status, 409);
    assert_eq!(response.error_kind(), Some("no_active_assignment"));

    Ok(())
}

#[test]
fn update_list_and_delete() -> anyhow::Result<()> {
    let (_dir, dispatcher) = dispatcher()?;
    let first = create(&dispatcher)?;
    let second = create(&dispatcher)?;

    let response = dispatcher.dispatch(
        &Request::new(Method::Put, format!("/incidents/{second}"), "user_ops")
            .with_body(json!({ "severity": "low", "description": "replica lag" })),
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body["severity"], "low");

    let response = dispatcher.dispatch(
        &Request::new(Method::Put, format!("/incidents/{second}"), "user_ops")
            .with_body(json!({ "priority": "p1" })),
    );
    assert_eq!(response.status, 400);

    let response = dispatcher.dispatch(
        &Request::new(Method::Get, "/incidents", "user_ops").with_query("severity", "high"),
    );
    assert_eq!(response.body["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(response.body["items"][0]["id"], first.as_str());

    let response = dispatcher.dispatch(
        &Request::new(Method::Get, "/incidents", "user_ops").with_query("limit", "1"),
    );
    let cursor = response.body["next_cursor"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("expected a cursor"))?
        .to_string();
    let response = dispatcher.dispatch(
        &Request::new(Method::Get, "/incidents", "user_ops")
            .with_query("limit", "1")
            .with_query("cursor", cursor),
    );
    assert_eq!(response.body["items"][0]["id"], second.as_str());

    let first_path = format!("/incidents/{first}");
    let response = dispatcher.dispatch(&Request::new(Method::Delete, &first_path, "user_ops"));
    assert_eq!(response.status, 200);
    let response = dispatcher.dispatch(&Request::new(Method::Get, &first_path, "user_ops"));
    assert_eq!(response.status, 404);
    assert_eq!(response.error_kind(), Some("not_found"));

    Ok(())
}

#[test]
fn routing_errors() -> anyhow::Result<()> {
    let (_dir, dispatcher) = dispatcher()?;

    let response = dispatcher.dispatch(&Request::new(Method::Get, "/tickets", "user_ops"));
    assert_eq!(response.status, 404);
    assert_eq!(response.error_kind(), Some("route_not_found"));

    let response = dispatcher.dispatch(&Request::new(Method::Put, "/incidents", "user_ops"));
    assert_eq!(response.status, 405);

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, "/incidents", "")
            .with_body(json!({ "title": "x", "severity": "low" })),
    );
    assert_eq!(response.status, 400);

    let response = dispatcher.dispatch(
        &Request::new(Method::Post, "/incidents", "user_ops")
            .with_body(json!({ "title": "x", "severity": "sev1" })),
    );
    assert_eq!(response.status, 400);

    Ok(())
}

struct Exploding;

impl Decorator for Exploding {
    fn handle(&self, _request: &Request, _next: &dyn Fn(&Request) -> Response) -> Response {
        panic!("boom")
    }
}

struct Counting(Arc<AtomicUsize>);

impl Decorator for Counting {
    fn handle(&self, request: &Request, next: &dyn Fn(&Request) -> Response) -> Response {
        self.0.fetch_add(1, Ordering::SeqCst);
        next(request)
    }
}

/// Rejects anonymous writes before they reach the service.
struct RequireActor;

impl Decorator for RequireActor {
    fn handle(&self, request: &Request, next: &dyn Fn(&Request) -> Response) -> Response {
        if request.method != Method::Get && request.actor_id.is_empty() {
            return Response {
                status: 401,
                body: json!({ "error": { "kind": "unauthenticated", "message": "no actor" } }),
            };
        }
        next(request)
    }
}

#[test]
fn decorators_run_in_order_and_contain_panics() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("decorators.db"))?;
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::new(IncidentService::new(
        SledRepository::new(Arc::new(db)),
        ServiceConfig::default(),
    ))
    .decorate(Counting(Arc::clone(&calls)))
    .decorate(RequireActor)
    .decorate(PanicGuard)
    .decorate(Exploding);

    let response = dispatcher.dispatch(&Request::new(Method::Post, "/incidents", ""));
    assert_eq!(response.status, 401);
    assert_eq!(response.error_kind(), Some("unauthenticated"));

    let response = dispatcher.dispatch(&Request::new(Method::Get, "/incidents", "user_ops"));
    assert_eq!(response.status, 500);
    assert_eq!(response.error_kind(), Some("internal"));

    assert_eq!(calls.load(Ordering::SeqCst), 2);

    Ok(())
}
