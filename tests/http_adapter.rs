//! Integration tests for the HTTP request/response adapter.
//!
//! A small axum application stands in for a tool server so discovery, the
//! health probe and every reply class of the wire contract are exercised
//! over a real loopback socket.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mockable::DefaultClock;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use toolmesh::config::GatewayConfig;
use toolmesh::gateway::adapters::HttpToolTransport;
use toolmesh::gateway::domain::{ServerId, ServerStatus, ToolName};
use toolmesh::gateway::services::{InvocationError, ToolGateway};

async fn info() -> Json<Value> {
    Json(json!({
        "id": "http-echo",
        "name": "HTTP echo server",
        "capacity": 2,
        "tools": [
            {
                "name": "echo",
                "description": "Echoes its arguments",
                "input_schema": {"type": "object", "required": ["text"]}
            },
            {"name": "picky", "description": "Rejects everything"},
            {"name": "broken", "description": "Always fails"},
            {"name": "slow", "description": "Never answers in time"}
        ]
    }))
}

async fn call(Path(name): Path<String>, Json(args): Json<Value>) -> Response {
    match name.as_str() {
        "echo" => Json(json!({"echoed": args})).into_response(),
        "picky" => (StatusCode::UNPROCESSABLE_ENTITY, "text is too long").into_response(),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "backend exploded").into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

struct ToolServer {
    base_url: String,
    healthy: Arc<AtomicBool>,
}

async fn spawn_tool_server() -> ToolServer {
    let healthy = Arc::new(AtomicBool::new(true));
    let health_flag = Arc::clone(&healthy);
    let app = Router::new()
        .route("/info", get(info))
        .route(
            "/health",
            get(move || {
                let flag = Arc::clone(&health_flag);
                async move {
                    if flag.load(Ordering::Acquire) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        )
        .route("/tools/{name}", post(call));

    ToolServer {
        base_url: serve(app).await,
        healthy,
    }
}

/// Serves a single `lookup` tool as `id`; an overloaded server answers every
/// call with 503.
async fn spawn_lookup_server(id: &'static str, overloaded: bool) -> String {
    let app = Router::new()
        .route(
            "/info",
            get(move || async move {
                Json(json!({
                    "id": id,
                    "tools": [{"name": "lookup", "description": "Looks things up"}]
                }))
            }),
        )
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/tools/{name}",
            post(move || async move {
                if overloaded {
                    (StatusCode::SERVICE_UNAVAILABLE, "shedding load").into_response()
                } else {
                    Json(json!({"served_by": id})).into_response()
                }
            }),
        );
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let address = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("tool server runs");
    });
    format!("http://{address}")
}

fn gateway() -> ToolGateway<HttpToolTransport, DefaultClock> {
    let mut config = GatewayConfig::default();
    config.health.degrade_after = 1;
    ToolGateway::new(
        Arc::new(HttpToolTransport::new()),
        Arc::new(DefaultClock),
        config,
    )
}

fn tool(name: &str) -> ToolName {
    ToolName::new(name).expect("valid tool name")
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_and_invocation_follow_the_wire_contract() {
    let server = spawn_tool_server().await;
    let gateway = gateway();

    let report = gateway.discover_from_endpoints([server.base_url.clone()]).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let record = report.accepted.first().expect("server discovered");
    assert_eq!(record.id().as_str(), "http-echo");
    assert_eq!(record.capacity(), 2);
    assert_eq!(record.status(), ServerStatus::Active);

    let response = gateway
        .invoke_within(&tool("echo"), json!({"text": "hi"}), Duration::from_secs(2))
        .await
        .expect("echo succeeds");
    assert_eq!(response.value, json!({"echoed": {"text": "hi"}}));

    let missing = gateway
        .invoke_within(&tool("echo"), json!({}), Duration::from_secs(2))
        .await;
    assert!(matches!(missing, Err(InvocationError::Validation { .. })));

    let rejected = gateway
        .invoke_within(&tool("picky"), json!({}), Duration::from_secs(2))
        .await;
    assert!(
        matches!(rejected, Err(InvocationError::Validation { ref reason, .. }) if reason == "text is too long")
    );

    let failed = gateway
        .invoke_within(&tool("broken"), json!({}), Duration::from_secs(2))
        .await;
    assert!(matches!(
        failed,
        Err(InvocationError::Application { code: 500, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn deadlines_abort_slow_calls() {
    let server = spawn_tool_server().await;
    let gateway = gateway();
    gateway.discover_from_endpoints([server.base_url.clone()]).await;

    let started = tokio::time::Instant::now();
    let result = gateway
        .invoke_within(&tool("slow"), json!({}), Duration::from_millis(200))
        .await;

    assert!(matches!(
        result,
        Err(InvocationError::Timeout { attempts: 1, .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_health_endpoint_degrades_the_server() {
    let server = spawn_tool_server().await;
    let gateway = gateway();
    gateway.discover_from_endpoints([server.base_url.clone()]).await;
    let id = ServerId::new("http-echo").expect("valid id");

    server.healthy.store(false, Ordering::Release);
    gateway.run_health_cycle().await;
    assert_eq!(
        gateway.server(&id).map(|record| record.status()),
        Some(ServerStatus::Degraded)
    );

    server.healthy.store(true, Ordering::Release);
    gateway.run_health_cycle().await;
    assert_eq!(
        gateway.server(&id).map(|record| record.status()),
        Some(ServerStatus::Active)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_endpoints_are_reported_not_raised() {
    let gateway = gateway();

    let report = gateway
        .discover_from_endpoints(["http://127.0.0.1:9", "tcp://"])
        .await;

    assert!(report.accepted.is_empty());
    assert_eq!(report.failures.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn overloaded_providers_are_failed_over() {
    let busy = spawn_lookup_server("busy", true).await;
    let spare = spawn_lookup_server("spare", false).await;
    let gateway = gateway();
    let report = gateway.discover_from_endpoints([busy, spare]).await;
    assert_eq!(report.accepted.len(), 2, "{:?}", report.failures);

    for _ in 0..4 {
        let response = gateway
            .invoke_within(&tool("lookup"), json!({}), Duration::from_secs(2))
            .await
            .expect("a 503 is retried on the spare provider");
        assert_eq!(response.value, json!({"served_by": "spare"}));
    }

    let busy_id = ServerId::new("busy").expect("valid id");
    assert!(gateway.failover_counts().get(&busy_id).copied().unwrap_or_default() > 0);
}
