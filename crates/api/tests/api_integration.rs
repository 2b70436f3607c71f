//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::AppState;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use inventory::{Clock, SystemClock};
use inventory_store::InMemoryInventoryStore;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> axum::Router {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::new(
        InMemoryInventoryStore::new(),
        clock,
        &Config::default(),
    ));
    api::create_app(state, get_metrics_handle())
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn seed(app: &axum::Router, sku: &str, quantity: i64) {
    let response = send(
        app,
        "POST",
        &format!("/stock/{sku}/receipts"),
        Some(json!({"quantity": quantity, "reference_id": format!("po-{sku}")})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

async fn reserve(app: &axum::Router, order_id: &str, sku: &str, quantity: i64) -> Response {
    send(
        app,
        "POST",
        "/reservations",
        Some(json!({"order_id": order_id, "sku": sku, "quantity": quantity})),
    )
    .await
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let response = send(&app, "GET", "/health", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["saga_workers"], 16);
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let app = setup();

    let response = send(&app, "GET", "/metrics", None).await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_receipt_then_stock_level() {
    let app = setup();
    seed(&app, "SKU-001", 10).await;

    let response = send(&app, "GET", "/stock/SKU-001", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["available"], 10);
    assert_eq!(json["reserved"], 0);
}

#[tokio::test]
async fn test_unknown_sku_is_not_found() {
    let app = setup();

    let response = send(&app, "GET", "/stock/NOPE", None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn test_reserve_then_confirm() {
    let app = setup();
    seed(&app, "SKU-001", 10).await;

    let response = reserve(&app, "ORD-1", "SKU-001", 4).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let reservation = json_body(response).await;
    let id = reservation["id"].as_str().unwrap().to_string();
    assert_eq!(reservation["status"], "ACTIVE");

    let response = send(&app, "POST", &format!("/reservations/{id}/confirm"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "CONFIRMED");

    let level = json_body(send(&app, "GET", "/stock/SKU-001", None).await).await;
    assert_eq!((level["available"].as_i64(), level["reserved"].as_i64()), (Some(6), Some(0)));
}

#[tokio::test]
async fn test_insufficient_stock_is_conflict() {
    let app = setup();
    seed(&app, "SKU-001", 2).await;

    let response = reserve(&app, "ORD-1", "SKU-001", 3).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("Insufficient stock"));
}

#[tokio::test]
async fn test_cancel_releases_and_confirm_after_cancel_conflicts() {
    let app = setup();
    seed(&app, "SKU-001", 5).await;
    let reservation = json_body(reserve(&app, "ORD-1", "SKU-001", 5).await).await;
    let id = reservation["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        "POST",
        &format!("/reservations/{id}/cancel"),
        Some(json!({"reason": "customer changed mind"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "CANCELLED");

    let response = send(&app, "POST", &format!("/reservations/{id}/confirm"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let level = json_body(send(&app, "GET", "/stock/SKU-001", None).await).await;
    assert_eq!(level["available"], 5);
}

#[tokio::test]
async fn test_out_of_range_ttl_is_bad_request_and_holds_nothing() {
    let app = setup();
    seed(&app, "SKU-001", 5).await;

    for ttl_secs in [i64::MAX, 10_000_000_000_000, 0] {
        let response = send(
            &app,
            "POST",
            "/reservations",
            Some(json!({"order_id": "ORD-1", "sku": "SKU-001", "quantity": 3, "ttl_secs": ttl_secs})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "ttl_secs {ttl_secs}");
    }

    let level = json_body(send(&app, "GET", "/stock/SKU-001", None).await).await;
    assert_eq!((level["available"].as_i64(), level["reserved"].as_i64()), (Some(5), Some(0)));
}

#[tokio::test]
async fn test_invalid_reservation_id_format() {
    let app = setup();

    let response = send(&app, "GET", "/reservations/not-a-uuid", None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_adjustment_overwrites_available() {
    let app = setup();
    seed(&app, "SKU-001", 10).await;

    let response = send(
        &app,
        "PUT",
        "/stock/SKU-001/adjustment",
        Some(json!({"available": 7, "reason": "cycle count"})),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!((json["before"].as_i64(), json["after"].as_i64()), (Some(10), Some(7)));
}

#[tokio::test]
async fn test_order_event_runs_saga_once() {
    let app = setup();
    seed(&app, "SKU-001", 10).await;
    let event = json!({
        "event_id": "7f1c1b1e-3c1a-4a55-9b7e-1f0f2a3b4c5d",
        "event_type": "OrderCreated",
        "partition_key": "ORD-42",
        "payload": {
            "order_id": "ORD-42",
            "line_items": [{"sku": "SKU-001", "quantity": 3}]
        }
    });

    let first = send(&app, "POST", "/events", Some(event.clone())).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(json_body(first).await["disposition"], "applied");
    let second = send(&app, "POST", "/events", Some(event)).await;
    assert_eq!(json_body(second).await["disposition"], "duplicate");

    let response = send(&app, "GET", "/orders/ORD-42/sagas", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let sagas = json_body(response).await;
    assert_eq!(sagas.as_array().unwrap().len(), 1);
    assert_eq!(sagas[0]["status"], "COMPLETED");
    let level = json_body(send(&app, "GET", "/stock/SKU-001", None).await).await;
    assert_eq!(level["reserved"], 3);
}

#[tokio::test]
async fn test_unknown_event_type_is_unprocessable() {
    let app = setup();

    let response = send(
        &app,
        "POST",
        "/events",
        Some(json!({
            "event_id": "0b3f9a52-8d2e-4c41-a7f6-5e4d3c2b1a09",
            "event_type": "PaymentCaptured",
            "payload": {}
        })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(response).await["disposition"], "rejected");
}

#[tokio::test]
async fn test_sagas_for_unknown_order_not_found() {
    let app = setup();

    let response = send(&app, "GET", "/orders/ORD-NONE/sagas", None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
