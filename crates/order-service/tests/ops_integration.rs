//! Integration tests for the ops surface and the background wiring.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::CustomerId;
use domain::{
    Money, ORDER_CREATED_TOPIC, OrderItem, OrderStatus, PAYMENT_TIMEOUT_TOPIC, ShippingAddress,
};
use fulfillment::CreateOrderRequest;
use fulfillment::services::InMemoryStockService;
use metrics_exporter_prometheus::PrometheusHandle;
use order_service::{Backends, Config, ControlPlane};
use order_store::{InMemoryMessageBus, InMemoryOrderStore};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn test_config() -> Config {
    Config {
        shard_count: 2,
        wheel_tick: Duration::from_millis(10),
        wheel_slots: 64,
        outbox_poll: Duration::from_millis(20),
        rehydrate_grace: Duration::ZERO,
        ..Config::default()
    }
}

async fn start_plane(backends: Backends) -> ControlPlane<InMemoryOrderStore> {
    let config = test_config();
    let store = Arc::new(InMemoryOrderStore::new(config.shard_count).unwrap());
    ControlPlane::start(&config, store, backends).await.unwrap()
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, String, Option<String>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap(), content_type)
}

fn checkout(customer: i64) -> CreateOrderRequest {
    CreateOrderRequest::new(
        CustomerId::new(customer),
        vec![OrderItem::new("P-1", "SKU-1", "Mug", 2, Money::from_minor(500))],
        ShippingAddress {
            receiver: "Sam".into(),
            phone: "555-0100".into(),
            city: "Porto".into(),
            detail: "Rua 1".into(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_health_reports_running_wheel() {
    let plane = start_plane(Backends::in_memory()).await;
    let app = order_service::create_app(plane.ops_state(), get_metrics_handle());

    let (status, body, _) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["shards"], 2);
    assert_eq!(json["pending_timeouts"], 0);
    assert_eq!(json["wheel_running"], true);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_degraded_after_shutdown() {
    let plane = start_plane(Backends::in_memory()).await;
    let state = plane.ops_state();
    plane.shutdown().await.unwrap();

    let app = order_service::create_app(state, get_metrics_handle());
    let (status, body, _) = get(app, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["wheel_running"], false);
}

#[tokio::test]
async fn test_metrics_endpoint_content_type() {
    let plane = start_plane(Backends::in_memory()).await;
    let app = order_service::create_app(plane.ops_state(), get_metrics_handle());

    let (status, body, content_type) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        content_type.as_deref(),
        Some("text/plain; version=0.0.4; charset=utf-8")
    );
    assert!(body.contains("timeout_wheel_running"));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let plane = start_plane(Backends::in_memory()).await;
    let app = order_service::create_app(plane.ops_state(), get_metrics_handle());

    let (status, _, _) = get(app, "/orders").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checkout_runs_saga_and_relays_outbox() {
    let handle = get_metrics_handle();
    let bus = Arc::new(InMemoryMessageBus::new());
    let backends = Backends {
        stock: Arc::new(InMemoryStockService::new().with_stock("SKU-1", 10)),
        bus: bus.clone(),
        ..Backends::in_memory()
    };
    let plane = start_plane(backends).await;

    let order = plane.coordinator().create_order(checkout(7)).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Allocating);
    assert!(plane.wheel().is_scheduled(&order.order_no().to_string()));

    // The saga worker confirms the order once the stock deduction succeeds.
    let mut status = order.status();
    for _ in 0..100 {
        status = plane
            .coordinator()
            .orders()
            .get(order.order_no())
            .await
            .unwrap()
            .status();
        if status == OrderStatus::PendingPayment {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, OrderStatus::PendingPayment);

    // The relay delivers both events written with the order.
    let mut topics = Vec::new();
    for _ in 0..100 {
        topics = bus.delivered_topics();
        if topics.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        topics,
        vec![
            ORDER_CREATED_TOPIC.to_string(),
            PAYMENT_TIMEOUT_TOPIC.to_string()
        ]
    );
    assert!(
        bus.delivered()
            .iter()
            .all(|m| m.dedup_key == order.order_no().to_string())
    );

    let app = order_service::create_app(plane.ops_state(), handle);
    let (_, body, _) = get(app, "/metrics").await;
    assert!(body.contains("orders_created_total"));

    plane.shutdown().await.unwrap();
}
