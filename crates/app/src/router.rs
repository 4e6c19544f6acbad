use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use shopfront_mercadopago::MercadoPagoClient;
use shopfront_storage::Database;

use crate::{telemetry, webhook};

/// Maximum accepted webhook body; larger payloads are rejected with 413
/// before the handler runs.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Arc<[u8]>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    mercadopago: MercadoPagoClient,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Arc<[u8]>,
        mercadopago: MercadoPagoClient,
    ) -> Self {
        Self {
            metrics,
            storage,
            webhook_secret,
            clock: Arc::new(Utc::now),
            mercadopago,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> Arc<[u8]> {
        self.webhook_secret.clone()
    }

    pub fn mercadopago(&self) -> &MercadoPagoClient {
        &self.mercadopago
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/webhooks/mercadopago", post(webhook::handle))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use http_body_util::BodyExt;
    use reqwest::Client;
    use tower::ServiceExt;
    use url::Url;

    async fn setup_state(db_name: &str) -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect(&format!(
            "sqlite:file:{db_name}?mode=memory&cache=shared"
        ))
        .await
        .expect("connect");
        database.run_migrations().await.expect("migrations");

        let secret: Arc<[u8]> = Arc::from(b"test-secret".to_vec().into_boxed_slice());
        let mercadopago = MercadoPagoClient::new(
            "access-token",
            Url::parse("https://api.mercadopago.com/").expect("url"),
            Client::builder().build().expect("client"),
        );
        AppState::new(metrics, database, secret, mercadopago)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(setup_state("router_healthz").await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(setup_state("router_metrics").await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn webhook_route_only_accepts_post() {
        let app = app_router(setup_state("router_methods").await);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/webhooks/mercadopago")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_the_handler() {
        let app = app_router(setup_state("router_body_limit").await);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/webhooks/mercadopago")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(vec![b' '; MAX_BODY_BYTES + 1]))
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
