//! Common test utilities for bank-service integration tests.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bank_service::services::{Database, InMemoryStore, LedgerStore};
use bank_service::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::{Arc, Once};
use std::time::Duration;
use tower::ServiceExt;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,bank_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Router backed by a fresh in-memory store.
pub fn memory_app() -> Router {
    init_tracing();
    let store: Arc<dyn LedgerStore> = Arc::new(InMemoryStore::new());
    build_router(AppState::new(store, Duration::from_secs(5), "test"))
}

/// Connects to `TEST_DATABASE_URL`, migrates, and empties every table.
pub async fn postgres_store() -> Database {
    init_tracing();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run PostgreSQL tests");

    let db = Database::new(&database_url, 5, 1, Duration::from_secs(2))
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    sqlx::query("TRUNCATE entries, transfers, accounts RESTART IDENTITY CASCADE")
        .execute(db.pool())
        .await
        .expect("Failed to reset tables");

    db
}

/// Sends one request through the router and decodes the JSON body
/// (`Value::Null` for empty or non-JSON bodies).
pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}
