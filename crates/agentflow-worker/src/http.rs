//! Embedded HTTP status server
//!
//! Exposes `GET /health` and `GET /status` for liveness probes and
//! operator inspection. Binding scans ports from the configured base,
//! incrementing on address-in-use up to the configured attempt count.

use std::io;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

use crate::service::{WorkerError, WorkerService};

/// Bind the status server, scanning ports from `base_port`. Returns the
/// serve task handle and the bound port.
pub async fn start_status_server(
    service: Arc<WorkerService>,
    base_port: u16,
    max_attempts: u16,
) -> Result<(JoinHandle<()>, u16), WorkerError> {
    for attempt in 0..max_attempts {
        let port = base_port.saturating_add(attempt);
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                let app = router(Arc::clone(&service));
                let handle = tokio::spawn(async move {
                    let _ = axum::serve(listener, app).await;
                });
                info!(port, "status server listening");
                return Ok((handle, port));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(WorkerError::Io(e)),
        }
    }

    Err(WorkerError::PortScan {
        start: base_port,
        end: base_port.saturating_add(max_attempts),
    })
}

fn router(service: Arc<WorkerService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .fallback(not_found)
        .with_state(service)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn status(State(service): State<Arc<WorkerService>>) -> Json<serde_json::Value> {
    Json(service.status_snapshot())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
}
