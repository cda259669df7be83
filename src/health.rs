// Health endpoint - Fixed-response liveness check over HTTP

use crate::coordinator::{Coordinator, UnitReport};
use crate::error::{Result, SidecarError};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Default address for the liveness endpoint
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Body of `GET /status`
#[derive(Debug, Serialize)]
struct StatusBody {
    version: String,
    units: Vec<UnitReport>,
}

/// Liveness listener
///
/// `GET /healthz` always answers `200 OK`. `GET /status` returns the cached
/// unit snapshots as JSON without querying any unit.
pub struct HealthServer {
    listener: TcpListener,
    coordinator: Coordinator,
}

impl HealthServer {
    /// Bind the listener
    pub async fn bind(addr: &str, coordinator: Coordinator) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SidecarError::HealthServer(format!("Failed to bind {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            "Health endpoint listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );

        let app = router(self.coordinator);
        if let Err(e) = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::warn!("Health endpoint failed: {}", e);
        }

        tracing::debug!("Health endpoint stopped");
    }
}

fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(coordinator)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn status(State(coordinator): State<Coordinator>) -> Json<StatusBody> {
    Json(StatusBody {
        version: coordinator.version().to_string(),
        units: coordinator.list().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Registry;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                format!(
                    "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                    method, path
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn serve() -> (SocketAddr, CancellationToken) {
        let coordinator = Coordinator::with_defaults(Arc::new(Registry::new()));
        let server = HealthServer::bind("127.0.0.1:0", coordinator).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (addr, shutdown) = serve().await;

        let response = request(addr, "GET", "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("\r\n\r\nOK"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_status_returns_json() {
        let (addr, shutdown) = serve().await;

        let response = request(addr, "GET", "/status").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("application/json"));
        assert!(response.contains("\"units\":[]"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (addr, shutdown) = serve().await;

        let response = request(addr, "GET", "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wrong_method_is_rejected() {
        let (addr, shutdown) = serve().await;

        let response = request(addr, "POST", "/healthz").await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let coordinator = Coordinator::with_defaults(Arc::new(Registry::new()));
        let server = HealthServer::bind("127.0.0.1:0", coordinator).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("health endpoint did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let coordinator = Coordinator::with_defaults(Arc::new(Registry::new()));
        let first = HealthServer::bind("127.0.0.1:0", coordinator.clone()).await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        let result = HealthServer::bind(&addr, coordinator).await;
        assert!(matches!(result, Err(SidecarError::HealthServer(_))));
    }
}
