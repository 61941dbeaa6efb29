use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_helpers::env::{ConfigError, EnvSource};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

const API_KEY_HEADER: &str = "access_token";

/// Liveness and readiness reported by a bus worker for the status
/// endpoints.
#[async_trait]
pub trait WorkerStatus: Send + Sync {
    /// Whether the worker finished its startup sequence.
    fn ready(&self) -> bool;
    /// Whether the worker is currently running and can reach the Redis
    /// data plane.
    async fn is_running(&self) -> bool;
}

impl Debug for dyn WorkerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "WorkerStatus")
    }
}

/// Configuration for the status endpoint server, present only when the
/// host, port and API key are all provided by the environment.
#[derive(Debug, Clone)]
pub struct StatusEndpointConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
}

impl StatusEndpointConfig {
    /// Reads status endpoint configuration from the environment. Returns
    /// `None` when any of the three variables is absent, the status server
    /// is an opt-in surface.
    pub fn from_env(env: &EnvSource) -> Result<Option<Self>, ConfigError> {
        let host = env.var("STATUS_ENDPOINT_HOST");
        let port = env.var("STATUS_ENDPOINT_PORT");
        let api_key = env.var("STATUS_ENDPOINT_API_KEY");

        match (host, port, api_key) {
            (Some(host), Some(port), Some(api_key)) => {
                let port = port.parse().map_err(|_| ConfigError::InvalidVar {
                    var: "STATUS_ENDPOINT_PORT",
                    reason: "must be a valid port number".to_string(),
                })?;
                Ok(Some(StatusEndpointConfig {
                    host,
                    port,
                    api_key,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResponseMessage {
    pub message: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LiveResponse {
    pub alive: bool,
}

struct StatusAppState {
    api_key: String,
    workers: Vec<Arc<dyn WorkerStatus>>,
}

/// Creates the status endpoint router reporting the combined state of the
/// given workers.
pub fn create_status_router(api_key: String, workers: Vec<Arc<dyn WorkerStatus>>) -> Router {
    let shared_state = Arc::new(StatusAppState { api_key, workers });
    Router::new()
        .route("/status/ready", get(status_ready_handler))
        .route("/status/live", get(status_live_handler))
        .with_state(shared_state)
}

/// Serves the status endpoints until shutdown is broadcast.
pub async fn start_status_server(
    config: StatusEndpointConfig,
    workers: Vec<Arc<dyn WorkerStatus>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let router = create_status_router(config.api_key.clone(), workers);
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!("starting status endpoint server on {local_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
}

/// Request handler for readiness checks. Reports not ready when any
/// registered worker has not finished starting up.
async fn status_ready_handler(
    State(state): State<Arc<StatusAppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&state, &headers) {
        return denied;
    }
    for worker in &state.workers {
        if !worker.ready() {
            return Json(ReadyResponse { ready: false }).into_response();
        }
    }
    Json(ReadyResponse { ready: true }).into_response()
}

/// Request handler for liveness checks. Reports not alive when any
/// registered worker has stopped or lost its Redis connection.
async fn status_live_handler(
    State(state): State<Arc<StatusAppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authenticate(&state, &headers) {
        return denied;
    }
    for worker in &state.workers {
        if !worker.is_running().await {
            return Json(LiveResponse { alive: false }).into_response();
        }
    }
    Json(LiveResponse { alive: true }).into_response()
}

fn authenticate(state: &StatusAppState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided != Some(state.api_key.as_str()) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ResponseMessage {
                message: "Could not validate key".to_string(),
            }),
        )
            .into_response());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;

    use super::*;

    struct StubWorker {
        ready: bool,
        running: bool,
    }

    #[async_trait]
    impl WorkerStatus for StubWorker {
        fn ready(&self) -> bool {
            self.ready
        }

        async fn is_running(&self) -> bool {
            self.running
        }
    }

    async fn serve_status(workers: Vec<Arc<dyn WorkerStatus>>) -> std::net::SocketAddr {
        let router = create_status_router("test-api-key".to_string(), workers);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn http_client(
    ) -> hyper_util::client::legacy::Client<hyper_util::client::legacy::connect::HttpConnector, Body>
    {
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build_http()
    }

    #[test_log::test(tokio::test)]
    async fn test_reports_ready_and_alive_with_healthy_workers() {
        let addr = serve_status(vec![
            Arc::new(StubWorker {
                ready: true,
                running: true,
            }),
            Arc::new(StubWorker {
                ready: true,
                running: true,
            }),
        ])
        .await;
        let client = http_client();

        let response = client
            .request(
                Request::builder()
                    .uri(format!("http://{addr}/status/ready"))
                    .header(API_KEY_HEADER, "test-api-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let ready: ReadyResponse = serde_json::from_slice(&body).unwrap();
        assert!(ready.ready);

        let response = client
            .request(
                Request::builder()
                    .uri(format!("http://{addr}/status/live"))
                    .header(API_KEY_HEADER, "test-api-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let live: LiveResponse = serde_json::from_slice(&body).unwrap();
        assert!(live.alive);
    }

    #[test_log::test(tokio::test)]
    async fn test_reports_degraded_state_when_any_worker_is_unhealthy() {
        let addr = serve_status(vec![
            Arc::new(StubWorker {
                ready: true,
                running: true,
            }),
            Arc::new(StubWorker {
                ready: false,
                running: false,
            }),
        ])
        .await;
        let client = http_client();

        let response = client
            .request(
                Request::builder()
                    .uri(format!("http://{addr}/status/ready"))
                    .header(API_KEY_HEADER, "test-api-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let ready: ReadyResponse = serde_json::from_slice(&body).unwrap();
        assert!(!ready.ready);

        let response = client
            .request(
                Request::builder()
                    .uri(format!("http://{addr}/status/live"))
                    .header(API_KEY_HEADER, "test-api-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let live: LiveResponse = serde_json::from_slice(&body).unwrap();
        assert!(!live.alive);
    }

    #[test_log::test(tokio::test)]
    async fn test_rejects_missing_or_wrong_api_key() {
        let addr = serve_status(vec![Arc::new(StubWorker {
            ready: true,
            running: true,
        })])
        .await;
        let client = http_client();

        let response = client
            .request(
                Request::builder()
                    .uri(format!("http://{addr}/status/ready"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 403);

        let response = client
            .request(
                Request::builder()
                    .uri(format!("http://{addr}/status/live"))
                    .header(API_KEY_HEADER, "wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 403);
    }
}
