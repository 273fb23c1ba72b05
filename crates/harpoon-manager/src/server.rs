//! HTTP サーバー

use crate::error::{ManagerError, Result};
use crate::manager::{ContainerManager, StartResponse};
use crate::request::{StartRequest, StopRequest};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// `wait_for_server` の待ち時間
const SERVER_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn router(manager: Arc<ContainerManager>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/shutdown", get(shutdown))
        .route("/start_container", post(start_container))
        .route("/stop_container", post(stop_container))
        .fallback(not_found)
        .with_state(manager)
}

async fn version() -> &'static str {
    ContainerManager::version()
}

async fn shutdown(State(manager): State<Arc<ContainerManager>>) -> StatusCode {
    manager.shutdown().await;
    StatusCode::NO_CONTENT
}

async fn start_container(
    State(manager): State<Arc<ContainerManager>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StartResponse>> {
    let request = StartRequest::parse(&headers, &body)?;
    debug!(image = %request.image, ports = ?request.ports, "start_container");
    Ok(Json(manager.start(request).await?))
}

async fn stop_container(
    State(manager): State<Arc<ContainerManager>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let request = StopRequest::parse(&headers, &body)?;
    debug!(image = %request.image, "stop_container");
    manager.stop(request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn not_found(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("Not found: {}", uri.path()))
}

/// アドレスで待ち受ける（ポート 0 なら空きポート）
pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|e| ManagerError::Bind {
            address: address.to_string(),
            message: e.to_string(),
        })
}

/// `/shutdown` が呼ばれるまでリクエストを処理する
pub async fn serve(listener: TcpListener, manager: Arc<ContainerManager>) -> Result<()> {
    let address = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!(address = %address, "Container manager listening");

    let app = router(manager.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { manager.wait_for_shutdown().await })
        .await
        .map_err(|e| ManagerError::Bind {
            address,
            message: e.to_string(),
        })?;

    info!("Container manager stopped");
    Ok(())
}

/// サーバーが接続を受け付けるまで待つ
pub async fn wait_for_server(address: SocketAddr) -> bool {
    let deadline = Instant::now() + SERVER_WAIT_TIMEOUT;
    loop {
        if TcpStream::connect(address).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            debug!(address = %address, "Server did not come up in time");
            return false;
        }
        sleep(SERVER_POLL_INTERVAL).await;
    }
}
