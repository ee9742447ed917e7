//! Loopback control interface.
//!
//! A small HTTP surface for the tray UI and the CLI: health, status,
//! statistics, and the blocking toggle. The loopback binding is the trust
//! boundary — there is no authentication, but requests from non-loopback
//! peers are rejected outright and responses carry conservative headers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::filter::BlocklistHandle;
use crate::stats::Stats;

/// A toggle request forwarded to the lifecycle manager, which owns the
/// configurator and serializes all toggles.
pub struct ToggleRequest {
    pub reply: oneshot::Sender<Result<bool, String>>,
}

#[derive(Clone)]
pub struct ControlState {
    pub stats: Arc<Stats>,
    pub blocklist: Arc<BlocklistHandle>,
    pub is_blocking: Arc<AtomicBool>,
    pub blocking_method: &'static str,
    pub toggle_tx: mpsc::Sender<ToggleRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    is_running: bool,
    is_blocking: bool,
    domains_in_list: usize,
    queries_seen: u64,
    queries_blocked: u64,
    queries_allowed: u64,
    blocking_method: &'static str,
    uptime: u64,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/toggle", post(toggle))
        .layer(middleware::from_fn(require_loopback))
        .layer(middleware::from_fn(conservative_headers))
        .with_state(state)
}

/// Serve the control interface on an already-bound loopback listener.
pub async fn serve(listener: TcpListener, state: ControlState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn require_loopback(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if peer.ip().is_loopback() {
        next.run(request).await
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

async fn conservative_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

async fn health(State(state): State<ControlState>) -> Json<serde_json::Value> {
    let snapshot = state.stats.snapshot();
    Json(json!({
        "status": "ok",
        "uptime": snapshot.uptime_secs,
        "pid": std::process::id(),
    }))
}

async fn status(State(state): State<ControlState>) -> Json<StatusResponse> {
    let snapshot = state.stats.snapshot();
    Json(StatusResponse {
        is_running: true,
        is_blocking: state.is_blocking.load(Ordering::Relaxed),
        domains_in_list: state.blocklist.current().len(),
        queries_seen: snapshot.queries,
        queries_blocked: snapshot.blocked,
        queries_allowed: snapshot.allowed,
        blocking_method: state.blocking_method,
        uptime: snapshot.uptime_secs,
    })
}

async fn stats(State(state): State<ControlState>) -> Json<crate::stats::StatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn toggle(State(state): State<ControlState>) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .toggle_tx
        .send(ToggleRequest { reply: reply_tx })
        .await
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "daemon is shutting down").into_response();
    }

    match reply_rx.await {
        Ok(Ok(is_blocking)) => Json(json!({ "isBlocking": is_blocking })).into_response(),
        // Prior state is untouched on failure; report what went wrong.
        Ok(Err(message)) => (StatusCode::INTERNAL_SERVER_ERROR, message).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "daemon is shutting down").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Blocklist;
    use axum::body::Body;
    use http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_state() -> (ControlState, mpsc::Receiver<ToggleRequest>) {
        let (toggle_tx, toggle_rx) = mpsc::channel(4);
        let state = ControlState {
            stats: Arc::new(Stats::new()),
            blocklist: Arc::new(BlocklistHandle::new(Blocklist::emergency())),
            is_blocking: Arc::new(AtomicBool::new(true)),
            blocking_method: "dns-proxy",
            toggle_tx,
        };
        (state, toggle_rx)
    }

    fn request(method: &str, path: &str, peer: [u8; 4]) -> HttpRequest<Body> {
        let mut req = HttpRequest::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 54321))));
        req
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_and_pid() {
        let (state, _rx) = test_state();
        let response = router(state)
            .oneshot(request("GET", "/health", [127, 0, 0, 1]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pid"], u64::from(std::process::id()));
    }

    #[tokio::test]
    async fn status_reflects_daemon_state() {
        let (state, _rx) = test_state();
        state.stats.record_query();
        state.stats.record_blocked();

        let response = router(state)
            .oneshot(request("GET", "/status", [127, 0, 0, 1]))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["isRunning"], true);
        assert_eq!(body["isBlocking"], true);
        assert_eq!(body["queriesSeen"], 1);
        assert_eq!(body["queriesBlocked"], 1);
        assert_eq!(body["blockingMethod"], "dns-proxy");
        assert!(body["domainsInList"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn non_loopback_peer_is_rejected() {
        let (state, _rx) = test_state();
        let response = router(state)
            .oneshot(request("GET", "/health", [192, 168, 1, 50]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn responses_carry_conservative_headers() {
        let (state, _rx) = test_state();
        let response = router(state)
            .oneshot(request("GET", "/stats", [127, 0, 0, 1]))
            .await
            .unwrap();

        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    }

    #[tokio::test]
    async fn toggle_round_trips_through_lifecycle() {
        let (state, mut rx) = test_state();
        // Stand-in for the lifecycle manager: disable blocking.
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            let _ = req.reply.send(Ok(false));
        });

        let response = router(state)
            .oneshot(request("POST", "/toggle", [127, 0, 0, 1]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["isBlocking"], false);
    }

    #[tokio::test]
    async fn failed_toggle_is_an_error() {
        let (state, mut rx) = test_state();
        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            let _ = req.reply.send(Err("configure failed".to_string()));
        });

        let response = router(state)
            .oneshot(request("POST", "/toggle", [127, 0, 0, 1]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
