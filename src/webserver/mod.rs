//! Read-only HTTP API of a master node.
//!
//! | Route | Body |
//! |---|---|
//! | `GET /status` | latest [`ExecutionStatsUpdate`], without querying workers |
//! | `GET /addresses` | current [`AddressInfo`](crate::addresses::AddressInfo) |
//! | `GET /events` | server-sent events, one `stats` event per query round |
//! | `GET /dead-letters` | most recent dead letters |
//! | `GET /metrics` | prometheus text format |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::controller::ControllerRpc;
use crate::controller::ExecutionStatsUpdate;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::metrics::encode_metrics;
use crate::runtime::Runtime;

pub struct ApiState {
    pub runtime: Runtime,
    pub controller: Arc<ControllerRpc>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/addresses", get(get_addresses))
        .route("/events", get(get_events))
        .route("/dead-letters", get(get_dead_letters))
        .route("/metrics", get(get_metrics))
        .layer(Extension(state))
}

pub async fn run_webserver(state: Arc<ApiState>, port: u16) -> EngineResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting API server on {addr:?}");

    axum::Server::try_bind(&addr)
        .map_err(|err| EngineError::Config(format!("unable to bind API server at port {port}: {err}")))?
        .serve(router(state).into_make_service())
        .await
        .map_err(|err| EngineError::Cluster(format!("API server at port {port} stopped: {err}")))
}

async fn get_status(Extension(state): Extension<Arc<ApiState>>) -> Json<ExecutionStatsUpdate> {
    Json(state.controller.snapshot().await)
}

async fn get_addresses(Extension(state): Extension<Arc<ApiState>>) -> impl IntoResponse {
    Json((*state.runtime.registry().current_addresses()).clone())
}

async fn get_dead_letters(Extension(state): Extension<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.runtime.dead_letters().recent().await)
}

async fn get_events(
    Extension(state): Extension<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = state.controller.subscribe();
    let stream = futures::stream::unfold(updates, |mut updates| async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    let event = match Event::default().event("stats").json_data(&*update) {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::error!("Can't encode stats event: {err}");
                            continue;
                        }
                    };
                    return Some((Ok(event), updates));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event stream lagged; skipped {skipped} updates");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_metrics() -> Response {
    match encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[cfg(test)]
async fn test_state() -> Arc<ApiState> {
    let runtime = Runtime::start(&crate::config::EngineConfig::default())
        .await
        .unwrap();
    let controller = ControllerRpc::new(
        runtime.clone(),
        crate::execution::WorkflowExecution::shared(),
        std::time::Duration::from_secs(1),
    );
    Arc::new(ApiState {
        runtime,
        controller: Arc::new(controller),
    })
}

#[tokio::test]
async fn status_of_an_empty_run() {
    let Json(update) = get_status(Extension(test_state().await)).await;
    assert_eq!(update.round, 0);
    assert!(update.regions.is_empty());
    assert!(!update.partial);
    assert_eq!(update.addresses.len(), 1);
}

#[tokio::test]
async fn metrics_are_plain_text() {
    let response = get_metrics().await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; version=0.0.4"
    );
}

#[tokio::test]
async fn status_route_serves_the_snapshot() {
    use axum::body::Body;
    use axum::body::HttpBody;
    use axum::http::Request;
    use tower::ServiceExt;

    let response = router(test_state().await)
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status["round"], 0);
    assert_eq!(status["partial"], false);
    assert_eq!(status["regions"], serde_json::json!({}));
    assert_eq!(status["addresses"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let response = router(test_state().await)
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
