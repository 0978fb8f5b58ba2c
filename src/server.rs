use anyhow::Context;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::metrics::Metrics;
use crate::sink::Sink;
use crate::types::{Payload, Record};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    sink: Arc<Sink>,
    metrics: Arc<Metrics>,
    tag_header: HeaderName,
    max_body_size: usize,
}

impl AppState {
    pub fn new(sink: Arc<Sink>, metrics: Arc<Metrics>, tag_header: &str) -> anyhow::Result<Self> {
        let tag_header = HeaderName::from_bytes(tag_header.as_bytes())
            .with_context(|| format!("Invalid tag header name '{}'", tag_header))?;

        Ok(Self {
            sink,
            metrics,
            tag_header,
            max_body_size: 0,
        })
    }

    /// Cap `/ingest` bodies at `bytes`. Zero lifts the limit entirely.
    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }
}

pub fn router(state: AppState) -> Router {
    // zero means no limit
    let body_limit = match state.max_body_size {
        0 => DefaultBodyLimit::disable(),
        bytes => DefaultBodyLimit::max(bytes),
    };

    Router::new()
        .route(
            "/ingest",
            post(ingest)
                .layer(body_limit)
                .layer(middleware::from_fn_with_state(
                    state.metrics.clone(),
                    count_requests,
                )),
        )
        .route("/metrics", get(metrics))
        .route("/livez", get(livez))
        .with_state(state)
}

/// Serve until `stop` is cancelled, then let in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn ingest(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("json"));
    if !is_json {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Invalid Content-Type, ensure you send JSON payloads.",
        )
            .into_response();
    }

    let records: Vec<Record> = match serde_json::from_slice(&body) {
        Ok(records) => records,
        Err(err) => {
            debug!("Rejecting payload: {}", err);
            return (StatusCode::BAD_REQUEST, "Body could not be parsed as JSON").into_response();
        }
    };

    let tag = headers
        .get(&state.tag_header)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match state.sink.add_payload(Payload::new(tag, records)).await {
        Ok(ingested) => {
            state.metrics.record_ingest(ingested);
            StatusCode::OK.into_response()
        }
        Err(err) => {
            warn!("Failed to store payload: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to store payload, check sink's logs.",
            )
                .into_response()
        }
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.set_pipeline_state(
        state.sink.open_writers().await,
        state.sink.pending_jobs().await,
    );

    match state.metrics.encode() {
        Ok(body) => ([(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response(),
        Err(err) => {
            error!("Failed to encode metrics: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn count_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    metrics.record_request(response.status().as_u16());
    response
}
