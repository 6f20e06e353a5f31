//! `POST /collector` — Prometheus remote-write ingestion (spec.md §6).

use axum::body::Bytes;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::extract::State;

use crate::error::AgentError;

use super::AppState;

pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match state
        .ingest
        .put_metrics(&content_type, content_encoding.as_deref(), &body)
    {
        Ok(stats) => {
            let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
            if stats.confirmed {
                builder = builder
                    .header("X-Prometheus-Remote-Write-Samples-Written", stats.samples.to_string())
                    .header(
                        "X-Prometheus-Remote-Write-Histograms-Written",
                        stats.histograms.to_string(),
                    )
                    .header(
                        "X-Prometheus-Remote-Write-Exemplars-Written",
                        stats.exemplars.to_string(),
                    );
            }
            builder
                .body(axum::body::Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(AgentError::Decode(msg)) | Err(AgentError::InvalidInput(msg)) => {
            (StatusCode::BAD_REQUEST, msg).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
