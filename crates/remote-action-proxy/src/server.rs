// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface: `POST /init` and `POST /run`.

use std::io::Write;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::extract::rejection::BytesRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::handlers::{self, ActionHandlerState};

const OK_BODY: &[u8] = b"{\"ok\":true}\n";

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Build the router.
pub fn router(state: Arc<ActionHandlerState>) -> Router {
    Router::new()
        .route("/init", post(init))
        .route("/run", post(run))
        .fallback(not_found)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ActionHandlerState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Action proxy listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn init(
    State(state): State<Arc<ActionHandlerState>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(e) => return read_failure(e),
    };
    match handlers::handle_init(&state, &body).await {
        Ok(()) => json_response(StatusCode::OK, Bytes::from_static(OK_BODY)),
        Err(e) => {
            warn!(error = %e, status = %e.status(), "Init failed");
            e.into_response()
        }
    }
}

async fn run(
    State(state): State<Arc<ActionHandlerState>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(e) => return read_failure(e),
    };
    let relayed = handlers::handle_run(&state, &body)
        .await
        .and_then(|output| relay_body(&output, state.config.max_response_bytes));
    match relayed {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            warn!(error = %e, status = %e.status(), "Run failed");
            e.into_response()
        }
    }
}

async fn not_found() -> Response {
    json_response(StatusCode::NOT_FOUND, error_body("invalid request"))
}

fn read_failure(rejection: BytesRejection) -> Response {
    ProxyError::BadRequest(format!("Error reading request body: {}", rejection.body_text()))
        .into_response()
}

/// Copy `output` into a response buffer of at most `capacity` bytes.
pub fn relay_body(output: &[u8], capacity: usize) -> Result<Bytes> {
    let mut writer = BytesMut::with_capacity(output.len().min(capacity))
        .limit(capacity)
        .writer();
    write_body(&mut writer, output)?;
    Ok(writer.into_inner().into_inner().freeze())
}

/// Write `payload` in a single write and flush, failing on errors and short writes.
pub fn write_body<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let written = writer
        .write(payload)
        .and_then(|n| writer.flush().map(|_| n))
        .map_err(|e| ProxyError::ResponseWriteFailed(format!("Error writing response: {}", e)))?;
    if written != payload.len() {
        return Err(ProxyError::ResponseWriteFailed(format!(
            "Only wrote {} of {} bytes to response",
            written,
            payload.len()
        )));
    }
    Ok(())
}

/// `{"error": message}` followed by a newline.
pub fn error_body(message: &str) -> Bytes {
    let mut body = serde_json::to_vec(&ErrorBody { error: message })
        .unwrap_or_else(|_| b"{\"error\":\"error marshalling error response\"}".to_vec());
    body.push(b'\n');
    Bytes::from(body)
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let length = body.len();
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from(body),
    )
        .into_response()
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        json_response(self.status(), error_body(&self.to_string()))
    }
}
