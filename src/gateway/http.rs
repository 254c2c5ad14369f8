use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument as _;

use super::costing::format_usd_micros;
use super::{Gateway, GatewayError, RouteOutcome};
use crate::types::ChatCompletionRequest;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/chat/completions", post(handle_chat_completions))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    message: impl std::fmt::Display,
) -> Response {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
            },
        }),
    )
        .into_response()
}

fn gateway_error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match err {
        // Vendor error bodies that are already in the envelope shape go
        // through unchanged.
        GatewayError::Upstream { body, .. } => {
            match serde_json::from_str::<Value>(body) {
                Ok(value) if value.get("error").is_some_and(Value::is_object) => {
                    (status, Json(value)).into_response()
                }
                _ => openai_error(status, err.error_type(), err),
            }
        }
        GatewayError::InsufficientBalance { balance_usd_micros } => openai_error(
            status,
            err.error_type(),
            format!(
                "insufficient balance (${}); top up your credits to continue",
                format_usd_micros(*balance_usd_micros)
            ),
        ),
        GatewayError::Internal { .. } => {
            openai_error(status, err.error_type(), "internal gateway error")
        }
        _ => openai_error(status, err.error_type(), err),
    }
}

async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    let span = tracing::info_span!(
        "chat_completion",
        request_id = %request_id,
        model = tracing::field::Empty,
        provider = tracing::field::Empty,
        user_id = tracing::field::Empty,
        status = tracing::field::Empty,
    );

    let mut response = chat_completions(&state, &headers, body, &request_id)
        .instrument(span.clone())
        .await;
    span.record("status", response.status().as_u16());
    insert_request_id(response.headers_mut(), &request_id);
    response
}

async fn chat_completions(
    state: &GatewayHttpState,
    headers: &HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Response {
    let gateway = state.gateway();

    let Some(token) = extract_bearer(headers) else {
        return gateway_error_response(&GatewayError::Unauthorized {
            message: "missing bearer api key".to_string(),
        });
    };
    let auth = match gateway.authenticate(&token).await {
        Ok(auth) => auth,
        Err(err) => {
            tracing::info!(error = %err, "rejected api key");
            return gateway_error_response(&err);
        }
    };
    tracing::Span::current().record("user_id", auth.user_id.as_str());

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("invalid request body: {err}"),
            );
        }
    };
    tracing::Span::current().record("model", request.model.as_str());

    match gateway.route(request, &auth, request_id).await {
        Ok(RouteOutcome::Completion { response, .. }) => {
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(RouteOutcome::Stream { stream, .. }) => {
            let body = Body::from_stream(stream.map(Ok::<Bytes, Infallible>));
            let mut response = Response::new(body);
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
            response
        }
        Err(err) => {
            match &err {
                GatewayError::Upstream { status, .. } => {
                    tracing::warn!(upstream_status = ?status, error = %err, "upstream request failed")
                }
                GatewayError::Internal { .. } => tracing::error!(error = %err, "gateway failure"),
                _ => tracing::info!(error = %err, "request rejected"),
            }
            gateway_error_response(&err)
        }
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("vuzo-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let value = match HeaderValue::from_str(request_id) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert("x-request-id", value);
}
