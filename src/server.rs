//! HTTP boundary: `POST /identify`, `POST /track` and `POST /page`.
//!
//! Every request body is decoded into an [`Event`], stamped with the time it
//! was received, validated, and handed to the [`Dispatcher`]. Responses are
//! always a JSON object with a single `message` field.
//!
//! ```text
//! request ─> correlation id ─> auth ─> decode ─> validate ─> dispatch
//!                                 │        │          │           │
//!                                401      400        400     200 / 500
//! ```

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::event::{validate, Event, EventKind};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "Forwardlytics-Api-Key";

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Application metrics
#[derive(Debug)]
pub struct Metrics {
    events_received: AtomicU64,
    events_forwarded: AtomicU64,
    events_rejected: AtomicU64,
    events_failed: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_forwarded: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn snapshot(&self) -> Value {
        let uptime = self.uptime_seconds();

        // Format uptime as human-readable
        let uptime_str = if uptime < 60 {
            format!("{}s", uptime)
        } else if uptime < 3600 {
            format!("{}m {}s", uptime / 60, uptime % 60)
        } else {
            format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
        };

        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime,
            "uptime": uptime_str,
            "events": {
                "received": self.events_received.load(Ordering::Relaxed),
                "forwarded": self.events_forwarded.load(Ordering::Relaxed),
                "rejected": self.events_rejected.load(Ordering::Relaxed),
                "failed": self.events_failed.load(Ordering::Relaxed),
            },
            "status": "running"
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the HTTP layer.
#[derive(Debug)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub api_key: String,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, api_key: impl Into<String>) -> Self {
        Self {
            dispatcher,
            api_key: api_key.into(),
            metrics: Metrics::new(),
        }
    }
}

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request.")]
    InvalidRequest(#[source] serde_json::Error),

    /// The body could not be read (too large, broken stream)
    #[error("Invalid request.")]
    UnreadableBody(#[source] BytesRejection),

    #[error("Missing parameters: {}.", .0.join(", "))]
    MissingParameters(Vec<&'static str>),

    #[error(
        "Invalid API KEY. The Forwardlytics-Api-Key header must be specified, with the proper API key."
    )]
    Unauthorized,

    #[error(
        "Fatal error during {} with an integration ({}): {}",
        failure_noun(.kind),
        .error.integration(),
        .error.cause()
    )]
    Dispatch {
        kind: EventKind,
        #[source]
        error: DispatchError,
    },

    #[error("404 page not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::MissingParameters(_) => StatusCode::BAD_REQUEST,
            Self::UnreadableBody(rejection) => rejection.status(),
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Dispatch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        message_response(self.status(), &self.to_string())
    }
}

/// `{"message": "<text>"}` with the given status.
pub fn message_response(status: StatusCode, message: &str) -> Response {
    let body = format!("{{\"message\": {}}}", Value::String(message.to_string()));
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Word used for a kind in failure messages.
fn failure_noun(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Identification => "identification",
        EventKind::Action => "event",
        EventKind::PageView => "page",
    }
}

/// Word used for a kind in success messages.
fn forwarding_noun(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Identification => "identify",
        EventKind::Action => "event",
        EventKind::PageView => "page",
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    // Anything but POST on an event path is a 404, once authenticated.
    let events = Router::new()
        .route("/identify", post(identify).fallback(not_found))
        .route("/track", post(track).fallback(not_found))
        .route("/page", post(page).fallback(not_found))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .merge(events)
        .fallback(not_found)
        .layer(middleware::from_fn(correlation_middleware))
        .with_state(state)
}

/// Run each request in a span tagged with its correlation id, and echo it.
async fn correlation_middleware(req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %req.method(),
        path = %req.uri().path()
    );

    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = req.headers();

    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .unwrap_or_default();

    if bool::from(provided.as_bytes().ct_eq(state.api_key.as_bytes())) {
        Ok(next.run(req).await)
    } else {
        warn!("Invalid API Key attempt");
        Err(ApiError::Unauthorized)
    }
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

// Body rejections are taken as values so they keep the `{"message": ...}` shape.
type RawBody = Result<Bytes, BytesRejection>;

async fn identify(State(state): State<Arc<AppState>>, body: RawBody) -> Result<Response, ApiError> {
    handle_event(&state, EventKind::Identification, body).await
}

async fn track(State(state): State<Arc<AppState>>, body: RawBody) -> Result<Response, ApiError> {
    handle_event(&state, EventKind::Action, body).await
}

async fn page(State(state): State<Arc<AppState>>, body: RawBody) -> Result<Response, ApiError> {
    handle_event(&state, EventKind::PageView, body).await
}

async fn handle_event(state: &AppState, kind: EventKind, body: RawBody) -> Result<Response, ApiError> {
    // As early as possible.
    let received_at = Utc::now().timestamp();
    state.metrics.events_received.fetch_add(1, Ordering::Relaxed);

    let body = body.map_err(|rejection| {
        debug!(kind = %kind, error = %rejection, "Unreadable request body");
        state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
        ApiError::UnreadableBody(rejection)
    })?;

    let event = Event::decode(kind, &body, received_at).map_err(|e| {
        debug!(kind = %kind, error = %e, "Bad request");
        state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
        ApiError::InvalidRequest(e)
    })?;

    let missing = validate(&event);
    if !missing.is_empty() {
        debug!(kind = %kind, missing = ?missing, "Missing parameters");
        state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
        return Err(ApiError::MissingParameters(missing));
    }

    match state.dispatcher.dispatch(&event).await {
        Ok(report) => {
            state.metrics.events_forwarded.fetch_add(1, Ordering::Relaxed);
            info!(
                kind = %kind,
                user_id = %event.user_id(),
                delivered = ?report.delivered,
                "Event forwarded"
            );
            Ok(message_response(
                StatusCode::OK,
                &format!("Forwarding {} to integrations.", forwarding_noun(kind)),
            ))
        }
        Err(error) => {
            state.metrics.events_failed.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::Dispatch { kind, error })
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.dispatcher.registry();
    let integrations = registry.list();
    let enabled: Vec<&String> = integrations
        .iter()
        .filter(|name| registry.get(name).is_some_and(|i| i.enabled()))
        .collect();

    Json(json!({
        "status": "ok",
        "integrations": integrations,
        "enabled": enabled,
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.snapshot())
}
