//! HTTP surface: session streams, message submission and operations.
//!
//! | Route                              | Purpose                                  |
//! |------------------------------------|------------------------------------------|
//! | `GET /servers/{server}/sse`        | open a session stream                    |
//! | `GET /sessions/{id}/sse`           | reconnect to a session                   |
//! | `POST /sessions/{id}/messages`     | submit to a live session (`202`)         |
//! | `POST /servers/{server}/messages`  | route via session header or inline reply |
//! | `DELETE /sessions/{id}`            | close a session                          |
//! | `GET /health`                      | supervisor and session summary           |
//! | `POST /servers/{server}/reset`     | clear a failed server                    |
//!
//! Client identity is taken from `x-client-id` / `x-project-id`, which an
//! authenticating proxy in front of the gateway is expected to set.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::error::{GatewayError, SessionError};
use crate::gateway::{Gateway, RouteOutcome};
use crate::session::{ClientIdentity, SessionStream};

/// Header carrying the session id on message routes and stream responses.
pub const SESSION_HEADER: &str = "mcp-session-id";

const CLIENT_HEADER: &str = "x-client-id";
const PROJECT_HEADER: &str = "x-project-id";

/// Binds `listen` and serves until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<F>(listen: &str, gateway: Arc<Gateway>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(listen).await?;
    tracing::info!(address = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Builds the router.
#[must_use]
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers/{server}/sse", get(open_stream))
        .route("/servers/{server}/messages", post(route_message))
        .route("/servers/{server}/reset", post(reset_server))
        .route("/sessions/{id}/sse", get(reconnect_stream))
        .route("/sessions/{id}/messages", post(submit_message))
        .route("/sessions/{id}", delete(close_session))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": gateway.health(),
    }))
}

async fn open_stream(
    State(gateway): State<Arc<Gateway>>,
    Path(server): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let stream = gateway.open_session(&server, identity(&headers), None)?;
    Ok(event_stream(stream))
}

async fn reconnect_stream(
    State(gateway): State<Arc<Gateway>>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let stream = gateway.reconnect(&session_id)?;
    Ok(event_stream(stream))
}

async fn submit_message(
    State(gateway): State<Arc<Gateway>>,
    Path(session_id): Path<String>,
    body: String,
) -> ApiResult<StatusCode> {
    gateway
        .sessions()
        .submit(&session_id, body)
        .map_err(GatewayError::from)?;
    Ok(StatusCode::ACCEPTED)
}

async fn route_message(
    State(gateway): State<Arc<Gateway>>,
    Path(server): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let session_id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let outcome = gateway.route(session_id, Some(&server), &body).await?;
    Ok(match outcome {
        RouteOutcome::Queued { .. } | RouteOutcome::Replied(None) => {
            StatusCode::ACCEPTED.into_response()
        }
        RouteOutcome::Replied(Some(reply)) => Json(reply).into_response(),
    })
}

async fn close_session(
    State(gateway): State<Arc<Gateway>>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    gateway.close_session(&session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_server(
    State(gateway): State<Arc<Gateway>>,
    Path(server): Path<String>,
) -> ApiResult<StatusCode> {
    gateway.reset_server(&server).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn identity(headers: &HeaderMap) -> ClientIdentity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientIdentity {
        subject: header(CLIENT_HEADER).unwrap_or_else(|| "anonymous".to_string()),
        project: header(PROJECT_HEADER),
    }
}

fn event_stream(stream: SessionStream) -> Response {
    let session_id = stream.session_id().to_string();
    let events = stream
        .into_stream()
        .map(|frame| Event::default().json_data(frame));
    ([(SESSION_HEADER, session_id)], Sse::new(events)).into_response()
}

/// Error response for handlers.
pub struct ApiError(GatewayError);

impl ApiError {
    const fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::UnknownServer { .. }
            | GatewayError::Session(SessionError::NotFound { .. }) => StatusCode::NOT_FOUND,
            GatewayError::ServerDisabled { .. } => StatusCode::FORBIDDEN,
            GatewayError::Session(SessionError::Inactive { .. }) => StatusCode::GONE,
            GatewayError::Session(SessionError::ReconnectLimit { .. }) => StatusCode::CONFLICT,
            GatewayError::Session(SessionError::Backpressure { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::NoRoute => StatusCode::BAD_REQUEST,
            GatewayError::RestartLimitExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<GatewayError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

type ApiResult<T> = Result<T, ApiError>;
