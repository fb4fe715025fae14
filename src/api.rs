//! # HTTP API
//!
//! Thin axum layer over [`BridgeServices`]. Handlers only translate between
//! JSON and the core components; every rule lives in the components.
//!
//! | Route                            | Purpose                                   |
//! |----------------------------------|-------------------------------------------|
//! | `GET    /api/health`             | broker state and component counters       |
//! | `GET    /api/gas`                | latest readings, `?gasType=&stale=`       |
//! | `GET    /api/gas/:deviceId`      | latest reading of one device              |
//! | `POST   /api/control`            | submit a command, wait up to `waitMs`     |
//! | `GET    /api/control/:commandId` | command status                            |
//! | `POST   /api/subscribe`          | register a webhook subscriber             |
//! | `GET    /api/subscribe`          | list subscribers                          |
//! | `DELETE /api/subscribe/:id`      | unregister                                |
//! | `GET    /api/subscribe/stream`   | server-sent events push channel           |
//!
//! Errors are returned as `{"error": "..."}` with a status derived from the
//! component error.

use crate::bridge::BridgeServices;
use crate::dispatcher::DispatchError;
use crate::model::{CommandAction, CommandState, Notification};
use crate::mqtt::ConnectionState;
use crate::registry::{RegistryError, SubscriberRegistry, SubscriberTarget};
use crate::store::ReadingFilter;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

pub fn router(services: BridgeServices) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/gas", get(list_readings))
        .route("/api/gas/:device_id", get(get_reading))
        .route("/api/control", post(submit_command))
        .route("/api/control/:command_id", get(command_status))
        .route("/api/subscribe", post(subscribe).get(list_subscribers))
        .route("/api/subscribe/stream", get(stream_notifications))
        .route("/api/subscribe/:subscriber_id", delete(unsubscribe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(services)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        if let Some(body) = self.body.as_object_mut() {
            body.insert(key.to_string(), value);
        }
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        let message = error.to_string();
        match error {
            DispatchError::InvalidDevice(_) => ApiError::new(StatusCode::BAD_REQUEST, message),
            DispatchError::Conflict { pending, .. } => {
                ApiError::new(StatusCode::CONFLICT, message).with("pendingCommandId", json!(pending))
            }
            DispatchError::Publish { command_id, .. } => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, message)
                    .with("commandId", json!(command_id))
            }
            DispatchError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, message),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        let status = match error {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidTarget(_) | RegistryError::InvalidTopic(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        ApiError::new(status, error.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

async fn health(State(services): State<BridgeServices>) -> Json<Value> {
    let broker = services.connection_status();
    let status = if broker.connection_state == ConnectionState::Connected {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "broker": broker,
        "devices": services.store.len(),
        "subscribers": services.registry.len(),
        "pendingCommands": services.dispatcher.pending_count(),
        "startedAt": services.started_at(),
    }))
}

async fn list_readings(
    State(services): State<BridgeServices>,
    filter: Result<Query<ReadingFilter>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(filter) = filter?;
    let readings = services.store.list(&filter);
    Ok(Json(json!({ "count": readings.len(), "readings": readings })))
}

async fn get_reading(
    State(services): State<BridgeServices>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    services
        .store
        .get(&device_id)
        .map(|snapshot| Json(json!(snapshot)))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("No reading for device {}", device_id),
            )
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest {
    device_id: String,
    action: String,
    /// How long to wait for the device; 0 returns immediately
    wait_ms: Option<u64>,
}

async fn submit_command(
    State(services): State<BridgeServices>,
    request: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let action: CommandAction = request
        .action
        .parse()
        .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;

    let command_id = services.dispatcher.submit(&request.device_id, action)?;
    let wait = request
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or(services.request_timeout);

    let record = if wait.is_zero() {
        services.dispatcher.status(command_id)?
    } else {
        services.dispatcher.await_resolution(command_id, wait).await?
    };

    let status = if record.state == CommandState::Pending {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    debug!("Command {} answered with {:?}", command_id, record.state);
    Ok((status, Json(record)).into_response())
}

async fn command_status(
    State(services): State<BridgeServices>,
    command_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(command_id) = command_id?;
    let record = services.dispatcher.status(command_id)?;
    Ok(Json(record).into_response())
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    target: String,
    #[serde(default)]
    topics: Vec<String>,
}

async fn subscribe(
    State(services): State<BridgeServices>,
    request: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    let id = services
        .registry
        .register(SubscriberTarget::Webhook(request.target), request.topics)?;
    let info = services
        .registry
        .get(id)
        .ok_or_else(|| ApiError::from(RegistryError::NotFound(id)))?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn list_subscribers(State(services): State<BridgeServices>) -> Json<Value> {
    let subscribers = services.registry.list();
    Json(json!({ "count": subscribers.len(), "subscribers": subscribers }))
}

async fn unsubscribe(
    State(services): State<BridgeServices>,
    subscriber_id: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(subscriber_id) = subscriber_id?;
    services.registry.unregister(subscriber_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    /// Comma separated device ids; empty means all devices
    topics: Option<String>,
}

/// Unregisters the push channel once the client goes away
struct StreamGuard {
    registry: SubscriberRegistry,
    id: Uuid,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.registry.unregister(self.id).is_ok() {
            info!("Event stream {} closed", self.id);
        }
    }
}

async fn stream_notifications(
    State(services): State<BridgeServices>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Query(query) = query?;
    let topics: Vec<String> = query
        .topics
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(String::from)
        .collect();

    let (id, rx) = services.registry.register_channel(topics)?;
    info!("Event stream {} opened", id);
    let guard = StreamGuard {
        registry: services.registry.clone(),
        id,
    };

    let events = stream::unfold(
        (rx, guard),
        |(mut rx, guard): (mpsc::Receiver<Notification>, StreamGuard)| async move {
            let notification = rx.recv().await?;
            let event = Event::default()
                .event("reading")
                .json_data(&notification)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            Some((Ok(event), (rx, guard)))
        },
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
