//! HTTP receiver for Graph change notifications.
//!
//! The receiver answers Graph's validation handshake, authenticates every
//! notification by its `clientState`, and forwards the ids of newly created
//! messages to the processor. It never touches the subscription record.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const WEBHOOK_PATH: &str = "/webhook";

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationQuery {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: Option<String>,
    #[serde(rename = "clientState")]
    pub client_state: Option<String>,
    #[serde(rename = "changeType")]
    pub change_type: Option<String>,
    pub resource: Option<String>,
    #[serde(rename = "resourceData")]
    pub resource_data: Option<ResourceData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceData {
    pub id: Option<String>,
}

#[derive(Clone)]
pub struct WebhookState {
    client_state: Arc<str>,
    dispatch: mpsc::Sender<String>,
}

impl WebhookState {
    pub fn new(client_state: impl Into<Arc<str>>, dispatch: mpsc::Sender<String>) -> Self {
        Self {
            client_state: client_state.into(),
            dispatch,
        }
    }
}

/// Ids of created messages from notifications carrying the expected secret.
/// Anything with a different or missing `clientState` is dropped.
pub fn accepted_message_ids(batch: &NotificationBatch, expected_client_state: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for notification in &batch.value {
        if notification.client_state.as_deref() != Some(expected_client_state) {
            warn!(
                subscription_id = notification.subscription_id.as_deref().unwrap_or("-"),
                "dropping notification with invalid client state"
            );
            continue;
        }

        let is_created = notification
            .change_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("created"));
        let is_message = notification
            .resource
            .as_deref()
            .is_some_and(|resource| resource.to_ascii_lowercase().contains("messages"));
        if !(is_created && is_message) {
            debug!(
                change_type = notification.change_type.as_deref().unwrap_or("-"),
                resource = notification.resource.as_deref().unwrap_or("-"),
                "ignoring notification"
            );
            continue;
        }

        if let Some(id) = notification
            .resource_data
            .as_ref()
            .and_then(|data| data.id.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            ids.push(id.to_string());
        }
    }
    ids
}

pub async fn handle_notification(
    State(state): State<WebhookState>,
    Query(query): Query<ValidationQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = query.validation_token {
        info!("answering subscription validation request");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            token,
        )
            .into_response();
    }

    let batch: NotificationBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(error) => {
            warn!(error = %error, "rejecting malformed notification body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let ids = accepted_message_ids(&batch, &state.client_state);
    info!(
        received = batch.value.len(),
        accepted = ids.len(),
        "notifications received"
    );
    for id in ids {
        // Graph expects a quick answer; a full queue drops rather than blocks.
        if let Err(error) = state.dispatch.try_send(id) {
            warn!(error = %error, "message dispatch queue unavailable; dropping id");
        }
    }

    StatusCode::ACCEPTED.into_response()
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(handle_notification))
        .with_state(state)
}

/// Binds the webhook listener. `addr` is `host:port`; host names resolve here.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind webhook listener on {addr}"))
}

/// Serves the webhook on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: WebhookState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("read webhook listener address")?;
    info!(%addr, path = WEBHOOK_PATH, "webhook server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("run webhook server")
}
