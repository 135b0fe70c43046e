//! HTTP surface: the Slack ingress endpoints plus health and debug routes.
//!
//! Request signature verification happens in front of this server.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::dedup::Deduplicator;
use crate::dispatcher::Dispatcher;
use crate::event::Scope;
use crate::queue::MemoryQueue;
use crate::receiver::{AckResponse, EventReceiver, RawPayload, ReceiveError};

#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<EventReceiver>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingress_dedup: Arc<Deduplicator>,
    pub dispatch_dedup: Arc<Deduplicator>,
    pub queue: Arc<MemoryQueue>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/slack/events", post(slack_events))
        .route("/slack/commands", post(slack_commands))
        .route("/health", get(health))
        .route("/debug/dedup", get(debug_dedup))
        .route("/debug/route", post(debug_route))
        .with_state(state)
}

async fn slack_events(State(state): State<AppState>, body: String) -> Response {
    match state.receiver.accept(RawPayload::Event(body)).await {
        Ok(AckResponse::Challenge(challenge)) => Json(json!({ "challenge": challenge })).into_response(),
        Ok(ack) => Json(json!({ "ok": true, "status": ack_status(&ack) })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn slack_commands(State(state): State<AppState>, Form(form): Form<HashMap<String, String>>) -> Response {
    match state.receiver.accept(RawPayload::SlashCommand(form)).await {
        // An empty 200 keeps Slack from echoing anything; the reply arrives separately.
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

fn ack_status(ack: &AckResponse) -> &'static str {
    match ack {
        AckResponse::Accepted => "accepted",
        AckResponse::Duplicate => "duplicate",
        AckResponse::Ignored => "ignored",
        AckResponse::Challenge(_) => "challenge",
    }
}

fn error_response(err: ReceiveError) -> Response {
    let status = match &err {
        ReceiveError::Malformed(_) => StatusCode::BAD_REQUEST,
        ReceiveError::Publish(_) | ReceiveError::Deadline(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    warn!(status = status.as_u16(), error = %err, "rejecting inbound payload");
    (status, Json(json!({ "ok": false, "error": err.to_string() }))).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let status = if state.queue.is_closed() { "closing" } else { "ok" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "queue": state.queue.stats(),
    }))
    .into_response()
}

async fn debug_dedup(State(state): State<AppState>) -> Response {
    let ingress = state.ingress_dedup.stats().await;
    let dispatch = state.dispatch_dedup.stats().await;
    match (ingress, dispatch) {
        (Ok(ingress), Ok(dispatch)) => Json(json!({
            "ingress": ingress,
            "dispatch": dispatch,
            "queue": state.queue.stats(),
            "dead_letters": state.queue.dead_letters().await,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    text: String,
    #[serde(default)]
    scope: Scope,
}

async fn debug_route(State(state): State<AppState>, Json(request): Json<RouteRequest>) -> Response {
    Json(state.dispatcher.dry_run(&request.text, request.scope)).into_response()
}
