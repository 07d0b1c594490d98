// handlers.rs
use std::net::SocketAddr;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ConnectInfo, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{AppError, LedgerError},
    models::{CastOutcome, Poll, PollPage, Tallies, VoteRequest},
    notifier::NotifierEvent,
    registry::NewPoll,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

fn poll_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, AppError> {
    path.map(|Path(id)| id).map_err(|rejection| {
        LedgerError::validation(format!("invalid poll id: {}", rejection.body_text())).into()
    })
}

fn malformed(rejection: JsonRejection) -> AppError {
    LedgerError::validation(format!("malformed payload: {}", rejection.body_text())).into()
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "store": state.backend }))
}

/// Create a poll together with its options
pub async fn create_poll(
    State(state): State<AppState>,
    payload: Result<Json<NewPoll>, JsonRejection>,
) -> Result<(StatusCode, Json<Poll>), AppError> {
    let Json(request) = payload.map_err(malformed)?;
    let poll = state.registry.create_poll(request).await?;

    Ok((StatusCode::CREATED, Json(poll)))
}

/// Active polls, newest first, one page at a time
pub async fn list_polls(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<PollPage>, AppError> {
    let Query(params) = params.map_err(|rejection| LedgerError::validation(rejection.body_text()))?;
    let page = state
        .registry
        .list_active(params.cursor.as_deref(), params.limit)
        .await?;

    Ok(Json(page))
}

pub async fn get_poll(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Poll>, AppError> {
    let poll = state.registry.get_poll(poll_id(path)?).await?;
    Ok(Json(poll))
}

pub async fn delete_poll(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Value>, AppError> {
    state.registry.delete_poll(poll_id(path)?).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Poll deleted successfully"
    })))
}

pub async fn close_poll(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Poll>, AppError> {
    let poll = state.registry.close_poll(poll_id(path)?).await?;
    Ok(Json(poll))
}

pub async fn get_tallies(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Tallies>, AppError> {
    let tallies = state.ledger.get_tallies(poll_id(path)?).await?;
    Ok(Json(tallies))
}

pub async fn reconcile_tallies(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Tallies>, AppError> {
    let tallies = state.ledger.reconcile(poll_id(path)?).await?;
    Ok(Json(tallies))
}

/// Whether the caller already voted. A hint for the client, never used to
/// accept or refuse a vote.
pub async fn vote_status(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Value>, AppError> {
    let poll_id = poll_id(path)?;
    let voter = state.identity.resolve(&headers, Some(peer))?;
    let has_voted = state.ledger.has_voted(poll_id, &voter).await?;

    Ok(Json(json!({ "poll_id": poll_id, "has_voted": has_voted })))
}

/// Vote for an option; the voter identity comes from the request, never
/// from the body
pub async fn cast_vote(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload.map_err(malformed)?;
    let voter = state.identity.resolve(&headers, Some(peer))?;

    match state
        .ledger
        .cast_vote(request.poll_id, request.option_id, &voter)
        .await?
    {
        CastOutcome::Accepted(tallies) => Ok(Json(json!({
            "status": "accepted",
            "tallies": tallies
        }))),
        CastOutcome::Rejected(rejection) => Err(AppError::Rejected(rejection)),
    }
}

/// Live tallies as server-sent events: one `snapshot`, then a `tally` per
/// accepted vote and `resync` whenever deltas were dropped.
pub async fn poll_events(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let poll_id = poll_id(path)?;
    state.registry.get_poll(poll_id).await?;

    // Subscribe before reading the snapshot so no vote falls in between.
    let subscription = state.notifier.subscribe(poll_id);
    let snapshot = state.ledger.get_tallies(poll_id).await?;

    let first = Event::default().event("snapshot").json_data(&snapshot);
    let updates = subscription.into_stream().map(|event| match event {
        NotifierEvent::Tally(delta) => Event::default().event("tally").json_data(&delta),
        NotifierEvent::Resync { missed } => {
            Ok(Event::default().event("resync").data(missed.to_string()))
        }
    });

    Ok(Sse::new(stream::once(async move { first }).chain(updates)).keep_alive(KeepAlive::default()))
}
