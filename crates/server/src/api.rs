//! REST API endpoints (spec §6): session listing/inspection/close, and
//! running a canned OS command against a session, streaming its
//! output as the response body.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use gomet_core::{Server, SessionId};

#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<Server>,
}

#[derive(Serialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub address: String,
}

/// `GET /sessions`
pub async fn list_sessions(State(state): State<ApiState>) -> Json<Vec<SessionRecord>> {
    let records = state
        .server
        .list_sessions()
        .into_iter()
        .map(to_record)
        .collect();
    Json(records)
}

/// `GET /sessions/{id}`
pub async fn get_session(State(state): State<ApiState>, Path(id): Path<SessionId>) -> Response {
    match state.server.get_session(id) {
        Some(session) => Json(to_record(session)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `DELETE /sessions/{id}`
pub async fn close_session(State(state): State<ApiState>, Path(id): Path<SessionId>) -> StatusCode {
    match state.server.close_session(id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

/// `GET /sessions/{id}/{commandName}` — runs one of the canned OS
/// commands (ls/ps/id/pwd/netstat) on the session's agent, streaming
/// its output as the response body.
pub async fn run_named_command(
    State(state): State<ApiState>,
    Path((id, command_name)): Path<(SessionId, String)>,
) -> Response {
    let Some(session) = state.server.get_session(id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(shell_command) = state.server.os_command(&session.os, &command_name) else {
        return (StatusCode::NOT_FOUND, "unknown command").into_response();
    };

    let (mut reader, writer) = tokio::io::duplex(8192);
    let command = gomet_core::Command::Execute(gomet_core::command::Execute::new(
        shell_command,
        Box::new(writer),
    ));
    // `run_command` runs `Execute` inline and the agent's output is
    // teed through this duplex pipe as it arrives; reading it must
    // happen concurrently with, not after, `run_command`'s `.await` or
    // output past the pipe's buffer size deadlocks the writer side.
    let runner = tokio::spawn(async move { session.run_command(command).await });

    let mut output = Vec::new();
    if tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut output)
        .await
        .is_err()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    match runner.await {
        Ok(Ok(())) => output.into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn to_record(session: Arc<gomet_core::Session>) -> SessionRecord {
    SessionRecord {
        id: session.id,
        os: session.os.clone(),
        arch: session.arch.clone(),
        hostname: session.hostname.clone(),
        address: session.address.to_string(),
    }
}
