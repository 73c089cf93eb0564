//! /{ns}/{name}/tasks handlers — long-poll invocation and live call listing.
//!
//! A POST holds the connection open until the call settles. While waiting it
//! may stream `_ping` frames and, with `recv_log=true`, `log` frames; the
//! body always ends with the terminal `rsp` or `err` frame. When the call
//! settles before anything else was written, the status code reflects the
//! outcome (500 for an error); once streaming has started it is 200.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use refunc_client::http::USER_HEADER;
use refunc_client::{new_task_resolver, TaskError, TaskResolver};
use refunc_core::messages::{encode, error_action_bytes, gen_id, response_action_bytes, PING_MSG};
use refunc_core::{Action, InvokeRequest, Observer};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};

use super::{GatewayState, JSON_CT};

// ── /{ns}/{name}/tasks (POST) ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub recv_log: bool,
}

pub async fn handle_create_task(
    State(state): State<GatewayState>,
    Path((ns, name)): Path<(String, String)>,
    Query(query): Query<TaskQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let mut request: InvokeRequest = if body.is_empty() {
        InvokeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid request, {}", e)))?
    };

    let endpoint = format!("{}/{}", ns, name);
    if request.request_id.is_empty() {
        request.request_id = gen_id(&[endpoint.as_bytes(), &body]);
    }
    if request.user.is_empty() {
        if let Some(user) = headers.get(USER_HEADER).and_then(|v| v.to_str().ok()) {
            request.user = user.to_string();
        }
    }

    let id = format!("{}/{}", endpoint, request.request_id);
    let tr = ensure_task(&state, &id, endpoint, request, query.recv_log)
        .await
        .map_err(|e| {
            tracing::error!(task = %id, error = %e, "failed to start task");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(poll_task(tr, query.recv_log, state.ping_interval).await)
}

/// Join the call already running under `id`, or start it.
async fn ensure_task(
    state: &GatewayState,
    id: &str,
    endpoint: String,
    request: InvokeRequest,
    recv_log: bool,
) -> Result<TaskResolver, TaskError> {
    let ctx = state.ctx.child().with_logging(recv_log);
    let created = state
        .store
        .get_or_create(id, || async move { new_task_resolver(&ctx, &endpoint, request).await })
        .await;

    let (tr, created) = match created {
        Ok(found) => found,
        Err(e) => {
            state.store.delete(id);
            return Err(e);
        }
    };

    if created {
        let store = state.store.clone();
        let id = id.to_string();
        let settled = tr.clone();
        tokio::spawn(async move {
            settled.done().await;
            store.delete(&id);
            tracing::debug!(task = %settled.name(), "finished");
        });
    } else {
        tracing::debug!(task = %id, "joined running task");
    }
    Ok(tr)
}

// ── Long-poll ─────────────────────────────────────────────────────────────────

enum Event {
    Log(String),
    Ping,
    Done,
}

async fn next_event(tr: &TaskResolver, logs: &mut Option<Observer<String>>, ticker: &mut Interval) -> Event {
    loop {
        tokio::select! {
            biased;
            line = next_log(logs) => match line {
                Some(line) => return Event::Log(line),
                None => *logs = None,
            },
            _ = tr.done() => return Event::Done,
            _ = ticker.tick() => return Event::Ping,
        }
    }
}

async fn next_log(logs: &mut Option<Observer<String>>) -> Option<String> {
    match logs {
        Some(observer) => observer.next().await,
        None => std::future::pending().await,
    }
}

fn frame_for(event: Event) -> Option<Bytes> {
    match event {
        Event::Ping => Some(Bytes::from_static(PING_MSG)),
        Event::Log(line) => Action::log(&line).and_then(|a| encode(&a)).ok(),
        Event::Done => None,
    }
}

fn terminal_frame(tr: &TaskResolver) -> (StatusCode, Bytes) {
    match tr.result() {
        Some(Ok(data)) => (StatusCode::OK, response_action_bytes(&data)),
        Some(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, error_action_bytes(&e.to_error_message())),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_action_bytes(&TaskError::Stopped.to_error_message()),
        ),
    }
}

async fn poll_task(tr: TaskResolver, recv_log: bool, ping: Duration) -> Response {
    let mut logs = recv_log.then(|| tr.log_observer());
    let mut ticker = interval_at(Instant::now() + ping, ping);

    let first = loop {
        let event = next_event(&tr, &mut logs, &mut ticker).await;
        if let Event::Done = event {
            let (status, frame) = terminal_frame(&tr);
            return (status, [(header::CONTENT_TYPE, JSON_CT)], frame).into_response();
        }
        if let Some(frame) = frame_for(event) {
            break frame;
        }
    };

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut pending = Some(first);
        loop {
            if let Some(frame) = pending.take() {
                if tx.send(frame).await.is_err() {
                    tracing::debug!(task = %tr.name(), "client went away");
                    return;
                }
            }
            match next_event(&tr, &mut logs, &mut ticker).await {
                Event::Done => {
                    let (_, frame) = terminal_frame(&tr);
                    let _ = tx.send(frame).await;
                    return;
                }
                event => pending = frame_for(event),
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, std::io::Error>(frame), rx))
    });
    ([(header::CONTENT_TYPE, JSON_CT)], Body::from_stream(stream)).into_response()
}

// ── /tasks (GET) ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<serde_json::Value>,
}

pub async fn handle_list_tasks(State(state): State<GatewayState>) -> Json<TasksResponse> {
    let mut tasks = Vec::new();
    state.store.range(|_, tr| {
        tasks.push(tr.stat_json());
        true
    });
    Json(TasksResponse { tasks })
}
