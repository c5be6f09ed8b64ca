//! Server-sent event fan-out.
//!
//! Two long-lived streams per project: a per-deployment stream that merges
//! aggregated log batches with status transitions, and a project stream
//! that relays every update on the bus as a pre-rendered status fragment.
//! Generators run in their own task and exit silently once the client is
//! gone; a send on a closed channel is the disconnect signal.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query};
use axum::http::header::{HeaderMap, CACHE_CONTROL, CONNECTION};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::Extension;
use chrono::{DateTime, Utc};
use runway_common::log::{nanos_to_rfc3339, Item};
use serde::Deserialize;
use tokio::sync::mpsc::{self, Sender};
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::bus::{status_key, updates_key, STREAM_START};
use crate::error::{ErrorKind, Result};
use crate::logs::LogQuery;
use crate::persistence::Deployment;
use crate::Deployer;

/// Hard cap on a per-deployment stream.
const DEPLOYMENT_STREAM_MAX: Duration = Duration::from_secs(1800);
/// Project streams expire and ask the client to reconnect.
const PROJECT_STREAM_TTL: Duration = Duration::from_secs(900);
/// Pause between per-deployment poll rounds.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long to keep streaming logs after the deployment concluded.
const LINGER_AFTER_CONCLUSION_SECS: i64 = 5;
/// Upper bound on one log batch.
const LOG_BATCH_LIMIT: usize = 5000;

const NO_LOGS_PLACEHOLDER: &str =
    "<div class=\"log-empty\">No logs available yet...</div>";

fn sse_response(stream: ReceiverStream<SseEvent>) -> impl IntoResponse {
    let stream = stream.map(Ok::<_, std::convert::Infallible>);
    (
        [(CACHE_CONTROL, "no-cache"), (CONNECTION, "keep-alive")],
        Sse::new(stream),
    )
}

fn last_event_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub struct DeploymentEventsParams {
    pub start_timestamp: Option<i64>,
}

/// `GET /projects/:project_id/deployments/:deployment_id/events`
pub async fn deployment_events(
    Extension(deployer): Extension<Arc<Deployer>>,
    Path((project_id, deployment_id)): Path<(String, String)>,
    Query(params): Query<DeploymentEventsParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let deployment = deployer
        .persistence
        .deployment(&deployment_id)
        .await?
        .filter(|deployment| deployment.project_id == project_id)
        .ok_or(ErrorKind::DeploymentNotFound)?;

    // Resume order: Last-Event-ID beats the query param beats creation time.
    let cursor = last_event_id(&headers)
        .and_then(|id| id.parse::<i64>().ok())
        .or(params.start_timestamp)
        .unwrap_or_else(|| deployment.created_at.timestamp_nanos_opt().unwrap_or_default());

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(deployment_event_loop(deployer, deployment, cursor, tx));

    Ok(sse_response(ReceiverStream::new(rx)))
}

async fn deployment_event_loop(
    deployer: Arc<Deployer>,
    deployment: Deployment,
    mut cursor: i64,
    tx: Sender<SseEvent>,
) {
    let status_stream = status_key(&deployment.project_id, &deployment.id);
    let mut status_pos = STREAM_START.to_string();
    let mut conclusion = deployment.conclusion.map(|c| c.to_string());
    let mut concluded_at = deployment.concluded_at.map(|at| at.timestamp());

    let mut query = LogQuery::deployment(&deployment.project_id, &deployment.id);
    query.limit = LOG_BATCH_LIMIT;

    // First batch right away so the client is not staring at nothing.
    query.start_timestamp = Some(cursor);
    match deployer.logs.get_logs(&query).await {
        Ok(items) if !items.is_empty() => {
            cursor = next_cursor(&items).unwrap_or(cursor);
            if send_log_batch(&tx, &items).await.is_err() {
                return;
            }
        }
        Ok(_) => {
            let event = SseEvent::default()
                .event("deployment_log")
                .data(NO_LOGS_PLACEHOLDER);
            if tx.send(event).await.is_err() {
                return;
            }
        }
        Err(error) => warn!(error = %error, "initial log pull failed"),
    }

    let started = Instant::now();
    loop {
        if started.elapsed() > DEPLOYMENT_STREAM_MAX {
            let event = SseEvent::default()
                .event("deployment_log_closed")
                .data("timeout");
            let _ = tx.send(event).await;
            return;
        }

        // Terminal and settled: the container stopped logging long enough
        // ago that the last batch is complete.
        if let (Some(conclusion), Some(at)) = (&conclusion, concluded_at) {
            if Utc::now().timestamp() - at >= LINGER_AFTER_CONCLUSION_SECS {
                let event = SseEvent::default()
                    .event("deployment_log_closed")
                    .data(conclusion.clone());
                let _ = tx.send(event).await;
                return;
            }
        }

        query.start_timestamp = Some(cursor);
        match deployer.logs.get_logs(&query).await {
            Ok(items) if !items.is_empty() => {
                cursor = next_cursor(&items).unwrap_or(cursor);
                if send_log_batch(&tx, &items).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "log pull failed"),
        }

        if conclusion.is_none() {
            match deployer
                .bus
                .read_available(&status_stream, &status_pos)
                .await
            {
                Ok(entries) => {
                    for entry in entries {
                        if let Some(status) = entry.field("deployment_status") {
                            if conclusion.is_none() && matches!(status, "succeeded" | "failed") {
                                conclusion = Some(status.to_string());
                                concluded_at = entry
                                    .field("timestamp")
                                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                                    .map(|parsed| parsed.timestamp())
                                    .or_else(|| Some(Utc::now().timestamp()));

                                let event = SseEvent::default()
                                    .event("deployment_concluded")
                                    .data(status);
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        status_pos = entry.id;
                    }
                }
                Err(error) => warn!(error = %error, "status stream read failed"),
            }
        }

        sleep(POLL_INTERVAL).await;
    }
}

async fn send_log_batch(tx: &Sender<SseEvent>, items: &[Item]) -> std::result::Result<(), ()> {
    let event = SseEvent::default()
        .event("deployment_log")
        .data(render_log_list(items));
    tx.send(event).await.map_err(|_| ())
}

/// The cursor advances past the newest entry in the batch.
fn next_cursor(items: &[Item]) -> Option<i64> {
    items
        .iter()
        .filter_map(Item::timestamp_nanos)
        .max()
        .map(|max| max + 1)
}

/// `GET /projects/:project_id/events`
pub async fn project_events(
    Extension(deployer): Extension<Arc<Deployer>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    deployer
        .persistence
        .project(&project_id)
        .await?
        .ok_or(ErrorKind::ProjectNotFound)?;

    // Fresh connections start just before now; reconnections resume at the
    // last id the client saw.
    let position = last_event_id(&headers)
        .unwrap_or_else(|| format!("{}-0", Utc::now().timestamp_millis() - 2000));

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(project_event_loop(deployer, project_id, position, tx));

    Ok(sse_response(ReceiverStream::new(rx)))
}

async fn project_event_loop(
    deployer: Arc<Deployer>,
    project_id: String,
    mut position: String,
    tx: Sender<SseEvent>,
) {
    let stream_key = updates_key(&project_id);
    let started = Instant::now();

    loop {
        if started.elapsed() > PROJECT_STREAM_TTL {
            let event = SseEvent::default()
                .event("stream_expired")
                .data("The stream has expired. Please reconnect.");
            let _ = tx.send(event).await;
            return;
        }

        let entries = match deployer
            .bus
            .read_blocking(&stream_key, &position, 5000)
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(error = %error, "updates stream read failed");
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if entries.is_empty() {
            sleep(Duration::from_secs(1)).await;
            continue;
        }

        for entry in entries {
            let event_type = entry.field("event_type").unwrap_or("message").to_string();
            let deployment_id = entry.field("deployment_id").unwrap_or_default();

            let data = if event_type == "deployment_creation" {
                deployment_id.to_string()
            } else {
                let status = entry.field("deployment_status").unwrap_or("unknown");
                render_status_fragment(deployment_id, status)
            };

            let event = SseEvent::default()
                .id(&entry.id)
                .event(&event_type)
                .data(data);
            if tx.send(event).await.is_err() {
                debug!("client disconnected from project stream");
                return;
            }

            position = entry.id;
        }
    }
}

fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// One log batch as a single-line HTML fragment. SSE data lines must not
/// contain raw newlines, so they are stripped after rendering.
fn render_log_list(items: &[Item]) -> String {
    let mut html = String::from("<ul class=\"log-list\">");
    for item in items {
        let timestamp = item
            .timestamp_nanos()
            .map(nanos_to_rfc3339)
            .unwrap_or_default();
        let level = item.level.to_string().to_lowercase();
        let _ = write!(
            html,
            "<li class=\"log-line log-level-{level}\"><time datetime=\"{timestamp}\">{timestamp}</time><span class=\"log-message\">{}</span></li>",
            html_escape(&item.message),
        );
    }
    html.push_str("</ul>");

    html.replace(['\n', '\r'], "")
}

/// Status indicator fragment with an out-of-band swap attribute, so the
/// client replaces the matching element in place.
fn render_status_fragment(deployment_id: &str, status: &str) -> String {
    let deployment_id = html_escape(deployment_id);
    let status = html_escape(status);
    format!(
        "<span class=\"deployment-status deployment-status-{status}\" data-deployment-status=\"{deployment_id}\" hx-swap-oob=\"outerHTML:[data-deployment-status='{deployment_id}']\">{status}</span>"
    )
}
