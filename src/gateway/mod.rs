//! Multi-tenant webhook gateway.
//!
//! One axum server fronts every tenant. Inbound platform events arrive at
//! `POST /events/{tenant_id}`; the handler verifies the tenant's webhook
//! signature against the raw body, filters and gates the event, then hands
//! generation off to a detached task so the platform gets its ack within
//! its delivery deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use indexmap::IndexSet;
use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::errors::SwitchboardError;
use crate::events::{CloudEvent, EventPublisher, GENERATION_COMPLETED};
use crate::platform::ChatClient;
use crate::relay::{FAILURE_MESSAGE, GenerationRelay, MediaPart, PlatformEditSink, StreamingEditor};
use crate::signature;
use crate::store::{TenantConfig, TieredTenantStore, TokenExchanger};
use crate::thread::{ContextManager, resolve_thread_id};

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Dedup set bounds: prune back to the floor once the ceiling is hit.
const SEEN_CEILING: usize = 1000;
const SEEN_FLOOR: usize = 500;

const THINKING_PLACEHOLDER: &str = "_Thinking..._";

/// Inbound platform event, keyed by its `type` tag. Everything we don't
/// handle collapses into `Ignored` instead of leaking untyped JSON through
/// the pipeline.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum PlatformEvent {
    #[serde(rename = "message")]
    Message(MessageEvent),
    #[serde(rename = "app_mention")]
    AppMention(MessageEvent),
    #[serde(other)]
    Ignored,
}

#[derive(Debug, serde::Deserialize)]
struct MessageEvent {
    #[serde(default)]
    user: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    /// Non-content change marker (edits, joins, topic changes).
    #[serde(default)]
    subtype: Option<String>,
    /// Present on any bot-authored message.
    #[serde(default)]
    bot_id: Option<String>,
    /// Files the author attached to the message.
    #[serde(default)]
    files: Vec<FileAttachment>,
}

#[derive(Debug, serde::Deserialize)]
struct FileAttachment {
    #[serde(default)]
    url_private: Option<String>,
    #[serde(default)]
    mimetype: Option<String>,
}

/// Attached images, as content parts for the model request. Non-image
/// files have no structured representation downstream and are dropped.
fn image_parts(files: &[FileAttachment]) -> Vec<MediaPart> {
    files
        .iter()
        .filter(|f| {
            f.mimetype
                .as_deref()
                .is_some_and(|m| m.starts_with("image/"))
        })
        .filter_map(|f| f.url_private.clone())
        .map(|url| MediaPart { url })
        .collect()
}

/// Shared state behind every route.
pub struct GatewayState {
    pub store: Arc<TieredTenantStore>,
    pub contexts: Arc<ContextManager>,
    pub relay: Arc<GenerationRelay>,
    pub chat: ChatClient,
    pub exchanger: Option<TokenExchanger>,
    pub publisher: Option<EventPublisher>,
    pub edit_throttle: Duration,
    seen_events: Mutex<IndexSet<String>>,
    degraded: AtomicBool,
    started: Instant,
}

impl GatewayState {
    pub fn new(
        store: Arc<TieredTenantStore>,
        contexts: Arc<ContextManager>,
        relay: Arc<GenerationRelay>,
        chat: ChatClient,
    ) -> Self {
        Self {
            store,
            contexts,
            relay,
            chat,
            exchanger: None,
            publisher: None,
            edit_throttle: Duration::from_millis(500),
            seen_events: Mutex::new(IndexSet::new()),
            degraded: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Duplicate-delivery check; the platform redelivers on slow acks.
    async fn already_seen(&self, key: String) -> bool {
        let mut seen = self.seen_events.lock().await;
        if seen.contains(&key) {
            return true;
        }
        seen.insert(key);
        // IndexSet preserves insertion order, so drain from the front.
        if seen.len() > SEEN_CEILING {
            let drain = seen.len() - SEEN_FLOOR;
            seen.drain(..drain);
            debug!("pruned webhook dedup set to {} entries", seen.len());
        }
        false
    }
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/events/{tenant_id}", post(event_handler))
        .route("/health", get(health_handler))
        .route("/internal/events", post(internal_event_handler))
        .route("/internal/tenants", post(tenant_push_handler))
        .route("/slack/events", post(legacy_handler))
        .with_state(state)
}

/// Start the gateway server. Returns the join handle so the composition
/// root can await it alongside the shutdown signal.
pub async fn start(
    state: Arc<GatewayState>,
    host: &str,
    port: u16,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {}", e);
        }
    });
    Ok(handle)
}

/// POST /events/{tenant_id} — the webhook entry point.
///
/// Works from the raw body because the signature covers the exact bytes on
/// the wire. Every outcome except fatal validation errors acks `{"ok":true}`
/// so the platform never retries events we chose to ignore.
async fn event_handler(
    State(state): State<Arc<GatewayState>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!("rejected unparseable webhook body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid JSON body"})),
            )
                .into_response();
        }
    };

    // Ownership-verification challenge: answered before any tenant exists,
    // so it must not touch the store or the signature check.
    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = payload
            .get("challenge")
            .and_then(Value::as_str)
            .unwrap_or("");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            challenge.to_string(),
        )
            .into_response();
    }

    let tenant = match state.store.load(&tenant_id).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("webhook for unknown tenant {}", tenant_id);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "tenant configuration not cached on this replica",
                    "hint": "push the tenant configuration again to warm the cache, then retry",
                })),
            )
                .into_response();
        }
        Err(e) => {
            error!("tenant lookup failed for {}: {}", tenant_id, e);
            state.degraded.store(true, Ordering::Relaxed);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "tenant store unavailable",
                    "hint": "retry shortly",
                })),
            )
                .into_response();
        }
    };

    let sig = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let ts = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok());
    if !signature::verify(&body, sig, ts, &tenant.signing_secret) {
        warn!("signature verification failed for tenant {}", tenant_id);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid signature"})),
        )
            .into_response();
    }

    let Some(event_value) = payload.get("event") else {
        return ok_ack();
    };
    let event: PlatformEvent = match serde_json::from_value(event_value.clone()) {
        Ok(e) => e,
        Err(_) => return ok_ack(),
    };
    let (is_mention, msg) = match event {
        PlatformEvent::Message(m) => (false, m),
        PlatformEvent::AppMention(m) => (true, m),
        PlatformEvent::Ignored => return ok_ack(),
    };

    // Bot-authored and non-content events never reach the model.
    if msg.bot_id.is_some() || msg.subtype.is_some() {
        return ok_ack();
    }
    if msg.user.is_empty() || msg.channel.is_empty() || msg.ts.is_empty() {
        return ok_ack();
    }
    if let Some(bot_id) = &tenant.bot_user_id
        && msg.user == *bot_id
    {
        debug!("ignoring self-authored event from {}", msg.user);
        return ok_ack();
    }

    let thread_id = resolve_thread_id(msg.thread_ts.as_deref(), &msg.ts);
    let is_dm = is_direct_message(msg.channel_type.as_deref(), &msg.channel);
    let in_thread = msg.thread_ts.is_some();

    // DMs and explicit mentions always process; plain thread replies only
    // once the bot already spoke in that thread; channel chatter never.
    let should_process = is_dm
        || is_mention
        || (in_thread
            && state
                .contexts
                .bot_participates(&msg.channel, &thread_id)
                .await);
    if !should_process {
        return ok_ack();
    }

    if state
        .already_seen(format!("{}:{}:{}", msg.channel, msg.user, msg.ts))
        .await
    {
        debug!("ignoring duplicate delivery {}:{}", msg.channel, msg.ts);
        return ok_ack();
    }

    let text = strip_mention(&msg.text, tenant.bot_user_id.as_deref());
    if text.trim().is_empty() {
        return ok_ack();
    }

    info!(
        "dispatching event for tenant {} in {} (thread {})",
        tenant_id, msg.channel, thread_id
    );

    let spawn_state = state.clone();
    let reply_thread = if is_dm { None } else { Some(thread_id.clone()) };
    let media = image_parts(&msg.files);
    tokio::spawn(async move {
        if let Err(e) = dispatch(
            spawn_state,
            tenant,
            msg.channel,
            thread_id,
            reply_thread,
            msg.user,
            msg.ts,
            text,
            media,
        )
        .await
        {
            error!("event dispatch failed: {}", e);
        }
    });

    ok_ack()
}

fn ok_ack() -> Response {
    Json(json!({"ok": true})).into_response()
}

/// Generation path, detached from the HTTP response.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: Arc<GatewayState>,
    mut tenant: TenantConfig,
    channel: String,
    thread_id: String,
    reply_thread: Option<String>,
    user: String,
    platform_ts: String,
    text: String,
    media: Vec<MediaPart>,
) -> Result<()> {
    // Lazy identity resolution: the first event on a fresh config costs one
    // auth round-trip, after which self-filtering works from the store.
    if tenant.bot_user_id.is_none() {
        match state.chat.auth_test(&tenant.bot_token).await {
            Ok(identity) => {
                tenant.team_id = Some(identity.team_id);
                tenant.bot_user_id = Some(identity.bot_user_id.clone());
                if user == identity.bot_user_id {
                    return Ok(());
                }
                if let Err(e) = state.store.save(&tenant).await {
                    if matches!(e, SwitchboardError::Store { tier: "all", .. }) {
                        state.degraded.store(true, Ordering::Relaxed);
                    }
                    warn!(
                        "could not persist resolved identity for {}: {}",
                        tenant.tenant_id, e
                    );
                }
            }
            Err(e) => warn!("bot identity resolution failed: {}", e),
        }
    }

    let ctx = state.contexts.get_or_create(&channel, &thread_id).await;
    let prompt = state
        .contexts
        .build_prompt(&ctx, &text, tenant.system_prompt.as_deref());
    state
        .contexts
        .append_user(
            &channel,
            &thread_id,
            text.clone(),
            Some(platform_ts),
            Some(user),
            None,
        )
        .await;

    // Out-of-process generation: publish and let the worker answer through
    // /internal/events.
    if let Some(publisher) = &state.publisher {
        return publisher
            .publish_generation_request(
                &channel,
                &thread_id,
                json!({
                    "tenantId": tenant.tenant_id,
                    "messages": prompt,
                    "media": media.iter().map(|m| m.url.as_str()).collect::<Vec<_>>(),
                }),
            )
            .await
            .map_err(Into::into);
    }

    if tenant.behavior.streaming {
        let placeholder = state
            .chat
            .post_message(
                &tenant.bot_token,
                &channel,
                THINKING_PLACEHOLDER,
                reply_thread.as_deref(),
            )
            .await?;

        let sink = PlatformEditSink {
            chat: state.chat.clone(),
            token: tenant.bot_token.clone(),
            channel: channel.clone(),
            ts: placeholder.clone(),
        };
        let mut editor = StreamingEditor::with_throttle(sink, state.edit_throttle);

        match state
            .relay
            .respond(&prompt, &media, &tenant, Some(&mut editor))
            .await
        {
            Ok(final_text) => {
                state
                    .contexts
                    .append_assistant(&channel, &thread_id, final_text, Some(placeholder))
                    .await;
            }
            Err(e) => {
                warn!("generation failed for tenant {}: {}", tenant.tenant_id, e);
                state
                    .chat
                    .update_message(&tenant.bot_token, &channel, &placeholder, FAILURE_MESSAGE)
                    .await?;
            }
        }
        return Ok(());
    }

    match state
        .relay
        .respond::<PlatformEditSink>(&prompt, &media, &tenant, None)
        .await
    {
        Ok(final_text) => {
            let posted = state
                .chat
                .post_message(
                    &tenant.bot_token,
                    &channel,
                    &final_text,
                    reply_thread.as_deref(),
                )
                .await?;
            state
                .contexts
                .append_assistant(&channel, &thread_id, final_text, Some(posted))
                .await;
        }
        Err(e) => {
            warn!("generation failed for tenant {}: {}", tenant.tenant_id, e);
            state
                .chat
                .post_message(
                    &tenant.bot_token,
                    &channel,
                    FAILURE_MESSAGE,
                    reply_thread.as_deref(),
                )
                .await?;
        }
    }
    Ok(())
}

/// Whether the event came over a direct-message channel. `channel_type`
/// is authoritative when present; some delivery paths omit it, in which
/// case the platform's `D`-prefixed DM channel ids decide.
fn is_direct_message(channel_type: Option<&str>, channel: &str) -> bool {
    match channel_type {
        Some(kind) => kind == "im",
        None => channel.starts_with('D'),
    }
}

/// Remove the bot's own mention token before the text reaches the model.
/// Falls back to stripping any leading mention while the bot id is still
/// unresolved.
fn strip_mention(text: &str, bot_user_id: Option<&str>) -> String {
    let pattern = match bot_user_id {
        Some(id) => format!(r"<@{}\s*>\s*", regex::escape(id)),
        None => r"^\s*<@[A-Z0-9]+\s*>\s*".to_string(),
    };
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, "").to_string(),
        Err(e) => {
            warn!("mention regex failed to compile: {}", e);
            text.to_string()
        }
    }
}

/// GET /health — liveness plus the counters operators page on.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let degraded = state.degraded.load(Ordering::Relaxed);
    let body = json!({
        "status": if degraded { "degraded" } else { "ok" },
        "uptime": state.started.elapsed().as_secs(),
        "memory": rss_bytes(),
        "metrics": {
            "tenantCount": state.store.tenant_count(),
            "cacheSize": state.contexts.context_count().await,
        },
    });
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

/// Resident set size in bytes, best-effort.
fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// POST /internal/events — completion events from out-of-process workers.
async fn internal_event_handler(
    State(state): State<Arc<GatewayState>>,
    Json(event): Json<CloudEvent>,
) -> Response {
    if event.event_type != GENERATION_COMPLETED {
        debug!("ignoring {} event {}", event.event_type, event.id);
        return ok_ack();
    }

    let Some((channel, thread_id)) = event
        .subject
        .as_deref()
        .and_then(CloudEvent::parse_subject)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing or malformed subject"})),
        )
            .into_response();
    };

    let tenant_id = event
        .data
        .get("tenantId")
        .and_then(Value::as_str)
        .unwrap_or("");
    let text = event.data.get("text").and_then(Value::as_str).unwrap_or("");
    if tenant_id.is_empty() || text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "completion event needs tenantId and text"})),
        )
            .into_response();
    }

    let tenant = match state.store.load(tenant_id).await {
        Ok(Some(config)) => config,
        _ => {
            warn!("completion event for unknown tenant {}", tenant_id);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "tenant configuration not cached on this replica"})),
            )
                .into_response();
        }
    };

    let reply_thread = if thread_id.is_empty() {
        None
    } else {
        Some(thread_id)
    };
    match state
        .chat
        .post_message(&tenant.bot_token, channel, text, reply_thread)
        .await
    {
        Ok(posted) => {
            if let Some(thread) = reply_thread {
                state
                    .contexts
                    .append_assistant(channel, thread, text, Some(posted))
                    .await;
            }
            ok_ack()
        }
        Err(e) => {
            error!("failed to deliver completion event {}: {}", event.id, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "platform delivery failed"})),
            )
                .into_response()
        }
    }
}

/// POST /internal/tenants — operator-facing configuration push.
async fn tenant_push_handler(
    State(state): State<Arc<GatewayState>>,
    Json(config): Json<TenantConfig>,
) -> Response {
    let tenant_id = config.tenant_id.clone();
    match state.store.upsert(config, state.exchanger.as_ref()).await {
        Ok(()) => {
            info!("tenant {} configuration stored", tenant_id);
            // A successful push proves the store chain works again.
            state.degraded.store(false, Ordering::Relaxed);
            ok_ack()
        }
        Err(SwitchboardError::Config(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": msg})),
        )
            .into_response(),
        Err(e) => {
            error!("tenant {} configuration push failed: {}", tenant_id, e);
            state.degraded.store(true, Ordering::Relaxed);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "configuration could not be persisted"})),
            )
                .into_response()
        }
    }
}

/// The pre-multitenant route. Single-workspace deployments routed every
/// workspace through one shared secret; that scheme is retired rather than
/// kept reachable.
async fn legacy_handler() -> Response {
    (
        StatusCode::GONE,
        Json(json!({
            "error": "this route has been retired",
            "hint": "deliver events to /events/{tenant_id}",
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests;
