//! `/chat/complete` (sync + SSE), `/chat/compact`, `/chat/token-usage`,
//! and the session endpoints.
//!
//! The streaming path is a producer/consumer pair: the tool loop runs in
//! a worker task pushing structured events into a bounded channel; the
//! SSE response drains it.  Client disconnect closes the channel and the
//! worker runs to completion on its own.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    agent::{LoopContext, LoopEvent, PromptParts},
    gateway::{
        authn::{ClientKey, require_user},
        error::ApiError,
        state::AppState,
    },
    providers::{ChatMessage, ChatOptions, Role, failover::FailoverOutcome},
    sessions::SessionStore,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/complete", post(chat_complete))
        .route("/chat/compact", post(chat_compact))
        .route("/chat/token-usage", get(chat_token_usage))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
}

// ─── Request shapes ──────────────────────────────────────────────────────────

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    provider: String,
    messages: Vec<Value>,
    #[serde(default)]
    model: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default)]
    use_workspace: bool,
    #[serde(default)]
    use_page_context: bool,
    /// Last active-tab snapshot supplied by the embedding shell; only
    /// consulted when `use_page_context` is set.
    #[serde(default)]
    page_context: Option<PageContext>,
    #[serde(default = "default_true")]
    use_tools: bool,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    persona: String,
    #[serde(default)]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct PageContext {
    #[serde(default)]
    url: String,
    #[serde(default)]
    html: String,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    stream: bool,
}

fn to_chat_messages(raw: &[Value]) -> Vec<ChatMessage> {
    raw.iter()
        .map(|m| {
            let role = match m["role"].as_str() {
                Some("system") => Role::System,
                Some("assistant") => Role::Assistant,
                _ => Role::User,
            };
            ChatMessage {
                role,
                content: m["content"].as_str().unwrap_or_default().to_owned(),
            }
        })
        .collect()
}

/// Build the combined system prompt.  Persona and workspace blocks come
/// from external collaborators (absent in a bare deployment; the flags
/// are accepted so embedding shells can light them up); the gateway
/// contributes the page-context, caller, and tool-protocol blocks.
fn assemble_system(state: &AppState, req: &ChatRequest) -> Option<String> {
    let _ = (req.use_workspace, &req.persona);
    let page_context = req
        .use_page_context
        .then(|| req.page_context.as_ref())
        .flatten()
        .filter(|page| !page.html.is_empty())
        .map(|page| {
            let html = crate::agent::prompt::truncate_page_html(
                &page.html,
                state.config.page_html_cap,
            );
            format!("## Active page\n\nURL: {}\n\n{}", page.url, html)
        });
    let memory = state.relevant_memory.as_ref().and_then(|provider| {
        let latest = req
            .messages
            .iter()
            .rev()
            .find(|m| m["role"] == "user")
            .and_then(|m| m["content"].as_str())?;
        provider.context_for(latest)
    });
    let parts = PromptParts {
        page_context,
        extra: (!req.system_prompt.is_empty()).then(|| req.system_prompt.clone()),
        memory,
        tools_block: req.use_tools.then(|| state.engine.build_tool_system_block(true)),
        ..PromptParts::default()
    };
    parts.assemble()
}

fn persist_session(
    sessions: &SessionStore,
    sid: &str,
    req_messages: &[Value],
    reply: &FailoverOutcome,
    provider: &str,
    model: &str,
) {
    let meta = json!({ "provider": provider, "model": model });
    for m in req_messages {
        let role = m["role"].as_str().unwrap_or_default();
        if role == "user" || role == "assistant" {
            sessions.save_message(sid, role, m["content"].as_str().unwrap_or_default(), meta.clone());
        }
    }
    if !reply.outcome.content.is_empty() {
        sessions.save_message(
            sid,
            "assistant",
            &reply.outcome.content,
            json!({ "provider": provider, "model": reply.outcome.model }),
        );
    }
}

fn terminal_value(result: &FailoverOutcome, sid: &str) -> Value {
    let mut value = serde_json::to_value(result).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("session_id".to_owned(), json!(sid));
    }
    value
}

// ─── /chat/complete ──────────────────────────────────────────────────────────

async fn chat_complete(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    state.rate_limiter.check_client(&client.0)?;
    let user = require_user(&state, &headers)?;
    state.rate_limiter.check_user(&user.username)?;

    // Content policy over every message body.
    let contents: Vec<Value> = req
        .messages
        .iter()
        .map(|m| m["content"].clone())
        .collect();
    if let Err(violation) = state.filter.check(&Value::Array(contents)) {
        return Err(ApiError::forbidden(json!({
            "error": "content_policy_violation",
            "matched_rule": violation.matched_rule,
            "pattern": violation.pattern,
        })));
    }

    if !state.failover.is_available(&req.provider) {
        return Err(ApiError::service_unavailable(json!(format!(
            "provider {:?} and all fallbacks are unavailable",
            req.provider
        ))));
    }

    let sid = if SessionStore::is_valid_id(req.session_id.trim()) {
        req.session_id.trim().to_owned()
    } else {
        SessionStore::new_session_id()
    };

    let system = assemble_system(&state, &req);
    let mut messages = to_chat_messages(&req.messages);
    if let Some(system_text) = &system {
        // Set both the native system field and a leading system message so
        // adapters without a dedicated field still receive it.
        messages.insert(0, ChatMessage::system(system_text.clone()));
    }
    let opts = ChatOptions {
        model: (!req.model.is_empty()).then(|| req.model.clone()),
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        system,
    };

    if query.stream {
        Ok(stream_response(state, req, messages, opts, sid).into_response())
    } else {
        sync_response(state, req, messages, opts, sid)
            .await
            .map(IntoResponse::into_response)
    }
}

async fn sync_response(
    state: Arc<AppState>,
    req: ChatRequest,
    messages: Vec<ChatMessage>,
    opts: ChatOptions,
    sid: String,
) -> Result<Json<Value>, ApiError> {
    let result = run_chat(&state, &req, messages, opts, &sid).await.map_err(|err| {
        metrics::counter!("provider_errors_total", "provider" => req.provider.clone())
            .increment(1);
        ApiError::bad_gateway(format!("provider error: {err}"))
    })?;
    metrics::counter!("provider_requests_total", "provider" => req.provider.clone()).increment(1);
    state.token_usage.record(&result.outcome.model, &result.outcome.usage);
    persist_session(&state.sessions, &sid, &req.messages, &result, &req.provider, &req.model);
    Ok(Json(terminal_value(&result, &sid)))
}

async fn run_chat(
    state: &AppState,
    req: &ChatRequest,
    messages: Vec<ChatMessage>,
    opts: ChatOptions,
    sid: &str,
) -> Result<FailoverOutcome, String> {
    let model = (!req.model.is_empty()).then_some(req.model.as_str());
    if req.use_tools {
        state
            .engine
            .run(
                &state.failover,
                &req.provider,
                model,
                messages,
                opts,
                0,
                LoopContext::new(sid),
            )
            .await
    } else {
        state
            .failover
            .chat_with_failover(&req.provider, model, &messages, &opts)
            .await
    }
}

/// SSE variant: structured loop events in real time, then the full
/// content chunked at word boundaries, then one terminal event.
fn stream_response(
    state: Arc<AppState>,
    req: ChatRequest,
    messages: Vec<ChatMessage>,
    opts: ChatOptions,
    sid: String,
) -> Sse<axum::response::sse::KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let (ev_tx, mut ev_rx) = mpsc::channel::<LoopEvent>(64);

        // Event pump: loop events become SSE frames as they happen.
        let pump_tx = tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = ev_rx.recv().await {
                let frame = Event::default().data(
                    serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned()),
                );
                if pump_tx.send(Ok(frame)).await.is_err() {
                    // Client went away; keep draining so the loop never blocks.
                    continue;
                }
            }
        });

        let result = {
            let model = (!req.model.is_empty()).then_some(req.model.as_str());
            if req.use_tools {
                state
                    .engine
                    .run(
                        &state.failover,
                        &req.provider,
                        model,
                        messages,
                        opts,
                        0,
                        LoopContext::new(sid.as_str()).with_events(ev_tx),
                    )
                    .await
            } else {
                drop(ev_tx);
                state
                    .failover
                    .chat_with_failover(&req.provider, model, &messages, &opts)
                    .await
            }
        };
        // The loop context (and with it the event sender) is gone; wait for
        // the pump so tool events always precede the token stream.
        let _ = pump.await;

        match result {
            Err(err) => {
                metrics::counter!("provider_errors_total", "provider" => req.provider.clone())
                    .increment(1);
                let frame = Event::default()
                    .data(json!({ "error": err, "done": true }).to_string());
                let _ = tx.send(Ok(frame)).await;
            }
            Ok(result) => {
                metrics::counter!("provider_requests_total", "provider" => req.provider.clone())
                    .increment(1);
                state.token_usage.record(&result.outcome.model, &result.outcome.usage);
                persist_session(
                    &state.sessions,
                    &sid,
                    &req.messages,
                    &result,
                    &req.provider,
                    &req.model,
                );

                // Word-chunked tokens for a typewriter-style UX.
                let content = result.outcome.content.clone();
                let words: Vec<&str> = content.split(' ').collect();
                let last = words.len().saturating_sub(1);
                for (i, word) in words.iter().enumerate() {
                    let token = if i < last { format!("{word} ") } else { (*word).to_owned() };
                    let frame = Event::default()
                        .data(json!({ "token": token, "done": false }).to_string());
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                let mut terminal = terminal_value(&result, &sid);
                if let Some(obj) = terminal.as_object_mut() {
                    obj.insert("done".to_owned(), json!(true));
                }
                let _ = tx
                    .send(Ok(Event::default().data(terminal.to_string())))
                    .await;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)).text("keepalive"))
}

// ─── /chat/compact ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompactRequest {
    messages: Vec<Value>,
    provider: String,
    #[serde(default)]
    model: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
}

/// Compress a conversation into a short brief via the provider chain.
async fn chat_compact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = require_user(&state, &headers)?;
    state.rate_limiter.check_user(&user.username)?;

    let transcript: String = req
        .messages
        .iter()
        .map(|m| {
            format!(
                "{}: {}\n",
                m["role"].as_str().unwrap_or("user"),
                m["content"].as_str().unwrap_or_default()
            )
        })
        .collect();
    let opts = ChatOptions {
        model: (!req.model.is_empty()).then(|| req.model.clone()),
        temperature: 0.2,
        max_tokens: req.max_tokens,
        system: Some(
            "Compress the following conversation into a compact brief. Preserve facts, \
             decisions, open questions, and tool results. Reply with the brief only."
                .to_owned(),
        ),
    };
    let messages = vec![ChatMessage::user(transcript)];
    let result = state
        .failover
        .chat_with_failover(&req.provider, opts.model.as_deref(), &messages, &opts)
        .await
        .map_err(|err| ApiError::bad_gateway(format!("provider error: {err}")))?;

    Ok(Json(json!({
        "summary": result.outcome.content,
        "message_count": req.messages.len(),
        "model": result.outcome.model,
        "provider": result.actual_provider,
    })))
}

// ─── /chat/token-usage ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenUsageQuery {
    #[serde(default)]
    model: String,
}

async fn chat_token_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenUsageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers)?;
    let model = (!query.model.is_empty()).then_some(query.model.as_str());
    Ok(Json(json!({ "usage": state.token_usage.snapshot(model) })))
}

// ─── Sessions ────────────────────────────────────────────────────────────────

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers)?;
    Ok(Json(json!({ "sessions": state.sessions.list() })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers)?;
    state
        .sessions
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("session not found"))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers)?;
    if state.sessions.delete(&id) {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(ApiError::not_found("session not found"))
    }
}
