// Dispatch core — the Dispatcher.
//
// The orchestrator: turns a (conversation_id, user_text, attachments) tuple
// into a stream of typed `Event`s and a durable assistant message, running
// as many model/tool rounds as the model requests.
//
// `Context` threads every collaborator the Dispatcher needs in as a field,
// set up once at construction time, instead of reaching for ambient
// process-wide singletons. The only interior mutability is the permission
// level itself (it can change mid-process) and the collaborators that
// already document their own (health, rate buckets, tool cache).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::adapters::BackendAdapter;
use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::conversation::{ConversationStore, StoredMessage};
use crate::degradation::DegradationManager;
use crate::error::{DispatchError, ErrorKind};
use crate::loop_guard::detect_response_loop;
use crate::profile::ProfileAggregator;
use crate::safety::{PermissionAuditLog, PermissionChange};
use crate::settings::SettingsStore;
use crate::tool_runner::ToolRunner;
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{
    AdapterErrorKind, ChatResponse, ContentBlock, ContextStats, Delta, EndReason, EscalationPayload, Event,
    Message, MessageContent, PermissionLevel, ProviderKind, Role, ToolCall, ToolResult,
};
use crate::util::now_rfc3339;

pub const DEFAULT_CONVERSATION_ID: &str = "default";

/// Everything the Dispatcher needs, shared behind `Arc` across concurrent
/// requests — operations across conversations run fully in parallel, and
/// each store is internally synchronized for the parts that need it.
pub struct Context {
    pub conversation: Arc<ConversationStore>,
    pub settings: Arc<SettingsStore>,
    pub tools: Arc<ToolRegistry>,
    pub tool_runner: Arc<ToolRunner>,
    pub degradation: Arc<DegradationManager>,
    pub audit: Arc<AuditLog>,
    pub profile: Arc<ProfileAggregator>,
    pub permission_audit: Arc<PermissionAuditLog>,
    pub adapters: HashMap<ProviderKind, Arc<dyn BackendAdapter>>,
    pub config: EngineConfig,
    permission_level: RwLock<PermissionLevel>,
}

impl Context {
    pub fn new(
        conversation: Arc<ConversationStore>,
        settings: Arc<SettingsStore>,
        tools: Arc<ToolRegistry>,
        tool_runner: Arc<ToolRunner>,
        degradation: Arc<DegradationManager>,
        audit: Arc<AuditLog>,
        profile: Arc<ProfileAggregator>,
        permission_audit: Arc<PermissionAuditLog>,
        adapters: HashMap<ProviderKind, Arc<dyn BackendAdapter>>,
        config: EngineConfig,
    ) -> Self {
        let permission_level = RwLock::new(config.permission_level);
        Self {
            conversation,
            settings,
            tools,
            tool_runner,
            degradation,
            audit,
            profile,
            permission_audit,
            adapters,
            config,
            permission_level,
        }
    }

    pub fn permission_level(&self) -> PermissionLevel {
        *self.permission_level.read()
    }

    /// Changes the process-wide permission level and appends to the
    /// permission audit log in the same call — the two must never drift
    /// apart.
    pub fn set_permission_level(&self, new_level: PermissionLevel, source: &str, reason: Option<String>) {
        let old_level = {
            let mut guard = self.permission_level.write();
            let old = *guard;
            *guard = new_level;
            old
        };
        self.permission_audit.record(PermissionChange {
            old_level,
            new_level,
            source: source.to_string(),
            ip: None,
            user_agent: None,
            reason,
            timestamp: now_rfc3339(),
        });
    }

    fn model_for(&self, provider: ProviderKind) -> String {
        match provider {
            ProviderKind::Local => self.config.local_backend_model.clone(),
            _ => self.config.default_model.clone(),
        }
    }

    /// A different healthy backend than `current`, or `None` if none exists
    /// (including when local-only mode leaves no alternative).
    fn fallback_for(&self, current: ProviderKind) -> Option<ProviderKind> {
        if self.config.local_only_mode {
            return None;
        }
        [ProviderKind::CloudA, ProviderKind::CloudB, ProviderKind::Local]
            .into_iter()
            .find(|&candidate| candidate != current && self.degradation.health_snapshot(candidate).available)
    }
}

/// Accumulates one tool call across however many `ToolCallDelta` fragments
/// an adapter emits for a given index before the terminating `End`.
#[derive(Default)]
struct ToolCallBuffer {
    id: Option<String>,
    name: Option<String>,
    args_json: String,
}

pub struct Dispatcher {
    ctx: Arc<Context>,
    /// One lock per conversation id so that two concurrent `send()` calls on
    /// the same conversation serialize rather than interleave their
    /// assistant output, while unrelated conversations run in parallel.
    conversation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// What `send_nonstreaming` produces: the same information a streaming
/// caller would reconstruct from the event sequence.
pub enum SendOutcome {
    Response(ChatResponse),
    Error(DispatchError),
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, conversation_locks: Mutex::new(HashMap::new()) }
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.conversation_locks
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Non-blocking: returns immediately with a stream that emits events
    /// until a terminal `done` or `error`.
    pub async fn send(
        &self,
        conversation_id: Option<String>,
        user_text: String,
        attachments: Vec<ContentBlock>,
    ) -> ReceiverStream<Event> {
        let conversation_id = conversation_id.unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());
        let (tx, rx) = mpsc::channel(64);
        let ctx = self.ctx.clone();
        let lock = self.lock_for(&conversation_id);

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            run_request(ctx, conversation_id, user_text, attachments, tx).await;
        });

        ReceiverStream::new(rx)
    }

    /// Convenience wrapper used by internal callers and tests: drives
    /// `send` to completion and folds the event stream into one outcome.
    /// Must reconstruct exactly the bytes the streaming caller would see
    /// concatenated.
    pub async fn send_nonstreaming(
        &self,
        conversation_id: Option<String>,
        user_text: String,
        attachments: Vec<ContentBlock>,
    ) -> SendOutcome {
        let conversation_id = conversation_id.unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string());
        let mut stream = self.send(Some(conversation_id.clone()), user_text, attachments).await;

        let mut escalation = None;
        while let Some(event) = stream.next().await {
            match event {
                Event::ToolResult { result: ToolResult::Escalation { payload }, .. } => {
                    escalation = Some(payload);
                }
                Event::Done { total_text, model, .. } => {
                    return SendOutcome::Response(ChatResponse {
                        response: total_text,
                        conversation_id,
                        timestamp: now_rfc3339(),
                        model,
                        permission_escalation: escalation,
                        suggested_tools: None,
                    });
                }
                Event::Error(e) => return SendOutcome::Error(e),
                _ => {}
            }
        }

        // Stream closed without a terminal event — treat as an internal
        // failure rather than fabricating a response.
        SendOutcome::Error(DispatchError::new(ErrorKind::Internal, "event stream closed without a terminal event"))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

async fn emit(tx: &mpsc::Sender<Event>, event: Event) -> bool {
    tx.send(event).await.is_ok()
}

/// The full request/response round loop, run inside the spawned task while
/// the per-conversation lock is held.
async fn run_request(
    ctx: Arc<Context>,
    conversation_id: String,
    user_text: String,
    attachments: Vec<ContentBlock>,
    tx: mpsc::Sender<Event>,
) {
    // Step 1: persist the user message.
    if let Err(e) = ctx.conversation.append(&conversation_id, Role::User, &user_text) {
        log::error!("[dispatcher] failed to persist user message: {e}");
        let _ = emit(&tx, Event::Error(DispatchError::internal(&e))).await;
        return;
    }

    // Step 2: context assembly.
    let (mut messages, stats) = match assemble_context(&ctx, &conversation_id, &attachments) {
        Ok(v) => v,
        Err(e) => {
            let _ = emit(&tx, Event::Error(DispatchError::internal(&e))).await;
            return;
        }
    };

    // Step 3: backend selection.
    let mut provider = ctx.degradation.get_preferred_backend(ctx.config.default_provider, ctx.config.local_only_mode);
    let mut model = ctx.model_for(provider);

    if !emit(&tx, Event::Start { model: model.clone(), provider: provider.name().to_string(), conversation_id: conversation_id.clone() }).await {
        return;
    }

    let mut accumulated_text = String::new();
    let mut fallback_used = false;
    let mut escalation_hit: Option<EscalationPayload> = None;
    let mut rounds = 0u32;

    'rounds: loop {
        rounds += 1;
        if rounds > ctx.config.max_tool_rounds {
            log::warn!("[dispatcher] max tool rounds ({}) exceeded, finalizing with current text", ctx.config.max_tool_rounds);
            break 'rounds;
        }
        if rounds > 1 {
            detect_response_loop(&mut messages);
        }

        let Some(adapter) = ctx.adapters.get(&provider).cloned() else {
            let _ = emit(&tx, Event::Error(DispatchError::new(ErrorKind::Unavailable, format!("no adapter registered for {}", provider.name())))).await;
            return;
        };

        let tool_descriptors = ctx.tools.describe_for(adapter.descriptor_shape());
        let mut stream = adapter.chat_stream(&messages, &tool_descriptors, &model).await;

        let mut round_text = String::new();
        let mut tool_buffers: BTreeMap<usize, ToolCallBuffer> = BTreeMap::new();
        let mut end_reason = None;
        let mut adapter_error: Option<(AdapterErrorKind, Option<u64>, String)> = None;

        while let Some(delta) = stream.next().await {
            match delta {
                Delta::TextDelta(text) => {
                    round_text.push_str(&text);
                    accumulated_text.push_str(&text);
                    if !emit(&tx, Event::Token { text }).await {
                        persist_partial(&ctx, &conversation_id, &accumulated_text);
                        return;
                    }
                }
                Delta::ToolCallDelta(d) => {
                    let buf = tool_buffers.entry(d.index).or_default();
                    if d.id.is_some() {
                        buf.id = d.id;
                    }
                    if d.function_name.is_some() {
                        buf.name = d.function_name;
                    }
                    if let Some(frag) = d.arguments_delta {
                        buf.args_json.push_str(&frag);
                    }
                }
                Delta::End(reason) => {
                    end_reason = Some(reason);
                    break;
                }
                Delta::Error { kind, retry_after, message } => {
                    adapter_error = Some((kind, retry_after, message));
                    break;
                }
            }
        }

        if let Some((kind, retry_after, message)) = adapter_error {
            match kind {
                AdapterErrorKind::RateLimit => ctx.degradation.record_rate_limit(provider, retry_after.unwrap_or(30)),
                _ => ctx.degradation.record_failure(provider),
            }

            if !fallback_used && accumulated_text.is_empty() {
                if let Some(alt) = ctx.fallback_for(provider) {
                    log::warn!("[dispatcher] {} failed ({message}), falling back to {}", provider.name(), alt.name());
                    fallback_used = true;
                    provider = alt;
                    model = ctx.model_for(provider);
                    continue 'rounds;
                }
            }

            persist_partial(&ctx, &conversation_id, &accumulated_text);
            let error_kind = match kind {
                AdapterErrorKind::RateLimit => ErrorKind::RateLimited,
                AdapterErrorKind::Auth => ErrorKind::Auth,
                AdapterErrorKind::Unavailable => ErrorKind::Unavailable,
                AdapterErrorKind::Transient => ErrorKind::Transient,
            };
            let mut err = DispatchError::new(error_kind, message);
            if let Some(secs) = retry_after {
                err = err.with_retry_after(secs);
            }
            let _ = emit(&tx, Event::Error(err)).await;
            return;
        }

        ctx.degradation.record_success(provider);

        let tool_calls = finalize_tool_calls(tool_buffers);
        if tool_calls.is_empty() || end_reason != Some(EndReason::ToolCalls) {
            // No tool calls requested this round — the model gave its
            // (possibly final) answer.
            break 'rounds;
        }

        messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Text(round_text),
            tool_calls: Some(tool_calls.clone()),
            tool_call_id: None,
            name: None,
        });

        let tool_ctx = ToolContext { conversation_id: conversation_id.clone(), permission_level: ctx.permission_level() };
        for call in tool_calls {
            if !emit(&tx, Event::ToolCall { name: call.name.clone(), input: call.arguments.clone() }).await {
                persist_partial(&ctx, &conversation_id, &accumulated_text);
                return;
            }

            let result = ctx.tool_runner.run(&call.name, call.arguments.clone(), &tool_ctx).await;

            if let ToolResult::Escalation { payload } = &result {
                escalation_hit = Some(payload.clone());
            }

            let result_text = tool_result_text(&result);
            messages.push(Message::tool_result(call.id.clone(), result_text));

            let is_escalation = matches!(result, ToolResult::Escalation { .. });
            if !emit(&tx, Event::ToolResult { name: call.name, result }).await {
                persist_partial(&ctx, &conversation_id, &accumulated_text);
                return;
            }

            // Escalation results do not retry automatically — the round
            // ends and surfaces to the client.
            if is_escalation {
                break 'rounds;
            }
        }
    }

    // Finalization. The assistant message is persisted even when empty: the
    // model was invoked (and may have attempted a tool call) whenever we
    // reach this point, so invariant #1 requires a matching assistant
    // message regardless of whether an escalation cut the round short.
    let assistant_text = accumulated_text.clone();
    if let Err(e) = ctx.conversation.append(&conversation_id, Role::Assistant, &assistant_text) {
        log::error!("[dispatcher] failed to persist assistant message: {e}");
    }

    maybe_auto_title(&ctx, &conversation_id);

    let _ = emit(
        &tx,
        Event::Done {
            total_text: accumulated_text,
            model,
            degraded_mode: ctx.degradation.mode().as_str().to_string(),
            context_stats: stats,
        },
    )
    .await;
}

fn persist_partial(ctx: &Context, conversation_id: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    let marked = format!("{text}\n\n[partial: response interrupted]");
    if let Err(e) = ctx.conversation.append(conversation_id, Role::Assistant, &marked) {
        log::error!("[dispatcher] failed to persist partial assistant message: {e}");
    }
}

fn tool_result_text(result: &ToolResult) -> String {
    match result {
        ToolResult::Ok { value } => value.to_string(),
        ToolResult::Error { kind, message } => format!("error[{}]: {message}", kind.as_str()),
        ToolResult::Escalation { payload } => {
            format!("permission escalation required: {} < {}", payload.current_level_name, payload.required_level_name)
        }
        ToolResult::RateLimited { retry_after } => format!("rate limited, retry after {retry_after}s"),
    }
}

fn finalize_tool_calls(buffers: BTreeMap<usize, ToolCallBuffer>) -> Vec<ToolCall> {
    buffers
        .into_iter()
        .filter_map(|(index, buf)| {
            let name = buf.name?;
            let id = buf.id.unwrap_or_else(|| format!("call_{index}"));
            let arguments = if buf.args_json.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&buf.args_json).unwrap_or_else(|_| Value::Object(Default::default()))
            };
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

/// Resolves the effective system prompt, prepends the profile summary,
/// pulls the token-bounded context, and splices attachments onto the user
/// turn that was just appended.
fn assemble_context(
    ctx: &Context,
    conversation_id: &str,
    attachments: &[ContentBlock],
) -> crate::error::EngineResult<(Vec<Message>, ContextStats)> {
    let system_prompt = effective_system_prompt(ctx, conversation_id)?;
    let profile_summary = ctx.profile.summary()?;
    let full_system = if profile_summary.is_empty() {
        system_prompt
    } else {
        format!("{system_prompt}\n\n{profile_summary}")
    };

    let summarizer = |omitted: &[&StoredMessage]| extractive_summary(omitted);
    let (mut history, stats) = ctx.conversation.build_context(conversation_id, ctx.config.token_budget, &summarizer)?;

    if !attachments.is_empty() {
        if let Some(last_user) = history.iter_mut().rev().find(|m| m.role == Role::User) {
            let mut blocks = vec![ContentBlock::Text { text: last_user.content.as_text() }];
            blocks.extend_from_slice(attachments);
            last_user.content = MessageContent::Blocks(blocks);
        }
    }

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(full_system));
    messages.append(&mut history);
    Ok((messages, stats))
}

fn effective_system_prompt(ctx: &Context, conversation_id: &str) -> crate::error::EngineResult<String> {
    if let Some(custom) = ctx.settings.get(&format!("system_prompt_override:{conversation_id}"))? {
        if !custom.trim().is_empty() {
            return Ok(custom);
        }
    }
    if let Some(persona) = ctx.settings.get(&format!("persona:{conversation_id}"))? {
        if !persona.trim().is_empty() {
            return Ok(persona);
        }
    }
    Ok(ctx.config.default_system_prompt.clone())
}

/// Deterministic extractive summarizer (Open Question 3): no model call, no
/// recursive dependency back into the Dispatcher — joins a short excerpt of
/// each omitted message with its role.
fn extractive_summary(omitted: &[&StoredMessage]) -> String {
    if omitted.is_empty() {
        return String::new();
    }
    let excerpts: Vec<String> = omitted
        .iter()
        .map(|m| {
            let excerpt = crate::util::truncate_utf8(m.content.trim(), 80);
            format!("{}: {excerpt}", m.role.as_str())
        })
        .collect();
    format!(
        "[earlier conversation summary, {} message(s) omitted]\n{}",
        omitted.len(),
        excerpts.join("\n")
    )
}

/// Best-effort, fire-and-forget auto-titling: only runs once the
/// conversation has at least two messages and no title yet. Uses a short
/// extractive title rather than a model call, for the same reason the
/// summarizer avoids one — titling a conversation from inside the
/// Dispatcher that is dispatching it would be recursive.
fn maybe_auto_title(ctx: &Context, conversation_id: &str) {
    let count = match ctx.conversation.count(conversation_id) {
        Ok(c) => c,
        Err(_) => return,
    };
    if count < 2 {
        return;
    }
    let conversations = match ctx.conversation.list_conversations() {
        Ok(c) => c,
        Err(_) => return,
    };
    let already_titled = conversations
        .iter()
        .any(|(id, title)| id == conversation_id && title.as_ref().map(|t| !t.is_empty()).unwrap_or(false));
    if already_titled {
        return;
    }

    let first_user = match ctx.conversation.messages(conversation_id, 1, 0) {
        Ok(msgs) => msgs.into_iter().next(),
        Err(_) => return,
    };
    let Some(first) = first_user else { return };
    let title = extractive_title(&first.content);
    if let Err(e) = ctx.conversation.rename(conversation_id, &title) {
        log::warn!("[dispatcher] auto-titling failed, ignored: {e}");
    }
}

fn extractive_title(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().take(7).collect();
    let mut title = words.join(" ");
    if title.len() > 60 {
        title = crate::util::truncate_utf8(&title, 57).to_string() + "...";
    }
    if title.is_empty() {
        title = "New conversation".to_string();
    }
    title
}
