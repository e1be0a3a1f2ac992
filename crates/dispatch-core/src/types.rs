// Dispatch core — shared wire types.
//
// These are the structures that flow across every component boundary:
// conversation messages, tool schemas, the common `Delta` shape every
// Backend Adapter normalizes into, and the Dispatcher's own `Event` stream.
// Component-owned state (BackendHealth, AuditEntry, RateBucket, Fact,
// ProfileEntry) lives in the module that owns it, not here.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrlData {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrlData },
    Document { mime_type: String, data: String, name: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn as_text_ref(&self) -> &str {
        match self {
            MessageContent::Text(s) => s.as_str(),
            MessageContent::Blocks(_) => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Canonical JSON arguments (already fully assembled from deltas).
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function_name: Option<String>,
    pub arguments_delta: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: None,
        }
    }
}

// ── Tool schema (two export shapes) ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Shape A — `{ type: "function", function: {...} }` (OpenAI-compatible backends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinitionA {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// Shape B — `{ name, description, input_schema }` (Anthropic-shaped backends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinitionB {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

// ── Backend Adapter contract ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    RateLimit,
    Transient,
    Auth,
    Unavailable,
}

#[derive(Debug, Clone)]
pub enum Delta {
    TextDelta(String),
    ToolCallDelta(ToolCallDelta),
    End(EndReason),
    Error { kind: AdapterErrorKind, retry_after: Option<u64>, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Cloud-A: Anthropic-shaped wire protocol (Shape B tool descriptors).
    CloudA,
    /// Cloud-B: OpenAI-compatible wire protocol (Shape A tool descriptors).
    CloudB,
    /// Local: an OpenAI-compatible server reachable on localhost (e.g. Ollama).
    Local,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::CloudA => "cloud-a",
            ProviderKind::CloudB => "cloud-b",
            ProviderKind::Local => "local",
        }
    }
}

// ── Permission levels ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Sandbox = 0,
    Local = 1,
    System = 2,
    Full = 3,
}

impl PermissionLevel {
    pub fn name(self) -> &'static str {
        match self {
            PermissionLevel::Sandbox => "SANDBOX",
            PermissionLevel::Local => "LOCAL",
            PermissionLevel::System => "SYSTEM",
            PermissionLevel::Full => "FULL",
        }
    }

    pub fn from_env_value(v: u8) -> Self {
        match v {
            0 => PermissionLevel::Sandbox,
            1 => PermissionLevel::Local,
            2 => PermissionLevel::System,
            _ => PermissionLevel::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub current_level: PermissionLevel,
    pub current_level_name: String,
    pub required_level: PermissionLevel,
    pub required_level_name: String,
    pub pending_args: serde_json::Value,
}

impl EscalationPayload {
    pub fn new(current: PermissionLevel, required: PermissionLevel, pending_args: serde_json::Value) -> Self {
        Self {
            current_level: current,
            current_level_name: current.name().to_string(),
            required_level: required,
            required_level_name: required.name().to_string(),
            pending_args,
        }
    }
}

// ── Tool Runner result (tagged union instead of a loosely-typed map) ───

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Ok { value: serde_json::Value },
    Error { kind: crate::error::ErrorKind, message: String },
    Escalation { payload: EscalationPayload },
    RateLimited { retry_after: u64 },
}

impl ToolResult {
    pub fn success(&self) -> bool {
        matches!(self, ToolResult::Ok { .. })
    }

    /// A compact summary for the audit log (≤200 chars).
    pub fn summary(&self) -> String {
        let raw = match self {
            ToolResult::Ok { value } => value.to_string(),
            ToolResult::Error { kind, message } => format!("error[{}]: {}", kind.as_str(), message),
            ToolResult::Escalation { payload } => format!(
                "escalation: {} < {}",
                payload.current_level_name, payload.required_level_name
            ),
            ToolResult::RateLimited { retry_after } => format!("rate_limited: retry_after={retry_after}"),
        };
        crate::util::truncate_utf8(&raw, 200).to_string()
    }
}

// ── Dispatcher event stream ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Start { model: String, provider: String, conversation_id: String },
    Token { text: String },
    ToolCall { name: String, input: serde_json::Value },
    ToolResult { name: String, result: ToolResult },
    Done {
        total_text: String,
        model: String,
        degraded_mode: String,
        context_stats: ContextStats,
    },
    Error(crate::error::DispatchError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStats {
    pub summarized_count: usize,
    pub verbatim_count: usize,
    pub total_messages: usize,
}

// ── Chat request / response ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub conversation_id: String,
    pub timestamp: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_escalation: Option<EscalationPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_tools: Option<Vec<String>>,
}

/// Total ordering used by `Ord`/`PartialOrd` derive above — kept explicit
/// as a regression test, since the numeric discriminants encode the
/// SANDBOX < LOCAL < SYSTEM < FULL chain.
pub fn permission_ordering_is_total() -> CmpOrdering {
    PermissionLevel::Sandbox.cmp(&PermissionLevel::Full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_levels_are_totally_ordered() {
        assert!(PermissionLevel::Sandbox < PermissionLevel::Local);
        assert!(PermissionLevel::Local < PermissionLevel::System);
        assert!(PermissionLevel::System < PermissionLevel::Full);
        assert_eq!(permission_ordering_is_total(), CmpOrdering::Less);
    }

    #[test]
    fn message_content_as_text_flattens_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::ImageUrl { image_url: ImageUrlData { url: "x".into(), detail: None } },
            ContentBlock::Text { text: "b".into() },
        ]);
        assert_eq!(content.as_text(), "ab");
    }

    #[test]
    fn tool_result_summary_is_truncated() {
        let long = "x".repeat(500);
        let r = ToolResult::Ok { value: serde_json::json!(long) };
        assert!(r.summary().len() <= 203); // quotes + ellipsis allowance
    }

    #[test]
    fn event_serializes_with_tagged_kind() {
        let e = Event::Token { text: "hi".into() };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "token");
        assert_eq!(v["text"], "hi");
    }
}
