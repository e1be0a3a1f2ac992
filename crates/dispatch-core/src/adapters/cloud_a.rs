// Dispatch core — Cloud-A adapter: Anthropic-shaped wire protocol.
//
// Translates the common message/tool shape to and from this provider's wire
// format: system-prompt extraction, tool_use/tool_result message shaping,
// and SSE event parsing keyed on the event's `type` field. Streams `Delta`s
// as they arrive and marks `cache_control` breakpoints on the system prompt
// and tool list so repeated turns in the same conversation can hit the
// provider's prompt cache.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use super::{is_retryable_status, retry_delay, MAX_RETRIES};
use crate::adapters::BackendAdapter;
use crate::tools::DescriptorShape;
use crate::types::{
    AdapterErrorKind, Capabilities, ContentBlock, Delta, EndReason, Message, MessageContent,
    ProviderKind, Role, ToolCallDelta,
};

const MAX_TOKENS: u64 = 8192;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct CloudAAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CloudAAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into(), api_key: api_key.into() }
    }

    fn format_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut formatted = Vec::new();

        for msg in messages {
            if msg.role == Role::System {
                system = Some(msg.content.as_text());
                continue;
            }

            match msg.role {
                Role::Tool => {
                    if let Some(tc_id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": tc_id,
                                "content": msg.content.as_text(),
                            }]
                        }));
                    }
                }
                Role::Assistant => {
                    if let Some(tool_calls) = &msg.tool_calls {
                        let mut blocks: Vec<Value> = Vec::new();
                        let text = msg.content.as_text();
                        if !text.is_empty() {
                            blocks.push(json!({"type": "text", "text": text}));
                        }
                        for tc in tool_calls {
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            }));
                        }
                        formatted.push(json!({"role": "assistant", "content": blocks}));
                    } else {
                        formatted.push(json!({"role": "assistant", "content": msg.content.as_text()}));
                    }
                }
                _ => match &msg.content {
                    MessageContent::Blocks(blocks) => {
                        let parts: Vec<Value> = blocks
                            .iter()
                            .map(|b| match b {
                                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                                ContentBlock::ImageUrl { image_url } => {
                                    if let Some(rest) = image_url.url.strip_prefix("data:") {
                                        if let Some((media_type, b64)) = rest.split_once(";base64,") {
                                            return json!({
                                                "type": "image",
                                                "source": {"type": "base64", "media_type": media_type, "data": b64}
                                            });
                                        }
                                    }
                                    json!({"type": "image", "source": {"type": "url", "url": image_url.url}})
                                }
                                ContentBlock::Document { mime_type, data, .. } => {
                                    json!({"type": "document", "source": {"type": "base64", "media_type": mime_type, "data": data}})
                                }
                            })
                            .collect();
                        formatted.push(json!({"role": "user", "content": parts}));
                    }
                    MessageContent::Text(s) => {
                        formatted.push(json!({"role": "user", "content": s}));
                    }
                },
            }
        }

        (system, formatted)
    }

    /// Marks the last tool descriptor, if any, as a cache breakpoint — the
    /// tool list is usually stable across turns in a conversation, so this
    /// is where caching pays off most.
    fn with_cache_breakpoint(mut tools: Vec<Value>) -> Vec<Value> {
        if let Some(last) = tools.last_mut() {
            last["cache_control"] = json!({"type": "ephemeral"});
        }
        tools
    }

    fn system_block_with_cache(system: &str) -> Value {
        json!([{ "type": "text", "text": system, "cache_control": {"type": "ephemeral"} }])
    }

    fn parse_sse_event(event_type: &str, v: &Value) -> Option<Vec<Delta>> {
        match event_type {
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => Some(vec![Delta::TextDelta(delta["text"].as_str()?.to_string())]),
                    "input_json_delta" => {
                        let index = v["index"].as_u64().unwrap_or(0) as usize;
                        Some(vec![Delta::ToolCallDelta(ToolCallDelta {
                            index,
                            id: None,
                            function_name: None,
                            arguments_delta: delta["partial_json"].as_str().map(String::from),
                        })])
                    }
                    _ => None,
                }
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let index = v["index"].as_u64().unwrap_or(0) as usize;
                    Some(vec![Delta::ToolCallDelta(ToolCallDelta {
                        index,
                        id: block["id"].as_str().map(String::from),
                        function_name: block["name"].as_str().map(String::from),
                        arguments_delta: None,
                    })])
                } else {
                    None
                }
            }
            "message_delta" => {
                let stop_reason = v["delta"]["stop_reason"].as_str()?;
                let end = match stop_reason {
                    "tool_use" => EndReason::ToolCalls,
                    "max_tokens" => EndReason::Length,
                    _ => EndReason::Stop,
                };
                Some(vec![Delta::End(end)])
            }
            "error" => {
                let message = v["error"]["message"].as_str().unwrap_or("anthropic stream error").to_string();
                let kind = match v["error"]["type"].as_str().unwrap_or("") {
                    "rate_limit_error" => AdapterErrorKind::RateLimit,
                    "authentication_error" | "permission_error" => AdapterErrorKind::Auth,
                    _ => AdapterErrorKind::Transient,
                };
                Some(vec![Delta::Error { kind, retry_after: None, message }])
            }
            _ => None,
        }
    }

    fn classify_status(status: u16) -> AdapterErrorKind {
        match status {
            401 | 403 => AdapterErrorKind::Auth,
            429 => AdapterErrorKind::RateLimit,
            _ => AdapterErrorKind::Transient,
        }
    }

    async fn run_stream(client: Client, url: String, api_key: String, body: Value, tx: tokio::sync::mpsc::Sender<Delta>) {
        let mut last_error = String::new();
        let mut last_kind = AdapterErrorKind::Transient;
        let mut last_retry_after = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                log::warn!("[adapters::cloud_a] retry {attempt}/{MAX_RETRIES}");
                retry_delay(attempt - 1).await;
            }

            let response = match client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("anthropic-beta", "prompt-caching-2024-07-31")
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {e}");
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                last_kind = Self::classify_status(status);
                last_retry_after = response.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok());
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("api error {status}: {}", crate::util::truncate_utf8(&body_text, 300));
                if last_kind == AdapterErrorKind::RateLimit || last_kind == AdapterErrorKind::Auth {
                    break;
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                break;
            }

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Delta::Error { kind: AdapterErrorKind::Transient, retry_after: None, message: e.to_string() }).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            let event_type = v["type"].as_str().unwrap_or("");
                            if let Some(deltas) = Self::parse_sse_event(event_type, &v) {
                                for d in deltas {
                                    if tx.send(d).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            return;
        }

        let _ = tx.send(Delta::Error { kind: last_kind, retry_after: last_retry_after, message: last_error }).await;
    }
}

#[async_trait]
impl BackendAdapter for CloudAAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudA
    }

    async fn capabilities(&self) -> Capabilities {
        Capabilities { supports_tools: true, supports_vision: true, supports_streaming: true }
    }

    fn descriptor_shape(&self) -> DescriptorShape {
        DescriptorShape::B
    }

    async fn chat_stream(&self, messages: &[Message], tool_descriptors: &[Value], model: &str) -> ReceiverStream<Delta> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let (system, formatted) = Self::format_messages(messages);

        let mut body = json!({
            "model": model,
            "messages": formatted,
            "max_tokens": MAX_TOKENS,
            "stream": true,
        });
        if let Some(sys) = system {
            body["system"] = Self::system_block_with_cache(&sys);
        }
        if !tool_descriptors.is_empty() {
            body["tools"] = json!(Self::with_cache_breakpoint(tool_descriptors.to_vec()));
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(Self::run_stream(client, url, api_key, body, tx));
        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_messages_extracts_system_prompt() {
        let messages = vec![Message::system("be nice"), Message::user("hi")];
        let (system, formatted) = CloudAAdapter::format_messages(&messages);
        assert_eq!(system.as_deref(), Some("be nice"));
        assert_eq!(formatted.len(), 1);
    }

    #[test]
    fn tool_result_message_becomes_user_tool_result_block() {
        let messages = vec![Message::tool_result("call_1", "42")];
        let (_, formatted) = CloudAAdapter::format_messages(&messages);
        assert_eq!(formatted[0]["role"], "user");
        assert_eq!(formatted[0]["content"][0]["type"], "tool_result");
        assert_eq!(formatted[0]["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn with_cache_breakpoint_marks_only_last_tool() {
        let tools = vec![json!({"name": "a"}), json!({"name": "b"})];
        let tagged = CloudAAdapter::with_cache_breakpoint(tools);
        assert!(tagged[0].get("cache_control").is_none());
        assert_eq!(tagged[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn system_block_carries_cache_control() {
        let block = CloudAAdapter::system_block_with_cache("be nice");
        assert_eq!(block[0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn parse_sse_event_extracts_text_delta() {
        let v: Value = serde_json::from_str(r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#).unwrap();
        let deltas = CloudAAdapter::parse_sse_event("content_block_delta", &v).unwrap();
        assert!(matches!(&deltas[0], Delta::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn parse_sse_event_maps_stop_reason_to_end() {
        let v: Value = serde_json::from_str(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#).unwrap();
        let deltas = CloudAAdapter::parse_sse_event("message_delta", &v).unwrap();
        assert!(matches!(deltas[0], Delta::End(EndReason::ToolCalls)));
    }

    #[test]
    fn parse_sse_event_maps_rate_limit_error() {
        let v: Value = serde_json::from_str(r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#).unwrap();
        let deltas = CloudAAdapter::parse_sse_event("error", &v).unwrap();
        assert!(matches!(&deltas[0], Delta::Error { kind: AdapterErrorKind::RateLimit, .. }));
    }
}
