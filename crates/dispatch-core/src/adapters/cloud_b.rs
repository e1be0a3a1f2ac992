// Dispatch core — Cloud-B adapter: OpenAI-compatible wire protocol.
//
// Translates the common message/tool shape to and from an OpenAI-compatible
// chat-completions endpoint: the retry loop, SSE chunk parsing, and request
// shape all live here. Streams `Delta` items over a channel as they arrive
// rather than collecting the whole response before returning.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use super::{is_retryable_status, retry_delay, BackendAdapter, MAX_RETRIES};
use crate::tools::DescriptorShape;
use crate::types::{
    AdapterErrorKind, Capabilities, ContentBlock, Delta, EndReason, Message, MessageContent,
    ProviderKind, Role, ToolCallDelta,
};

pub struct CloudBAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CloudBAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into(), api_key: api_key.into() }
    }

    pub(crate) fn format_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let content_val = match &msg.content {
                    MessageContent::Text(s) => json!(s),
                    MessageContent::Blocks(blocks) => {
                        let parts: Vec<Value> = blocks
                            .iter()
                            .map(|b| match b {
                                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                                ContentBlock::ImageUrl { image_url } => json!({
                                    "type": "image_url",
                                    "image_url": {
                                        "url": image_url.url,
                                        "detail": image_url.detail.as_deref().unwrap_or("auto"),
                                    }
                                }),
                                ContentBlock::Document { mime_type, data, name } => json!({
                                    "type": "text",
                                    "text": format!("[attachment {}: {}]", name.clone().unwrap_or_default(), mime_type),
                                    "data": data,
                                }),
                            })
                            .collect();
                        json!(parts)
                    }
                };
                let mut m = json!({ "role": msg.role.as_str(), "content": content_val });
                if let Some(tc) = &msg.tool_calls {
                    m["tool_calls"] = json!(tc
                        .iter()
                        .map(|c| json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments.to_string() }
                        }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                if let Some(name) = &msg.name {
                    m["name"] = json!(name);
                }
                m
            })
            .collect()
    }

    fn parse_sse_chunk(data: &str) -> Option<Vec<Delta>> {
        if data == "[DONE]" {
            return Some(vec![]);
        }
        let v: Value = serde_json::from_str(data).ok()?;
        let choice = v["choices"].get(0)?;
        let delta = &choice["delta"];
        let finish_reason = choice["finish_reason"].as_str();

        let mut out = Vec::new();
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                out.push(Delta::TextDelta(text.to_string()));
            }
        }
        if let Some(tcs) = delta["tool_calls"].as_array() {
            for tc in tcs {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                out.push(Delta::ToolCallDelta(ToolCallDelta {
                    index,
                    id: tc["id"].as_str().map(String::from),
                    function_name: tc["function"]["name"].as_str().map(String::from),
                    arguments_delta: tc["function"]["arguments"].as_str().map(String::from),
                }));
            }
        }
        if let Some(reason) = finish_reason {
            let end = match reason {
                "tool_calls" => EndReason::ToolCalls,
                "length" => EndReason::Length,
                _ => EndReason::Stop,
            };
            out.push(Delta::End(end));
        }
        Some(out)
    }

    fn classify_status(status: u16) -> AdapterErrorKind {
        match status {
            401 | 403 => AdapterErrorKind::Auth,
            429 => AdapterErrorKind::RateLimit,
            500 | 502 | 503 | 529 => AdapterErrorKind::Transient,
            _ => AdapterErrorKind::Transient,
        }
    }

    fn retry_after_from_headers(resp: &reqwest::Response) -> Option<u64> {
        resp.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())
    }

    pub(crate) async fn run_stream(
        client: Client,
        url: String,
        api_key: String,
        body: Value,
        tx: tokio::sync::mpsc::Sender<Delta>,
    ) {
        let mut last_error = String::new();
        let mut last_kind = AdapterErrorKind::Transient;
        let mut last_retry_after = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                log::warn!("[adapters::cloud_b] retry {attempt}/{MAX_RETRIES}");
                retry_delay(attempt - 1).await;
            }

            let response = match client
                .post(&url)
                .header("Authorization", format!("Bearer {api_key}"))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {e}");
                    last_kind = AdapterErrorKind::Transient;
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let kind = Self::classify_status(status);
                let retry_after = Self::retry_after_from_headers(&response);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("api error {status}: {}", crate::util::truncate_utf8(&body_text, 300));
                last_kind = kind;
                last_retry_after = retry_after;
                if kind == AdapterErrorKind::RateLimit || kind == AdapterErrorKind::Auth {
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
                        let _ = tx
                            .send(Delta::Error { kind: AdapterErrorKind::Transient, retry_after: None, message: e.to_string() })
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(deltas) = Self::parse_sse_chunk(data) {
                            for d in deltas {
                                if tx.send(d).await.is_err() {
                                    return;
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
impl BackendAdapter for CloudBAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudB
    }

    async fn capabilities(&self) -> Capabilities {
        Capabilities { supports_tools: true, supports_vision: true, supports_streaming: true }
    }

    fn descriptor_shape(&self) -> DescriptorShape {
        DescriptorShape::A
    }

    async fn chat_stream(&self, messages: &[Message], tool_descriptors: &[Value], model: &str) -> ReceiverStream<Delta> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": model,
            "messages": Self::format_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !tool_descriptors.is_empty() {
            body["tools"] = json!(tool_descriptors);
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
    fn format_messages_round_trips_role_and_content() {
        let messages = vec![Message::user("hi")];
        let formatted = CloudBAdapter::format_messages(&messages);
        assert_eq!(formatted[0]["role"], "user");
        assert_eq!(formatted[0]["content"], "hi");
    }

    #[test]
    fn parse_sse_chunk_extracts_text_delta() {
        let data = r#"{"choices":[{"delta":{"content":"hello"},"finish_reason":null}]}"#;
        let deltas = CloudBAdapter::parse_sse_chunk(data).unwrap();
        assert!(matches!(&deltas[0], Delta::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_sse_chunk_extracts_tool_call_delta() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"fetch","arguments":"{\"url\""}}]},"finish_reason":null}]}"#;
        let deltas = CloudBAdapter::parse_sse_chunk(data).unwrap();
        assert!(matches!(&deltas[0], Delta::ToolCallDelta(d) if d.function_name.as_deref() == Some("fetch")));
    }

    #[test]
    fn parse_sse_chunk_maps_finish_reason_to_end() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#;
        let deltas = CloudBAdapter::parse_sse_chunk(data).unwrap();
        assert!(matches!(deltas.last(), Some(Delta::End(EndReason::ToolCalls))));
    }

    #[test]
    fn parse_sse_chunk_handles_done_sentinel() {
        let deltas = CloudBAdapter::parse_sse_chunk("[DONE]").unwrap();
        assert!(deltas.is_empty());
    }

    #[test]
    fn classify_status_maps_rate_limit_and_auth() {
        assert_eq!(CloudBAdapter::classify_status(429), AdapterErrorKind::RateLimit);
        assert_eq!(CloudBAdapter::classify_status(401), AdapterErrorKind::Auth);
        assert_eq!(CloudBAdapter::classify_status(503), AdapterErrorKind::Transient);
    }

    #[tokio::test]
    async fn capabilities_report_tools_and_streaming() {
        let adapter = CloudBAdapter::new("http://example.invalid", "key");
        let caps = adapter.capabilities().await;
        assert!(caps.supports_tools);
        assert!(caps.supports_streaming);
    }
}
