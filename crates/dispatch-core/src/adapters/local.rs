// Dispatch core — Local adapter: an OpenAI-compatible server on localhost
// (e.g. Ollama). Probes `/api/tags` to confirm the server is reachable and
// that the configured model is present, matching the model name while
// ignoring a `:tag` suffix.
//
// Health is probed on first use and cached for 30s. A missing server
// (`/api/tags` unreachable) is reported distinctly from a missing model
// (server reachable, but the configured model isn't in its list) — both
// make `capabilities().supports_streaming == false`, but only the former
// degrades the whole adapter; the model case is still surfaced so a caller
// can decide whether to pull it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use super::cloud_b::CloudBAdapter;
use crate::adapters::BackendAdapter;
use crate::tools::DescriptorShape;
use crate::types::{AdapterErrorKind, Capabilities, Delta, Message, ProviderKind};

const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthState {
    Ready,
    ServerMissing,
    ModelMissing,
}

struct CachedHealth {
    state: HealthState,
    checked_at: Instant,
}

pub struct LocalAdapter {
    client: Client,
    base_url: String,
    model: String,
    inner: CloudBAdapter,
    health: Mutex<Option<CachedHealth>>,
}

impl LocalAdapter {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let model = model.into();
        Self {
            client: Client::new(),
            inner: CloudBAdapter::new(base_url.clone(), String::new()),
            base_url,
            model,
            health: Mutex::new(None),
        }
    }

    async fn probe(&self) -> HealthState {
        {
            let cached = self.health.lock();
            if let Some(c) = cached.as_ref() {
                if c.checked_at.elapsed() < HEALTH_CACHE_TTL {
                    return c.state;
                }
            }
        }

        let state = self.probe_uncached().await;
        *self.health.lock() = Some(CachedHealth { state, checked_at: Instant::now() });
        state
    }

    async fn probe_uncached(&self) -> HealthState {
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        let resp = match self.client.get(&url).timeout(Duration::from_secs(3)).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return HealthState::ServerMissing,
        };

        let v: Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return HealthState::ServerMissing,
        };

        let model_base = self.model.split(':').next().unwrap_or(&self.model);
        let models = v["models"].as_array().cloned().unwrap_or_default();
        let found = models.iter().any(|m| {
            ["name", "model"].iter().any(|key| {
                m[key]
                    .as_str()
                    .map(|name| {
                        let name_base = name.split(':').next().unwrap_or(name);
                        name_base == model_base || name == self.model
                    })
                    .unwrap_or(false)
            })
        });

        if found {
            HealthState::Ready
        } else {
            HealthState::ModelMissing
        }
    }
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn capabilities(&self) -> Capabilities {
        let ready = self.probe().await == HealthState::Ready;
        Capabilities { supports_tools: true, supports_vision: false, supports_streaming: ready }
    }

    fn descriptor_shape(&self) -> DescriptorShape {
        DescriptorShape::A
    }

    async fn chat_stream(&self, messages: &[Message], tool_descriptors: &[Value], model: &str) -> ReceiverStream<Delta> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        match self.probe().await {
            HealthState::ServerMissing => {
                let _ = tx
                    .send(Delta::Error {
                        kind: AdapterErrorKind::Unavailable,
                        retry_after: None,
                        message: format!("local backend unreachable at {}", self.base_url),
                    })
                    .await;
                return ReceiverStream::new(rx);
            }
            HealthState::ModelMissing => {
                let _ = tx
                    .send(Delta::Error {
                        kind: AdapterErrorKind::Unavailable,
                        retry_after: None,
                        message: format!("model '{}' not found on local backend", self.model),
                    })
                    .await;
                return ReceiverStream::new(rx);
            }
            HealthState::Ready => {}
        }

        // Model is ready — delegate wire-level streaming to the
        // OpenAI-compatible implementation this backend actually speaks.
        self.inner.chat_stream(messages, tool_descriptors, model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capabilities_disable_streaming_when_server_unreachable() {
        let adapter = LocalAdapter::new("http://127.0.0.1:1", "llama3.2");
        let caps = adapter.capabilities().await;
        assert!(!caps.supports_streaming);
    }

    #[tokio::test]
    async fn chat_stream_emits_unavailable_when_server_unreachable() {
        use futures::StreamExt;
        let adapter = LocalAdapter::new("http://127.0.0.1:1", "llama3.2");
        let mut stream = adapter.chat_stream(&[Message::user("hi")], &[], "llama3.2").await;
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Delta::Error { kind: AdapterErrorKind::Unavailable, .. }));
    }

    #[tokio::test]
    async fn health_probe_result_is_cached() {
        let adapter = LocalAdapter::new("http://127.0.0.1:1", "llama3.2");
        let first = adapter.probe().await;
        let second = adapter.probe().await;
        assert_eq!(first, second);
    }
}
