// Dispatch core — Backend Adapter contract.
//
// Three concrete adapters live in this module's siblings: `cloud_a` (an
// Anthropic-shaped wire protocol, Shape B tool descriptors), `cloud_b` (an
// OpenAI-compatible wire protocol, Shape A tool descriptors), and `local`
// (an OpenAI-compatible server on localhost, e.g. Ollama, with its own
// health-probe cache).
//
// Adapters never hold a reference to the Degradation Manager, which keeps
// the dependency one-directional. A `chat_stream` call never returns an
// `Err` itself; failures are reported as a `Delta::Error` item on the
// stream so the Dispatcher can record the outcome and decide on fallback
// without the adapter knowing anything about backend health.

mod cloud_a;
mod cloud_b;
mod local;

pub use cloud_a::CloudAAdapter;
pub use cloud_b::CloudBAdapter;
pub use local::LocalAdapter;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

use crate::tools::DescriptorShape;
use crate::types::{Capabilities, Delta, Message, ProviderKind};

/// Max attempts for a single non-streaming request, including the first try.
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_RETRY_DELAY_MS: u64 = 1000;

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 529)
}

pub(crate) async fn retry_delay(attempt: u32) -> std::time::Duration {
    let delay = std::time::Duration::from_millis(INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt));
    tokio::time::sleep(delay).await;
    delay
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// May change between calls for `local` (depends on the health probe);
    /// fixed for the two cloud adapters.
    async fn capabilities(&self) -> Capabilities;

    fn descriptor_shape(&self) -> DescriptorShape;

    /// Streams normalized `Delta` items. Never suspends the Dispatcher
    /// waiting for the whole response — the returned stream yields tokens,
    /// tool-call fragments, and a terminal `End` or `Error` as they arrive.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tool_descriptors: &[serde_json::Value],
        model: &str,
    ) -> ReceiverStream<Delta>;
}
