// Dispatch core — error types.
//
// Two layers:
//   `EngineError`  — internal plumbing error (thiserror), used by `?` inside
//                    store/crypto/io code. Carries no secret material.
//   `ErrorKind`    — the closed, wire-facing kind set from the external
//                    interface contract. Every user-visible failure (tool
//                    result, adapter error, dispatcher `error` event) is
//                    described by one of these, never by a raw `EngineError`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The closed error-kind set. Every `kind` field on the wire is one of
/// these ASCII identifiers, serialized verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    UnsafeInput,
    PermissionRequired,
    RateLimited,
    Timeout,
    Transient,
    Auth,
    Unavailable,
    Offline,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::UnsafeInput => "unsafe_input",
            ErrorKind::PermissionRequired => "permission_required",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Offline => "offline",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A user-visible failure: stable kind, human message, and the optional
/// extras some kinds carry (`retry_after`, `escalation`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<crate::types::EscalationPayload>,
}

impl DispatchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None, escalation: None }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn with_escalation(mut self, escalation: crate::types::EscalationPayload) -> Self {
        self.escalation = Some(escalation);
        self
    }

    /// `internal` errors never leak their source detail to the client.
    pub fn internal(e: &EngineError) -> Self {
        log::error!("[internal] {}", e);
        Self::new(ErrorKind::Internal, "an internal error occurred")
    }
}
