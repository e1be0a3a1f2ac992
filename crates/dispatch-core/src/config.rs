// Dispatch core — engine configuration.
//
// Configuration *loading* (files, CLI flags) is out of scope — that's the
// embedding binary's job. What lives here is the small aggregate the
// Dispatcher needs at construction time, plus `from_env()` readers for the
// four documented environment variables.

use crate::types::PermissionLevel;

/// Default token budget handed to `ConversationStore::build_context`.
const DEFAULT_TOKEN_BUDGET: usize = 8_000;
const DEFAULT_MAX_TOOL_ROUNDS: u32 = 12;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_provider: crate::types::ProviderKind,
    pub default_model: String,
    pub default_system_prompt: String,
    pub max_tool_rounds: u32,
    pub tool_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub token_budget: usize,
    pub permission_level: PermissionLevel,
    pub local_backend_host: String,
    pub local_backend_model: String,
    pub local_only_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_provider: crate::types::ProviderKind::CloudA,
            default_model: "claude-3-5-sonnet-latest".to_string(),
            default_system_prompt: "You are a helpful local AI assistant.".to_string(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT_SECS,
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            token_budget: DEFAULT_TOKEN_BUDGET,
            permission_level: PermissionLevel::Local,
            local_backend_host: "http://127.0.0.1:11434".to_string(),
            local_backend_model: "llama3.2".to_string(),
            local_only_mode: false,
        }
    }
}

impl EngineConfig {
    /// Overlay the four documented environment variables on top of
    /// `Default`. Unset or unparseable variables are left at their default —
    /// this never fails, matching the "external collaborator" treatment of
    /// configuration loading.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PERMISSION_LEVEL") {
            if let Ok(n) = v.trim().parse::<u8>() {
                cfg.permission_level = PermissionLevel::from_env_value(n);
            } else {
                log::warn!("[config] PERMISSION_LEVEL={v:?} is not a number 0..3, keeping default");
            }
        }

        if let Ok(host) = std::env::var("LOCAL_BACKEND_HOST") {
            cfg.local_backend_host = host;
        }
        if let Ok(model) = std::env::var("LOCAL_BACKEND_MODEL") {
            cfg.local_backend_model = model;
        }

        // LOG_LEVEL is read by the embedding binary's logger setup, not the
        // library itself — we don't touch it here.

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.token_budget > 0);
        assert!(cfg.max_tool_rounds > 0);
        assert_eq!(cfg.permission_level, PermissionLevel::Local);
    }

    #[test]
    fn from_env_reads_permission_level() {
        std::env::set_var("PERMISSION_LEVEL", "3");
        let cfg = EngineConfig::from_env();
        std::env::remove_var("PERMISSION_LEVEL");
        assert_eq!(cfg.permission_level, PermissionLevel::Full);
    }

    #[test]
    fn from_env_ignores_garbage() {
        std::env::set_var("PERMISSION_LEVEL", "not-a-number");
        let cfg = EngineConfig::from_env();
        std::env::remove_var("PERMISSION_LEVEL");
        assert_eq!(cfg.permission_level, EngineConfig::default().permission_level);
    }

    #[test]
    fn from_env_reads_local_backend_overrides() {
        std::env::set_var("LOCAL_BACKEND_HOST", "http://example:1234");
        std::env::set_var("LOCAL_BACKEND_MODEL", "mistral");
        let cfg = EngineConfig::from_env();
        std::env::remove_var("LOCAL_BACKEND_HOST");
        std::env::remove_var("LOCAL_BACKEND_MODEL");
        assert_eq!(cfg.local_backend_host, "http://example:1234");
        assert_eq!(cfg.local_backend_model, "mistral");
    }
}
