// Dispatch core — Degradation Manager.
//
// Owns three things the Dispatcher never touches directly: per-backend
// health (circuit breaker state), a bounded advisory request queue, and a
// 24h tool-result cache for offline serving. Mode is always derived from
// current health snapshots, never set directly — callers only ever read it
// via `mode()` after a `record_*` call.
//
// Adapters never hold a reference to this type, so the dependency only ever
// flows one way. The Dispatcher is the only component that reports adapter
// outcomes here.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProviderKind;

const FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(60);
const NETWORK_CHECK_TTL: Duration = Duration::from_secs(30);
const TOOL_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_QUEUE_CAP: usize = 100;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub name: String,
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<u64>,
    pub last_failure: Option<u64>,
    pub rate_limited_until: Option<u64>,
}

impl BackendHealth {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: true,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            rate_limited_until: None,
        }
    }

    fn recompute_available(&mut self, now: u64, recovery_window: Duration) {
        let rate_limited = self.rate_limited_until.map(|t| t > now).unwrap_or(false);
        let circuit_open = self.consecutive_failures >= FAILURE_THRESHOLD
            && self
                .last_failure
                .map(|t| now.saturating_sub(t) < recovery_window.as_secs())
                .unwrap_or(true);
        self.available = !rate_limited && !circuit_open;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedMode {
    Normal,
    Degraded,
    PrimaryUnavailable,
    SecondaryUnavailable,
    RateLimited,
    Offline,
}

impl DegradedMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DegradedMode::Normal => "normal",
            DegradedMode::Degraded => "degraded",
            DegradedMode::PrimaryUnavailable => "primary_unavailable",
            DegradedMode::SecondaryUnavailable => "secondary_unavailable",
            DegradedMode::RateLimited => "rate_limited",
            DegradedMode::Offline => "offline",
        }
    }
}

struct CachedResult {
    value: Value,
    cached_at: u64,
}

struct QueueEntry {
    label: String,
    priority: i32,
    deadline: u64,
}

pub struct DegradationManager {
    recovery_window: Duration,
    queue_cap: usize,
    health: Mutex<HashMap<ProviderKind, BackendHealth>>,
    network_available: Mutex<(bool, u64)>, // (result, checked_at)
    tool_cache: Mutex<HashMap<(String, String), CachedResult>>,
    queue: Mutex<VecDeque<QueueEntry>>,
}

impl DegradationManager {
    pub fn new() -> Self {
        Self::with_recovery_window(DEFAULT_RECOVERY_WINDOW)
    }

    pub fn with_recovery_window(recovery_window: Duration) -> Self {
        let mut health = HashMap::new();
        for kind in [ProviderKind::CloudA, ProviderKind::CloudB, ProviderKind::Local] {
            health.insert(kind, BackendHealth::new(kind.name()));
        }
        Self {
            recovery_window,
            queue_cap: DEFAULT_QUEUE_CAP,
            health: Mutex::new(health),
            network_available: Mutex::new((true, 0)),
            tool_cache: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    // ── Health reporting ──────────────────────────────────────────────

    pub fn record_success(&self, backend: ProviderKind) {
        let now = now_unix();
        let mut health = self.health.lock();
        let entry = health.entry(backend).or_insert_with(|| BackendHealth::new(backend.name()));
        entry.consecutive_failures = 0;
        entry.last_success = Some(now);
        entry.recompute_available(now, self.recovery_window);
    }

    pub fn record_failure(&self, backend: ProviderKind) {
        let now = now_unix();
        let mut health = self.health.lock();
        let entry = health.entry(backend).or_insert_with(|| BackendHealth::new(backend.name()));
        entry.consecutive_failures += 1;
        entry.last_failure = Some(now);
        entry.recompute_available(now, self.recovery_window);
    }

    pub fn record_rate_limit(&self, backend: ProviderKind, retry_after_secs: u64) {
        let now = now_unix();
        let mut health = self.health.lock();
        let entry = health.entry(backend).or_insert_with(|| BackendHealth::new(backend.name()));
        entry.rate_limited_until = Some(now + retry_after_secs);
        entry.recompute_available(now, self.recovery_window);
    }

    pub fn health_snapshot(&self, backend: ProviderKind) -> BackendHealth {
        let now = now_unix();
        let mut health = self.health.lock();
        let entry = health.entry(backend).or_insert_with(|| BackendHealth::new(backend.name()));
        entry.recompute_available(now, self.recovery_window);
        entry.clone()
    }

    pub fn reset(&self, backend: ProviderKind) {
        self.health.lock().insert(backend, BackendHealth::new(backend.name()));
    }

    /// Picks the best available backend, preferring `preferred` when
    /// healthy, else the first other healthy backend, else `preferred`
    /// unchanged (the Dispatcher surfaces the resulting adapter error).
    pub fn get_preferred_backend(&self, preferred: ProviderKind, local_only: bool) -> ProviderKind {
        if local_only {
            return ProviderKind::Local;
        }
        if self.health_snapshot(preferred).available {
            return preferred;
        }
        for candidate in [ProviderKind::CloudA, ProviderKind::CloudB, ProviderKind::Local] {
            if candidate != preferred && self.health_snapshot(candidate).available {
                return candidate;
            }
        }
        preferred
    }

    // ── Network detection ─────────────────────────────────────────────

    /// Best-effort DNS resolution for a well-known hostname, cached for 30s
    /// unless `force` bypasses the cache. Returns `false` only on a genuine
    /// resolution failure — the only path into `OFFLINE` mode.
    pub fn network_available(&self, force: bool) -> bool {
        let now = now_unix();
        {
            let cached = self.network_available.lock();
            if !force && now.saturating_sub(cached.1) < NETWORK_CHECK_TTL.as_secs() {
                return cached.0;
            }
        }
        let available = std::net::ToSocketAddrs::to_socket_addrs(&("one.one.one.one", 443)).is_ok();
        *self.network_available.lock() = (available, now);
        available
    }

    /// Test-only hook to force the cached network-availability result
    /// without touching DNS. Bypassed by `network_available(true)`.
    #[cfg(test)]
    pub fn set_network_available_for_test(&self, available: bool) {
        *self.network_available.lock() = (available, now_unix());
    }

    // ── Mode computation (derived, never set directly) ────────────────

    pub fn mode(&self) -> DegradedMode {
        if !self.network_available(false) {
            return DegradedMode::Offline;
        }

        let primary = self.health_snapshot(ProviderKind::CloudA);
        let secondary = self.health_snapshot(ProviderKind::CloudB);
        let local = self.health_snapshot(ProviderKind::Local);

        let any_rate_limited = [&primary, &secondary, &local]
            .iter()
            .any(|h| h.rate_limited_until.map(|t| t > now_unix()).unwrap_or(false));

        if any_rate_limited {
            return DegradedMode::RateLimited;
        }
        if !primary.available && !secondary.available {
            return DegradedMode::SecondaryUnavailable;
        }
        if !primary.available {
            return DegradedMode::PrimaryUnavailable;
        }
        if !secondary.available || !local.available {
            return DegradedMode::Degraded;
        }
        DegradedMode::Normal
    }

    // ── Tool-result cache ─────────────────────────────────────────────

    pub fn cache_tool_result(&self, tool_name: &str, args_hash: &str, value: Value) {
        let mut cache = self.tool_cache.lock();
        cache.retain(|_, v| now_unix().saturating_sub(v.cached_at) < TOOL_CACHE_TTL.as_secs());
        cache.insert((tool_name.to_string(), args_hash.to_string()), CachedResult { value, cached_at: now_unix() });
    }

    pub fn cached_tool_result(&self, tool_name: &str, args_hash: &str) -> Option<Value> {
        let cache = self.tool_cache.lock();
        let entry = cache.get(&(tool_name.to_string(), args_hash.to_string()))?;
        if now_unix().saturating_sub(entry.cached_at) < TOOL_CACHE_TTL.as_secs() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    // ── Advisory queue (purely advisory, never auto-drained) ──────────

    /// Enqueues an entry, dropping the lowest-priority tail item if the
    /// queue is at capacity. Purely advisory — nothing dequeues and resumes
    /// a request automatically; this exists only so callers can surface
    /// "N requests waiting" to a user interface.
    pub fn enqueue(&self, label: impl Into<String>, priority: i32, deadline_secs_from_now: u64) -> bool {
        let mut queue = self.queue.lock();
        self.purge_expired(&mut queue);
        if queue.len() >= self.queue_cap {
            return false;
        }
        let deadline = now_unix() + deadline_secs_from_now;
        let entry = QueueEntry { label: label.into(), priority, deadline };
        let pos = queue.iter().position(|e| e.priority < priority).unwrap_or(queue.len());
        queue.insert(pos, entry);
        true
    }

    pub fn queue_len(&self) -> usize {
        let mut queue = self.queue.lock();
        self.purge_expired(&mut queue);
        queue.len()
    }

    pub fn dequeue(&self) -> Option<String> {
        let mut queue = self.queue.lock();
        self.purge_expired(&mut queue);
        queue.pop_front().map(|e| e.label)
    }

    fn purge_expired(&self, queue: &mut VecDeque<QueueEntry>) {
        let now = now_unix();
        queue.retain(|e| e.deadline > now);
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_becomes_unavailable_after_threshold_failures() {
        let dm = DegradationManager::new();
        for _ in 0..3 {
            dm.record_failure(ProviderKind::CloudA);
        }
        assert!(!dm.health_snapshot(ProviderKind::CloudA).available);
    }

    #[test]
    fn success_resets_failure_counter() {
        let dm = DegradationManager::new();
        dm.record_failure(ProviderKind::CloudA);
        dm.record_failure(ProviderKind::CloudA);
        dm.record_success(ProviderKind::CloudA);
        let h = dm.health_snapshot(ProviderKind::CloudA);
        assert_eq!(h.consecutive_failures, 0);
        assert!(h.available);
    }

    #[test]
    fn recovery_window_elapsing_restores_availability() {
        let dm = DegradationManager::with_recovery_window(Duration::from_secs(0));
        for _ in 0..3 {
            dm.record_failure(ProviderKind::CloudA);
        }
        assert!(dm.health_snapshot(ProviderKind::CloudA).available);
    }

    #[test]
    fn rate_limit_expires_independent_of_failure_count() {
        let dm = DegradationManager::new();
        dm.record_rate_limit(ProviderKind::CloudA, 0);
        let h = dm.health_snapshot(ProviderKind::CloudA);
        assert!(h.available);
    }

    #[test]
    fn preferred_backend_falls_back_when_primary_unavailable() {
        let dm = DegradationManager::new();
        for _ in 0..3 {
            dm.record_failure(ProviderKind::CloudA);
        }
        let chosen = dm.get_preferred_backend(ProviderKind::CloudA, false);
        assert_ne!(chosen, ProviderKind::CloudA);
    }

    #[test]
    fn local_only_mode_always_returns_local() {
        let dm = DegradationManager::new();
        assert_eq!(dm.get_preferred_backend(ProviderKind::CloudA, true), ProviderKind::Local);
    }

    #[test]
    fn tool_cache_round_trips() {
        let dm = DegradationManager::new();
        dm.cache_tool_result("fetch", "abc123", serde_json::json!({"ok": true}));
        let cached = dm.cached_tool_result("fetch", "abc123");
        assert_eq!(cached, Some(serde_json::json!({"ok": true})));
        assert_eq!(dm.cached_tool_result("fetch", "other"), None);
    }

    #[test]
    fn queue_respects_capacity_and_priority_order() {
        let dm = DegradationManager::new();
        assert!(dm.enqueue("low", 0, 60));
        assert!(dm.enqueue("high", 10, 60));
        assert_eq!(dm.queue_len(), 2);
        assert_eq!(dm.dequeue(), Some("high".to_string()));
        assert_eq!(dm.dequeue(), Some("low".to_string()));
    }

    #[test]
    fn queue_drops_expired_entries() {
        let dm = DegradationManager::new();
        dm.enqueue("expires-immediately", 0, 0);
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(dm.queue_len(), 0);
    }

    #[test]
    fn mode_is_not_offline_when_all_backends_unavailable_but_network_up() {
        let dm = DegradationManager::new();
        dm.set_network_available_for_test(true);
        for backend in [ProviderKind::CloudA, ProviderKind::CloudB, ProviderKind::Local] {
            for _ in 0..3 {
                dm.record_failure(backend);
            }
        }
        assert_ne!(dm.mode(), DegradedMode::Offline);
    }

    #[test]
    fn mode_is_offline_only_when_network_check_fails() {
        let dm = DegradationManager::new();
        dm.set_network_available_for_test(false);
        assert_eq!(dm.mode(), DegradedMode::Offline);
    }
}
