// Dispatch core — audit log.
//
// Durable source of truth is `audit.db` (single table, append-only). A
// bounded in-memory ring buffer mirrors the same entries for fast
// introspection without a DB round trip — e.g. a UI tailing recent tool
// activity. Arguments are never persisted in clear in either place.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineResult;
use crate::util::truncate_utf8;

const RING_BUFFER_CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub tool_name: String,
    /// First 16 hex chars of `sha256(canonical_json(args))` — never the
    /// arguments themselves.
    pub args_hash: String,
    pub result_summary: String,
    pub success: bool,
    pub duration_ms: u64,
    pub sandboxed: bool,
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ip: Option<String>,
}

/// `sha256(canonical_json(args))[:16]`.
pub fn hash_args(args: &serde_json::Value) -> String {
    let canonical = canonicalize(args);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    hex[..16].to_string()
}

/// Recursively sorts object keys so the same logical arguments always hash
/// identically regardless of construction order.
fn canonicalize(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

pub struct AuditLog {
    conn: Mutex<Connection>,
    ring: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn open(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                args_hash TEXT NOT NULL,
                result_summary TEXT NOT NULL,
                success INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                sandboxed INTEGER NOT NULL,
                rate_limited INTEGER NOT NULL,
                user_ip TEXT
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn), ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)) })
    }

    pub fn append(&self, entry: AuditEntry) -> EngineResult<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO audit_entries
                    (timestamp, tool_name, args_hash, result_summary, success, duration_ms, sandboxed, rate_limited, user_ip)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.timestamp,
                    entry.tool_name,
                    entry.args_hash,
                    truncate_utf8(&entry.result_summary, 200),
                    entry.success,
                    entry.duration_ms as i64,
                    entry.sandboxed,
                    entry.rate_limited,
                    entry.user_ip,
                ],
            )?;
        }

        let mut ring = self.ring.lock();
        if ring.len() == RING_BUFFER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);
        Ok(())
    }

    /// Fast in-memory view of the most recent entries, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let ring = self.ring.lock();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn count(&self) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM audit_entries", [], |r| r.get(0)).map_err(Into::into)
    }

    pub fn for_tool(&self, tool_name: &str, limit: i64) -> EngineResult<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, tool_name, args_hash, result_summary, success, duration_ms, sandboxed, rate_limited, user_ip
             FROM audit_entries WHERE tool_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![tool_name, limit], |row| {
                Ok(AuditEntry {
                    timestamp: row.get(0)?,
                    tool_name: row.get(1)?,
                    args_hash: row.get(2)?,
                    result_summary: row.get(3)?,
                    success: row.get(4)?,
                    duration_ms: row.get::<_, i64>(5)? as u64,
                    sandboxed: row.get(6)?,
                    rate_limited: row.get(7)?,
                    user_ip: row.get(8)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> AuditLog {
        AuditLog::open(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn sample_entry(tool: &str, success: bool) -> AuditEntry {
        AuditEntry {
            timestamp: "2026-01-01T00:00:00Z".into(),
            tool_name: tool.into(),
            args_hash: hash_args(&serde_json::json!({"a": 1})),
            result_summary: "ok".into(),
            success,
            duration_ms: 12,
            sandboxed: false,
            rate_limited: false,
            user_ip: None,
        }
    }

    #[test]
    fn hash_args_is_order_independent() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"y": 2, "x": 1});
        assert_eq!(hash_args(&a), hash_args(&b));
    }

    #[test]
    fn hash_args_is_16_hex_chars() {
        let h = hash_args(&serde_json::json!({"a": "b"}));
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn append_persists_and_mirrors_to_ring_buffer() {
        let log = log();
        log.append(sample_entry("echo", true)).unwrap();
        assert_eq!(log.count().unwrap(), 1);
        assert_eq!(log.recent(10).len(), 1);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let log = log();
        for i in 0..(RING_BUFFER_CAPACITY + 10) {
            log.append(sample_entry(&format!("tool{i}"), true)).unwrap();
        }
        assert_eq!(log.recent(RING_BUFFER_CAPACITY + 10).len(), RING_BUFFER_CAPACITY);
        assert_eq!(log.count().unwrap() as usize, RING_BUFFER_CAPACITY + 10);
    }

    #[test]
    fn for_tool_filters_by_name() {
        let log = log();
        log.append(sample_entry("echo", true)).unwrap();
        log.append(sample_entry("fetch", false)).unwrap();
        let echoes = log.for_tool("echo", 10).unwrap();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].tool_name, "echo");
    }
}
