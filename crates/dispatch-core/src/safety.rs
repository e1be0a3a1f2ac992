// Dispatch core — Safety Layer.
//
// A pure-function module: no hidden state beyond the compiled regex
// patterns below. Every function here takes its full context as arguments
// and returns a plain value — callers (the Tool Runner) own all state,
// including the permission audit log.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::types::PermissionLevel;

// ── Allowed roots per permission level ──────────────────────────────────

/// The filesystem roots a file-path tool may operate under at a given
/// permission level, each level a superset of the one below it: `SANDBOX`
/// gets only the ephemeral temp directory, `LOCAL` adds the user's home
/// directory, `SYSTEM` adds the process's working directory, and `FULL`
/// drops containment entirely.
pub fn allowed_roots_for(level: PermissionLevel) -> Vec<PathBuf> {
    let mut roots = vec![std::env::temp_dir()];
    if level >= PermissionLevel::Local {
        if let Some(home) = dirs::home_dir() {
            roots.push(home);
        }
    }
    if level >= PermissionLevel::System {
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd);
        }
    }
    if level >= PermissionLevel::Full {
        roots.push(PathBuf::from("/"));
    }
    roots
}

// ── Shell sanitization ──────────────────────────────────────────────────

const SHELL_METACHARACTERS: &[char] =
    &[';', '&', '|', '`', '$', '<', '>', '(', ')', '[', ']', '{', '}', '*', '?', '~'];

fn destructive_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"rm\s+-rf\s+/(\s|$)",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;",  // fork bomb
            r"\bmkfs(\.\w+)?\b",
            r"\bdd\s+if=/dev/zero\b",
            r"\bdd\s+.*of=/dev/(sd|nvme|hd|disk)\w*",
            r"\bchmod\s+777\s+/\s*$",
            r"\bchown\s+root\s+/\s*$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static destructive pattern compiles"))
        .collect()
    })
}

/// Rejects on shell metacharacters or a fixed destructive-pattern match.
/// Returns the (unmodified) command and whether it is safe to run.
pub fn sanitize_shell(cmd: &str) -> (String, bool) {
    if cmd.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
        return (cmd.to_string(), false);
    }
    let lower = cmd.to_lowercase();
    if destructive_patterns().iter().any(|re| re.is_match(&lower)) {
        return (cmd.to_string(), false);
    }
    (cmd.to_string(), true)
}

// ── Path validation ─────────────────────────────────────────────────────

const SENSITIVE_NAME_BLOCKLIST: &[&str] =
    &[".env", "secrets", "credentials", "private_key", "id_rsa", ".ssh", "password"];

/// Resolves `p`, verifies containment under one of `allowed_roots`, and
/// rejects sensitive-name matches. `p` need not exist: non-existent paths
/// are resolved lexically via their existing parent.
pub fn validate_path(p: &Path, allowed_roots: &[PathBuf]) -> (PathBuf, bool, Option<String>) {
    let resolved = match resolve_lexically(p) {
        Ok(r) => r,
        Err(e) => return (p.to_path_buf(), false, Some(e)),
    };

    let lower = resolved.to_string_lossy().to_lowercase();
    for needle in SENSITIVE_NAME_BLOCKLIST {
        if lower.contains(needle) {
            return (resolved, false, Some(format!("path matches sensitive-name blocklist entry '{needle}'")));
        }
    }

    let contained = allowed_roots.iter().any(|root| {
        let root = resolve_lexically(root).unwrap_or_else(|_| root.clone());
        resolved.starts_with(&root)
    });
    if !contained {
        return (resolved, false, Some("path escapes all allowed roots".to_string()));
    }

    (resolved, true, None)
}

/// Resolve symlinks where possible; for a path whose final component does
/// not yet exist, canonicalize the existing parent and re-append the tail
/// so "containment" checks still work for not-yet-created files.
fn resolve_lexically(p: &Path) -> Result<PathBuf, String> {
    if let Ok(canon) = p.canonicalize() {
        return Ok(canon);
    }
    let Some(parent) = p.parent() else {
        return Ok(p.to_path_buf());
    };
    let Some(file_name) = p.file_name() else {
        return Ok(p.to_path_buf());
    };
    match parent.canonicalize() {
        Ok(canon_parent) => Ok(canon_parent.join(file_name)),
        Err(_) => Ok(p.to_path_buf()),
    }
}

// ── URL validation (SSRF guard) ─────────────────────────────────────────

const LOCALHOST_NAMES: &[&str] = &["localhost", "localhost.localdomain", "ip6-localhost", "ip6-loopback"];

/// Scheme must be http/https; hostname must not be a localhost alias; an
/// IPv4-literal host must not fall in 127/8, 10/8, 172.16/12, 192.168/16, or
/// 169.254/16.
pub fn validate_url(u: &str) -> (bool, Option<String>) {
    let Ok(parsed) = url::Url::parse(u) else {
        return (false, Some("not a valid URL".to_string()));
    };

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return (false, Some(format!("scheme '{}' is not http/https", parsed.scheme())));
    }

    let Some(host) = parsed.host_str() else {
        return (false, Some("URL has no host".to_string()));
    };

    if LOCALHOST_NAMES.contains(&host.to_lowercase().as_str()) {
        return (false, Some("host resolves to localhost".to_string()));
    }

    if let Ok(IpAddr::V4(v4)) = host.parse::<IpAddr>() {
        if is_blocked_ipv4(v4) {
            return (false, Some(format!("host {v4} is in a private/loopback/link-local range")));
        }
    }
    if let Ok(IpAddr::V6(v6)) = host.parse::<IpAddr>() {
        if v6.is_loopback() || v6.is_unique_local() {
            return (false, Some(format!("host {v6} is loopback or unique-local")));
        }
    }

    (true, None)
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() // 127/8
        || ip.octets()[0] == 10 // 10/8
        || (ip.octets()[0] == 172 && (16..=31).contains(&ip.octets()[1])) // 172.16/12
        || (ip.octets()[0] == 192 && ip.octets()[1] == 168) // 192.168/16
        || ip.is_link_local() // 169.254/16
}

// ── Prompt-injection detection ──────────────────────────────────────────

fn injection_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
            r"(?i)disregard\s+(all\s+)?(previous|prior|above)\s+(instructions|prompts?)",
            r"(?i)you\s+are\s+now\s+in\s+developer\s+mode",
            r"(?i)system\s*:\s*override",
            r"(?i)new\s+instructions\s*:",
            r"<\|?(system|im_start|im_end)\|?>",
            r"(?i)forget\s+everything\s+(you\s+were\s+told|above)",
            r"(?i)act\s+as\s+(if\s+you\s+(are|were)|a)\s+(unrestricted|jailbroken|dan)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static injection pattern compiles"))
        .collect()
    })
}

/// Replaces each matched pattern with `[REDACTED]`, returning the sanitized
/// text and the list of matched pattern snippets (for the `[SECURITY
/// WARNING]` note the Tool Runner prepends).
pub fn detect_injection(text: &str) -> (String, Vec<String>) {
    let mut sanitized = text.to_string();
    let mut matched = Vec::new();
    for re in injection_patterns() {
        if let Some(m) = re.find(&sanitized.clone()) {
            matched.push(m.as_str().to_string());
        }
        sanitized = re.replace_all(&sanitized, "[REDACTED]").into_owned();
    }
    (sanitized, matched)
}

// ── Permission audit log ────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PermissionChange {
    pub old_level: PermissionLevel,
    pub new_level: PermissionLevel,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: String,
}

/// Append-only, queryable-by-filter log of permission-level changes.
/// In-memory here; the embedding binary may mirror entries to durable
/// storage the same way `audit::AuditLog` does for tool invocations.
#[derive(Default)]
pub struct PermissionAuditLog {
    entries: parking_lot::Mutex<Vec<PermissionChange>>,
}

impl PermissionAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, change: PermissionChange) {
        self.entries.lock().push(change);
    }

    pub fn query(&self, source: Option<&str>) -> Vec<PermissionChange> {
        let entries = self.entries.lock();
        match source {
            Some(s) => entries.iter().filter(|e| e.source == s).cloned().collect(),
            None => entries.clone(),
        }
    }
}
