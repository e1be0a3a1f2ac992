// Dispatch core — Settings Store.
//
// Typed key/value storage backed by SQLite. Keys whose name looks like an
// API-key-shaped secret (`*_api_key`, `*_secret`, `*_token`, `*_password`)
// are encrypted on write and decrypted on read. Model-name changes are
// validated against a fixed allow-list.

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::crypto::{self, MasterKey};
use crate::error::{EngineError, EngineResult};

const SECRET_KEY_SUFFIXES: &[&str] = &["_api_key", "_secret", "_token", "_password"];

/// Models an adapter is permitted to report/accept, validated against a
/// fixed allow-list rather than accepted as free-form text.
pub const ALLOWED_MODELS: &[&str] = &[
    "claude-3-5-sonnet-latest",
    "claude-3-5-haiku-latest",
    "gpt-4o",
    "gpt-4o-mini",
    "llama3.1",
    "llama3.2",
];

pub struct SettingsStore {
    conn: Mutex<Connection>,
    master_key: MasterKey,
}

fn is_secret_key(key: &str) -> bool {
    SECRET_KEY_SUFFIXES.iter().any(|suf| key.ends_with(suf))
}

impl SettingsStore {
    pub fn open(conn: Connection, master_key: MasterKey) -> EngineResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn), master_key })
    }

    pub fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        if key == "default_model" && !ALLOWED_MODELS.contains(&value) {
            return Err(EngineError::Config(format!("model '{value}' is not on the allow-list")));
        }

        let stored = if is_secret_key(key) {
            crypto::encrypt(value, &self.master_key)?
        } else {
            value.to_string()
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, stored],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let raw = {
            let conn = self.conn.lock();
            let result = conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            );
            match result {
                Ok(v) => Some(v),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };
        match raw {
            Some(v) if is_secret_key(key) => Ok(Some(crypto::decrypt(&v, &self.master_key)?)),
            other => Ok(other),
        }
    }

    pub fn delete(&self, key: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Fetch a setting that will be handed to a Backend Adapter (e.g. an
    /// API key). An adapter must never receive an encrypted envelope — that
    /// is a fatal `auth` error for that adapter, so this function refuses
    /// to hand one out at all.
    pub fn get_for_adapter(&self, key: &str) -> EngineResult<Option<String>> {
        let value = self.get(key)?;
        if let Some(v) = &value {
            if crypto::is_encrypted(v) {
                return Err(EngineError::Config(format!(
                    "setting '{key}' decrypted to an encrypted envelope — refusing to hand to adapter"
                )));
            }
        }
        Ok(value)
    }

    /// Startup verification: every secret must decrypt to a non-empty
    /// value.
    pub fn verify_secrets(&self) -> EngineResult<()> {
        let keys: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT key FROM settings")?;
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect()
        };
        for key in keys {
            if is_secret_key(&key) {
                let value = self.get(&key)?.unwrap_or_default();
                if value.is_empty() {
                    return Err(EngineError::Config(format!(
                        "secret '{key}' decrypted to an empty value"
                    )));
                }
            }
        }
        Ok(())
    }
}
