// Dispatch core — User-Profile Aggregator.
//
// Six fixed sections, SQLite-backed (mirrors the schema shape of every
// other store in this crate — single-writer connection, serial writes).
// Each entry carries `{value, source, confidence, is_manual_override}`;
// the overwrite rule never lets extraction clobber a manual override.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

pub const PROFILE_SECTIONS: &[&str] =
    &["personal_info", "work", "preferences", "schedule_patterns", "interests", "communication_style"];

/// The five fact types that map to a section on extraction. `interests` has
/// no extraction source — it is reachable only via manual `update_section`
/// calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Personal,
    WorkContext,
    Preference,
    Temporal,
    BehavioralPattern,
}

impl FactType {
    pub fn section(self) -> &'static str {
        match self {
            FactType::Personal => "personal_info",
            FactType::WorkContext => "work",
            FactType::Preference => "preferences",
            FactType::Temporal => "schedule_patterns",
            FactType::BehavioralPattern => "communication_style",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub value: String,
    pub source: String,
    pub confidence: f64,
    pub is_manual_override: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileSnapshot {
    pub version: String,
    pub sections: HashMap<String, HashMap<String, ProfileEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Merge,
    Replace,
}

pub struct ProfileAggregator {
    conn: Mutex<Connection>,
}

fn validate_section(section: &str) -> EngineResult<()> {
    if PROFILE_SECTIONS.contains(&section) {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "invalid section '{section}', expected one of {PROFILE_SECTIONS:?}"
        )))
    }
}

impl ProfileAggregator {
    pub fn open(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profile_entries (
                section TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                source TEXT NOT NULL,
                confidence REAL NOT NULL,
                is_manual_override INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (section, key)
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Applies a freshly extracted fact. Silently ignored (not an error) if
    /// the incoming confidence doesn't beat the existing entry, or if the
    /// existing entry is a manual override, which always wins.
    pub fn record_fact(&self, fact_type: FactType, key: &str, value: &str, source_message_id: &str, confidence: f64) -> EngineResult<bool> {
        let section = fact_type.section();
        self.upsert_if_wins(section, key, value, source_message_id, confidence, false)
    }

    /// Manual update via the user-facing profile editor: always wins,
    /// always marked `is_manual_override`.
    pub fn update_section(&self, section: &str, data: &HashMap<String, String>) -> EngineResult<Vec<String>> {
        validate_section(section)?;
        let mut updated = Vec::new();
        for (key, value) in data {
            self.upsert_if_wins(section, key, value, "manual", 1.0, true)?;
            updated.push(key.clone());
        }
        Ok(updated)
    }

    fn upsert_if_wins(
        &self,
        section: &str,
        key: &str,
        value: &str,
        source: &str,
        confidence: f64,
        manual: bool,
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let existing: Option<(f64, bool)> = conn
            .query_row(
                "SELECT confidence, is_manual_override FROM profile_entries WHERE section = ?1 AND key = ?2",
                params![section, key],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, bool>(1)?)),
            )
            .ok();

        let wins = match existing {
            None => true,
            Some((_, true)) => manual, // only another manual write may replace a manual override
            Some((existing_confidence, false)) => manual || confidence > existing_confidence,
        };

        if !wins {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO profile_entries (section, key, value, source, confidence, is_manual_override, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(section, key) DO UPDATE SET
                value = ?3, source = ?4, confidence = ?5, is_manual_override = ?6, updated_at = datetime('now')",
            params![section, key, value, source, confidence, manual],
        )?;
        Ok(true)
    }

    pub fn get_section(&self, section: &str) -> EngineResult<HashMap<String, ProfileEntry>> {
        validate_section(section)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value, source, confidence, is_manual_override, updated_at
             FROM profile_entries WHERE section = ?1",
        )?;
        let rows = stmt
            .query_map(params![section], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ProfileEntry {
                        value: row.get(1)?,
                        source: row.get(2)?,
                        confidence: row.get(3)?,
                        is_manual_override: row.get(4)?,
                        updated_at: row.get(5)?,
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn get_profile(&self) -> EngineResult<HashMap<String, HashMap<String, ProfileEntry>>> {
        let mut out = HashMap::new();
        for section in PROFILE_SECTIONS {
            out.insert(section.to_string(), self.get_section(section)?);
        }
        Ok(out)
    }

    pub fn delete_entry(&self, section: &str, key: &str) -> EngineResult<bool> {
        validate_section(section)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM profile_entries WHERE section = ?1 AND key = ?2",
            params![section, key],
        )?;
        Ok(changed > 0)
    }

    /// Compact markdown block the Dispatcher prepends to the system prompt
    /// when non-empty. Sections with no entries are omitted entirely rather
    /// than emitted as an empty header.
    pub fn summary(&self) -> EngineResult<String> {
        let profile = self.get_profile()?;
        let mut parts = Vec::new();
        for section in PROFILE_SECTIONS {
            let entries = &profile[*section];
            if entries.is_empty() {
                continue;
            }
            let mut lines: Vec<String> = entries.iter().map(|(k, e)| format!("- {k}: {}", e.value)).collect();
            lines.sort();
            parts.push(format!("**{}**\n{}", section.replace('_', " "), lines.join("\n")));
        }
        if parts.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("## User profile\n\n{}", parts.join("\n\n")))
    }

    pub fn export(&self) -> EngineResult<ProfileSnapshot> {
        Ok(ProfileSnapshot { version: "1.0".to_string(), sections: self.get_profile()? })
    }

    /// `merge` keeps existing entries not present in the snapshot and lets
    /// the snapshot's entries apply via the normal overwrite rule (so a
    /// manual override in the live store still beats a non-manual entry
    /// coming in). `replace` first clears the store.
    pub fn import(&self, snapshot: &ProfileSnapshot, mode: ImportMode) -> EngineResult<()> {
        if mode == ImportMode::Replace {
            self.conn.lock().execute("DELETE FROM profile_entries", [])?;
        }
        for (section, entries) in &snapshot.sections {
            validate_section(section)?;
            for (key, entry) in entries {
                self.upsert_if_wins(section, key, &entry.value, &entry.source, entry.confidence, entry.is_manual_override)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> ProfileAggregator {
        ProfileAggregator::open(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn empty_profile_has_all_six_sections() {
        let agg = aggregator();
        let profile = agg.get_profile().unwrap();
        assert_eq!(profile.len(), 6);
        for section in PROFILE_SECTIONS {
            assert!(profile[*section].is_empty());
        }
    }

    #[test]
    fn manual_update_is_marked_override() {
        let agg = aggregator();
        agg.update_section("personal_info", &HashMap::from([("name".to_string(), "Alice".to_string())])).unwrap();
        let section = agg.get_section("personal_info").unwrap();
        assert_eq!(section["name"].value, "Alice");
        assert!(section["name"].is_manual_override);
    }

    #[test]
    fn invalid_section_is_rejected() {
        let agg = aggregator();
        assert!(agg.get_section("not_a_section").is_err());
        assert!(agg.update_section("not_a_section", &HashMap::new()).is_err());
    }

    #[test]
    fn fact_type_maps_to_documented_section() {
        assert_eq!(FactType::Personal.section(), "personal_info");
        assert_eq!(FactType::WorkContext.section(), "work");
        assert_eq!(FactType::Preference.section(), "preferences");
        assert_eq!(FactType::Temporal.section(), "schedule_patterns");
        assert_eq!(FactType::BehavioralPattern.section(), "communication_style");
    }

    #[test]
    fn higher_confidence_extraction_wins() {
        let agg = aggregator();
        agg.record_fact(FactType::Preference, "theme", "light", "m1", 0.4).unwrap();
        agg.record_fact(FactType::Preference, "theme", "dark", "m2", 0.9).unwrap();
        let section = agg.get_section("preferences").unwrap();
        assert_eq!(section["theme"].value, "dark");
    }

    #[test]
    fn lower_confidence_extraction_does_not_overwrite() {
        let agg = aggregator();
        agg.record_fact(FactType::Preference, "theme", "dark", "m1", 0.9).unwrap();
        let applied = agg.record_fact(FactType::Preference, "theme", "light", "m2", 0.4).unwrap();
        assert!(!applied);
        let section = agg.get_section("preferences").unwrap();
        assert_eq!(section["theme"].value, "dark");
    }

    #[test]
    fn manual_override_is_never_overwritten_by_extraction() {
        let agg = aggregator();
        agg.update_section("preferences", &HashMap::from([("theme".to_string(), "dark".to_string())])).unwrap();
        let applied = agg.record_fact(FactType::Preference, "theme", "light", "m1", 0.99).unwrap();
        assert!(!applied);
        let section = agg.get_section("preferences").unwrap();
        assert_eq!(section["theme"].value, "dark");
        assert!(section["theme"].is_manual_override);
    }

    #[test]
    fn delete_entry_removes_it() {
        let agg = aggregator();
        agg.update_section("preferences", &HashMap::from([("theme".to_string(), "dark".to_string())])).unwrap();
        assert!(agg.delete_entry("preferences", "theme").unwrap());
        assert!(!agg.get_section("preferences").unwrap().contains_key("theme"));
        assert!(!agg.delete_entry("preferences", "theme").unwrap());
    }

    #[test]
    fn summary_omits_empty_sections_and_includes_populated_ones() {
        let agg = aggregator();
        assert_eq!(agg.summary().unwrap(), "");
        agg.update_section("personal_info", &HashMap::from([("name".to_string(), "Alice".to_string())])).unwrap();
        let summary = agg.summary().unwrap();
        assert!(summary.contains("personal info"));
        assert!(summary.contains("Alice"));
        assert!(!summary.contains("work"));
    }

    #[test]
    fn export_import_round_trips_with_merge() {
        let agg = aggregator();
        agg.update_section("personal_info", &HashMap::from([("name".to_string(), "Alice".to_string())])).unwrap();
        let snapshot = agg.export().unwrap();

        let agg2 = aggregator();
        agg2.update_section("work", &HashMap::from([("company".to_string(), "Acme".to_string())])).unwrap();
        agg2.import(&snapshot, ImportMode::Merge).unwrap();

        assert_eq!(agg2.get_section("personal_info").unwrap()["name"].value, "Alice");
        assert_eq!(agg2.get_section("work").unwrap()["company"].value, "Acme");
    }

    #[test]
    fn import_replace_clears_existing_entries_first() {
        let agg = aggregator();
        agg.update_section("work", &HashMap::from([("company".to_string(), "Acme".to_string())])).unwrap();
        let empty_snapshot = ProfileSnapshot { version: "1.0".into(), sections: HashMap::new() };
        agg.import(&empty_snapshot, ImportMode::Replace).unwrap();
        assert!(agg.get_section("work").unwrap().is_empty());
    }
}
