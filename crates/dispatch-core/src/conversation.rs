// Dispatch core — Conversation Store.
//
// SQLite-backed message log with an FTS5 search index, modeled directly on
// the engine_config / messages schema pattern: a single-writer connection
// guarded by a mutex, serial transactions for `append`, parallel reads.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::types::{ContextStats, Message, MessageContent, Role};
use crate::util::estimate_tokens;

pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

pub struct SearchHit {
    pub message: StoredMessage,
    pub snippet: String,
}

pub struct ConversationStore {
    conn: Mutex<Connection>,
}

const DEFAULT_SNIPPET_CONTEXT_CHARS: usize = 40;

impl ConversationStore {
    pub fn open(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS conv_messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                seq INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_conv_messages_conv
                ON conv_messages(conversation_id, seq);

            CREATE VIRTUAL TABLE IF NOT EXISTS conv_messages_fts USING fts5(
                id UNINDEXED,
                conversation_id UNINDEXED,
                content,
                content_rowid=rowid
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Atomic, monotonic append: `seq` is assigned under the same lock that
    /// inserts the row, so two concurrent appends to the same conversation
    /// are fully serialized and never reorder.
    pub fn append(&self, conversation_id: &str, role: Role, content: &str) -> EngineResult<String> {
        let conn = self.conn.lock();
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT OR IGNORE INTO conversations (id) VALUES (?1)",
            params![conversation_id],
        )?;

        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM conv_messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO conv_messages (id, conversation_id, role, content, seq) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, conversation_id, role.as_str(), content, next_seq],
        )?;
        conn.execute(
            "INSERT INTO conv_messages_fts (id, conversation_id, content) VALUES (?1, ?2, ?3)",
            params![id, conversation_id, content],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = datetime('now') WHERE id = ?1",
            params![conversation_id],
        )?;

        Ok(id)
    }

    pub fn messages(&self, conversation_id: &str, limit: i64, offset: i64) -> EngineResult<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM conv_messages WHERE conversation_id = ?1
             ORDER BY seq ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![conversation_id, limit, offset], |row| {
                let role_str: String = row.get(2)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: role_str.parse().unwrap_or(Role::User),
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// FTS search, case-insensitive (SQLite FTS5 default tokenizer folds
    /// ASCII case). Never surfaces a message from a soft-deleted
    /// conversation — the join against `conversations` excludes those.
    pub fn search(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<SearchHit>> {
        let conn = self.conn.lock();
        let sql = "SELECT m.id, m.conversation_id, m.role, m.content, m.created_at
             FROM conv_messages_fts f
             JOIN conv_messages m ON m.id = f.id
             JOIN conversations c ON c.id = m.conversation_id AND c.deleted_at IS NULL
             WHERE f.conv_messages_fts MATCH ?1
               AND (?2 IS NULL OR m.conversation_id = ?2)
             ORDER BY m.seq ASC LIMIT ?3 OFFSET ?4";
        let mut stmt = conn.prepare(sql)?;
        let hits: Vec<StoredMessage> = stmt
            .query_map(params![query, conversation_id, limit, offset], |row| {
                let role_str: String = row.get(2)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: role_str.parse().unwrap_or(Role::User),
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(hits
            .into_iter()
            .map(|m| {
                let snippet = make_snippet(&m.content, query, DEFAULT_SNIPPET_CONTEXT_CHARS);
                SearchHit { message: m, snippet }
            })
            .collect())
    }

    /// Deterministic given inputs, the current message set, and `summarize`:
    /// walks the stored order newest-first accumulating an estimated-token
    /// budget, then reverses. Anything older than the verbatim prefix is
    /// handed to the caller-supplied `summarize` closure and the result is
    /// folded into one synthesized summary message prepended to the output.
    ///
    /// The store has no opinion on how a summary is produced — the
    /// Dispatcher supplies a small/cheap model call or a deterministic
    /// extractive summarizer, whichever it's configured to use.
    pub fn build_context(
        &self,
        conversation_id: &str,
        token_budget: usize,
        summarize: &dyn Fn(&[&StoredMessage]) -> String,
    ) -> EngineResult<(Vec<Message>, ContextStats)> {
        let all = self.messages(conversation_id, i64::MAX, 0)?;
        let total_messages = all.len();

        let mut verbatim: Vec<&StoredMessage> = Vec::new();
        let mut used = 0usize;
        for m in all.iter().rev() {
            let cost = estimate_tokens(&m.content);
            if used + cost > token_budget && !verbatim.is_empty() {
                break;
            }
            used += cost;
            verbatim.push(m);
        }
        verbatim.reverse();

        let verbatim_count = verbatim.len();
        let summarized_count = total_messages - verbatim_count;

        let mut out = Vec::with_capacity(verbatim_count + 1);
        if summarized_count > 0 {
            let omitted: Vec<&StoredMessage> = all[..summarized_count].iter().collect();
            out.push(Message::system(summarize(&omitted)));
        }
        for m in verbatim {
            out.push(Message {
                role: m.role,
                content: MessageContent::Text(m.content.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            });
        }

        Ok((
            out,
            ContextStats { summarized_count, verbatim_count, total_messages },
        ))
    }

    pub fn count(&self, conversation_id: &str) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM conv_messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    pub fn delete(&self, conversation_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET deleted_at = datetime('now') WHERE id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    pub fn rename(&self, conversation_id: &str, title: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET title = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![conversation_id, title],
        )?;
        Ok(())
    }

    pub fn list_conversations(&self) -> EngineResult<Vec<(String, Option<String>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title FROM conversations WHERE deleted_at IS NULL ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

/// Deterministic extractive fallback summarizer: counts omitted messages
/// rather than calling out to a model. Callers with a cheap model available
/// typically pass their own closure instead.
pub fn default_summarizer(messages: &[&StoredMessage]) -> String {
    format!(
        "[earlier conversation summary: {} message(s) omitted to fit the context budget]",
        messages.len()
    )
}

fn make_snippet(content: &str, query: &str, context_chars: usize) -> String {
    let lower_content = content.to_lowercase();
    let lower_query = query.to_lowercase();
    let Some(byte_pos) = lower_content.find(&lower_query) else {
        return crate::util::truncate_utf8(content, context_chars * 2).to_string();
    };

    let match_char_idx = lower_content[..byte_pos].chars().count();
    let chars: Vec<char> = content.chars().collect();
    let start = match_char_idx.saturating_sub(context_chars);
    let end = (match_char_idx + lower_query.chars().count() + context_chars).min(chars.len());
    chars[start..end].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::open(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn append_is_monotonic_and_never_reorders() {
        let s = store();
        s.append("c1", Role::User, "first").unwrap();
        s.append("c1", Role::Assistant, "second").unwrap();
        s.append("c1", Role::User, "third").unwrap();
        let msgs = s.messages("c1", 10, 0).unwrap();
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn search_finds_case_insensitively_with_snippet() {
        let s = store();
        s.append("c1", Role::User, "the quick brown fox jumps").unwrap();
        let hits = s.search("BROWN", None, 10, 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.to_lowercase().contains("brown"));
    }

    #[test]
    fn search_excludes_deleted_conversation() {
        let s = store();
        s.append("c1", Role::User, "secret squirrel").unwrap();
        s.delete("c1").unwrap();
        let hits = s.search("squirrel", None, 10, 0).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn build_context_keeps_recent_prefix_under_budget() {
        let s = store();
        for i in 0..20 {
            s.append("c1", Role::User, &format!("message number {i} with some padding text")).unwrap();
        }
        let (ctx, stats) = s.build_context("c1", 40, &default_summarizer).unwrap();
        assert_eq!(stats.total_messages, 20);
        assert!(stats.verbatim_count < 20);
        assert_eq!(stats.summarized_count + stats.verbatim_count, 20);
        // A synthesized summary message should be first when anything was omitted.
        assert_eq!(ctx.len(), stats.verbatim_count + 1);
        assert_eq!(ctx[0].role, Role::System);
    }

    #[test]
    fn build_context_is_deterministic() {
        let s = store();
        for i in 0..10 {
            s.append("c1", Role::User, &format!("msg {i}")).unwrap();
        }
        let (a, stats_a) = s.build_context("c1", 50, &default_summarizer).unwrap();
        let (b, stats_b) = s.build_context("c1", 50, &default_summarizer).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(stats_a.verbatim_count, stats_b.verbatim_count);
    }

    #[test]
    fn build_context_uses_caller_supplied_summarizer() {
        let s = store();
        for i in 0..20 {
            s.append("c1", Role::User, &format!("message number {i} with some padding text")).unwrap();
        }
        let custom = |omitted: &[&StoredMessage]| format!("CUSTOM:{}", omitted.len());
        let (ctx, stats) = s.build_context("c1", 40, &custom).unwrap();
        assert!(stats.summarized_count > 0);
        assert_eq!(ctx[0].content.as_text(), format!("CUSTOM:{}", stats.summarized_count));
    }

    #[test]
    fn count_delete_rename_and_list() {
        let s = store();
        s.append("c1", Role::User, "hi").unwrap();
        s.append("c2", Role::User, "hey").unwrap();
        assert_eq!(s.count("c1").unwrap(), 1);
        s.rename("c1", "My Chat").unwrap();
        let list = s.list_conversations().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|(id, title)| id == "c1" && title.as_deref() == Some("My Chat")));
        s.delete("c2").unwrap();
        let list = s.list_conversations().unwrap();
        assert_eq!(list.len(), 1);
    }
}
