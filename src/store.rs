//! Durable store
//!
//! Single SQLite database holding the three memory layers plus runtime
//! counters:
//!   Layer 3: raw conversation turns   (messages, with a processed flag)
//!   Layer 2: extracted memory items   (memory_items)
//!   Layer 1: core memory summary      (core_memory, single row)
//! plus rate-limit state, the heartbeat log and reasoning token usage.
//!
//! Writes are atomic per logical entity: the core summary swap and
//! memory-item merges run inside transactions, so readers observe
//! either the previous or the new value, never a partial one.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use crate::rate_limit::RateLimitState;

/// Layer-2 memory item category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryCategory {
    Preference,
    Fact,
    Event,
    Emotion,
    Goal,
    Habit,
    General,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Event => "event",
            Self::Emotion => "emotion",
            Self::Goal => "goal",
            Self::Habit => "habit",
            Self::General => "general",
        }
    }

    /// Unrecognized categories collapse to `General` rather than erroring;
    /// extraction output is advisory, not trusted.
    pub fn parse(s: &str) -> Self {
        match s {
            "preference" => Self::Preference,
            "fact" => Self::Fact,
            "event" => Self::Event,
            "emotion" => Self::Emotion,
            "goal" => Self::Goal,
            "habit" => Self::Habit,
            _ => Self::General,
        }
    }
}

/// Importance tier; merges keep the higher tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Importance {
    Normal = 0,
    High = 1,
}

impl Importance {
    pub fn from_i64(v: i64) -> Self {
        if v >= 1 {
            Self::High
        } else {
            Self::Normal
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "high" {
            Self::High
        } else {
            Self::Normal
        }
    }
}

/// Layer-2 memory item
#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub id: String,
    pub category: MemoryCategory,
    pub content: String,
    pub importance: Importance,
    pub created_at: i64,
    /// Range of message ids this item was extracted from
    pub source_from: Option<i64>,
    pub source_to: Option<i64>,
}

/// Raw conversation turn (Layer 3)
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

/// Latest heartbeat log entry (debug surface)
#[derive(Debug, Clone)]
pub struct HeartbeatEntry {
    pub state: String,
    pub action: String,
    pub detail: Option<String>,
    pub created_at: i64,
}

/// Reasoning token usage for a period
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub calls: i64,
}

/// SQLite-backed durable store
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;

        info!("Store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                processed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_user_time ON messages(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_processed ON messages(processed);

            CREATE TABLE IF NOT EXISTS memory_items (
                id TEXT PRIMARY KEY,
                category TEXT NOT NULL DEFAULT 'general',
                content TEXT NOT NULL,
                importance INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                source_from INTEGER,
                source_to INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_memory_category ON memory_items(category);

            CREATE TABLE IF NOT EXISTS core_memory (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                content TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rate_limit (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                count_today INTEGER NOT NULL,
                day_key TEXT NOT NULL,
                last_notify_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS heartbeat_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                purpose TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_usage_time ON usage(created_at);

            CREATE TABLE IF NOT EXISTS todos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );

            CREATE TABLE IF NOT EXISTS reminders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                remind_at INTEGER NOT NULL,
                fired INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    /// Stable id for a memory item: truncated hash of its content
    pub fn content_id(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    // ── Layer 3: conversation turns ──────────────────────────────────

    /// Append a conversation turn, returning its id
    pub fn log_message(&self, user_id: i64, role: &str, content: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO messages (user_id, role, content) VALUES (?1, ?2, ?3)",
            params![user_id, role, content],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Timestamp of the most recent user turn
    pub fn last_user_message_at(&self, user_id: i64) -> Result<Option<i64>> {
        let ts = self
            .conn
            .query_row(
                "SELECT MAX(created_at) FROM messages WHERE user_id = ?1 AND role = 'user'",
                params![user_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(ts)
    }

    /// Turns since `since_ts` (inclusive)
    pub fn message_count_since(&self, user_id: i64, since_ts: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND created_at >= ?2",
            params![user_id, since_ts],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Per-day message counts for the trailing `days` days, oldest first.
    /// Day boundaries use the supplied UTC offset (seconds). Days with no
    /// messages are filled in with zero so callers always get `days` rows.
    pub fn daily_message_counts(
        &self,
        user_id: i64,
        days: i64,
        offset_secs: i64,
        now_ts: i64,
    ) -> Result<Vec<(String, i64)>> {
        let since = now_ts - days * 86_400;
        let mut stmt = self.conn.prepare(
            "SELECT date(created_at + ?3, 'unixepoch') AS day, COUNT(*)
             FROM messages
             WHERE user_id = ?1 AND created_at >= ?2
             GROUP BY day",
        )?;
        let counted: std::collections::HashMap<String, i64> = stmt
            .query_map(params![user_id, since, offset_secs], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut out = Vec::with_capacity(days as usize);
        for i in (0..days).rev() {
            let day_ts = now_ts - i * 86_400 + offset_secs;
            let key = chrono::DateTime::from_timestamp(day_ts, 0)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let count = counted.get(&key).copied().unwrap_or(0);
            out.push((key, count));
        }
        Ok(out)
    }

    /// Count and latest timestamp of turns since `since_ts`
    pub fn recent_turn_stats(&self, user_id: i64, since_ts: i64) -> Result<(i64, Option<i64>)> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*), MAX(created_at) FROM messages
             WHERE user_id = ?1 AND created_at >= ?2",
            params![user_id, since_ts],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
        )?;
        Ok(stats)
    }

    /// Unprocessed turns in insertion order, up to `limit`
    pub fn unprocessed_turns(&self, user_id: i64, limit: usize) -> Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, role, content, created_at FROM messages
             WHERE user_id = ?1 AND processed = 0
             ORDER BY id ASC LIMIT ?2",
        )?;
        let turns = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(Turn {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    /// Advance the extraction watermark: everything up to and including
    /// `up_to_id` counts as processed.
    pub fn mark_processed(&self, user_id: i64, up_to_id: i64) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE messages SET processed = 1
             WHERE user_id = ?1 AND id <= ?2 AND processed = 0",
            params![user_id, up_to_id],
        )?;
        Ok(n)
    }

    /// Delete processed turns older than `cutoff_ts`. Their salient
    /// content has already been promoted to Layer 2 by extraction.
    pub fn compress_turns(&self, cutoff_ts: i64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM messages WHERE processed = 1 AND created_at < ?1",
            params![cutoff_ts],
        )?;
        if n > 0 {
            debug!("Compressed {} raw turns", n);
        }
        Ok(n)
    }

    // ── Layer 2: memory items ────────────────────────────────────────

    /// Insert a memory item; the id is a content hash so exact repeats
    /// collapse onto one row (the higher importance wins).
    pub fn save_memory_item(
        &self,
        category: MemoryCategory,
        content: &str,
        importance: Importance,
        source_range: Option<(i64, i64)>,
    ) -> Result<String> {
        let id = Self::content_id(content);
        let (from, to) = match source_range {
            Some((f, t)) => (Some(f), Some(t)),
            None => (None, None),
        };
        self.conn.execute(
            r#"
            INSERT INTO memory_items (id, category, content, importance, source_from, source_to)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                importance = MAX(importance, excluded.importance)
            "#,
            params![id, category.as_str(), content, importance as i64, from, to],
        )?;
        debug!("Saved memory item {} ({})", &id[..8], category.as_str());
        Ok(id)
    }

    /// All Layer-2 items, oldest first
    pub fn all_memory_items(&self) -> Result<Vec<MemoryItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, category, content, importance, created_at, source_from, source_to
             FROM memory_items ORDER BY created_at ASC",
        )?;
        let items = stmt
            .query_map([], |row| {
                Ok(MemoryItem {
                    id: row.get(0)?,
                    category: MemoryCategory::parse(&row.get::<_, String>(1)?),
                    content: row.get(2)?,
                    importance: Importance::from_i64(row.get(3)?),
                    created_at: row.get(4)?,
                    source_from: row.get(5)?,
                    source_to: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Replace a group of near-duplicates with one merged item, in a
    /// single transaction so no reader sees the group half-merged.
    pub fn merge_memory_items(&mut self, merged: &MemoryItem, replaces: &[String]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for id in replaces {
            tx.execute("DELETE FROM memory_items WHERE id = ?1", params![id])?;
        }
        tx.execute(
            r#"
            INSERT INTO memory_items (id, category, content, importance, created_at, source_from, source_to)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                importance = MAX(importance, excluded.importance),
                created_at = MIN(created_at, excluded.created_at)
            "#,
            params![
                merged.id,
                merged.category.as_str(),
                merged.content,
                merged.importance as i64,
                merged.created_at,
                merged.source_from,
                merged.source_to,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Layer 1: core memory summary ─────────────────────────────────

    /// Current core summary, if one has been built
    pub fn core_summary(&self) -> Result<Option<String>> {
        let content = self
            .conn
            .query_row("SELECT content FROM core_memory WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(content)
    }

    /// Atomically replace the core summary in full
    pub fn swap_core_summary(&mut self, content: &str, now_ts: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO core_memory (id, content, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at
            "#,
            params![content, now_ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Rate limit persistence ───────────────────────────────────────

    pub fn load_rate_limit(&self) -> Result<RateLimitState> {
        let state = self
            .conn
            .query_row(
                "SELECT count_today, day_key, last_notify_at FROM rate_limit WHERE id = 1",
                [],
                |row| {
                    Ok(RateLimitState {
                        count_today: row.get::<_, i64>(0)? as u32,
                        day_key: row.get(1)?,
                        last_notify_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn save_rate_limit(&self, state: &RateLimitState) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO rate_limit (id, count_today, day_key, last_notify_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                count_today = excluded.count_today,
                day_key = excluded.day_key,
                last_notify_at = excluded.last_notify_at
            "#,
            params![state.count_today as i64, state.day_key, state.last_notify_at],
        )?;
        Ok(())
    }

    // ── Heartbeat log + usage (debug surface) ────────────────────────

    pub fn log_heartbeat(&self, state: &str, action: &str, detail: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO heartbeat_log (state, action, detail) VALUES (?1, ?2, ?3)",
            params![state, action, detail],
        )?;
        Ok(())
    }

    pub fn last_heartbeat(&self) -> Result<Option<HeartbeatEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT state, action, detail, created_at FROM heartbeat_log
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(HeartbeatEntry {
                        state: row.get(0)?,
                        action: row.get(1)?,
                        detail: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Trim heartbeat log entries older than `cutoff_ts`
    pub fn trim_heartbeat_log(&self, cutoff_ts: i64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM heartbeat_log WHERE created_at < ?1",
            params![cutoff_ts],
        )?;
        Ok(n)
    }

    pub fn record_usage(
        &self,
        purpose: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO usage (purpose, prompt_tokens, completion_tokens) VALUES (?1, ?2, ?3)",
            params![purpose, prompt_tokens, completion_tokens],
        )?;
        Ok(())
    }

    pub fn usage_since(&self, since_ts: i64) -> Result<UsageSummary> {
        let summary = self.conn.query_row(
            "SELECT COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0),
                    COUNT(*)
             FROM usage WHERE created_at >= ?1",
            params![since_ts],
            |row| {
                Ok(UsageSummary {
                    prompt_tokens: row.get(0)?,
                    completion_tokens: row.get(1)?,
                    calls: row.get(2)?,
                })
            },
        )?;
        Ok(summary)
    }

    // ── Soft-context lookups (todos / reminders are owned elsewhere;
    //    the heartbeat only ever counts them) ─────────────────────────

    pub fn active_todo_count(&self, user_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM todos WHERE user_id = ?1 AND done = 0",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Reminders due within `window_secs` of `now_ts`
    pub fn upcoming_reminder_count(
        &self,
        user_id: i64,
        now_ts: i64,
        window_secs: i64,
    ) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM reminders
             WHERE user_id = ?1 AND fired = 0 AND remind_at BETWEEN ?2 AND ?3",
            params![user_id, now_ts, now_ts + window_secs],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn add_todo(&self, user_id: i64, content: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO todos (user_id, content) VALUES (?1, ?2)",
            params![user_id, content],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_reminder(&self, user_id: i64, message: &str, remind_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO reminders (user_id, message, remind_at) VALUES (?1, ?2, ?3)",
            params![user_id, message, remind_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}
