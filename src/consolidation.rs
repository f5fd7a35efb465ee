//! Memory consolidation pipeline
//!
//! Nightly four-stage run: extract memory items from unprocessed turns,
//! merge near-duplicate items, rebuild the core summary from scratch,
//! then compress old raw turns. Stages run strictly in order and a
//! stage failure aborts the rest of the run; the extraction watermark
//! only advances after items are durably saved, so a failed run is
//! simply retried from the same turns the next night.
//!
//! A run holds the shared cycle lock, so Think cycles and consolidation
//! never interleave.

use anyhow::{Context as _, Result};
use chrono::{DateTime, FixedOffset, TimeZone, Timelike};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::reasoning::Reasoning;
use crate::store::{Importance, MemoryCategory, MemoryItem, Store, Turn};

const EXTRACT_SYSTEM_PROMPT: &str = r#"You extract long-term memory items from a conversation transcript between an owner and their companion.

Reply with exactly one JSON array and nothing else. Each element:
  {"category": "preference|fact|event|emotion|goal|habit", "content": "<one self-contained statement about the owner>", "importance": "normal|high"}

Rules:
- Only durable information about the owner: preferences, facts, plans, recurring habits, strong feelings.
- Skip small talk, pleasantries and anything about the companion itself.
- An empty array is a valid answer."#;

const REBUILD_SYSTEM_PROMPT: &str = r#"You maintain the core memory of a personal companion. Given the full list of stored memory items, write a compact profile of the owner: who they are, what they care about, current goals and recent events. Plain prose, most important first. Stay well under 4000 characters."#;

/// Turns consumed per extraction run
const EXTRACT_BATCH: usize = 200;
const EXTRACT_MAX_TOKENS: u32 = 1024;
const REBUILD_MAX_TOKENS: u32 = 1024;

/// How often the nightly trigger re-checks the clock
const TRIGGER_POLL: Duration = Duration::from_secs(60);

/// One extracted item as the reasoning service reports it. Unknown
/// categories and importances collapse to defaults; the output is
/// advisory, not trusted.
#[derive(Debug, Deserialize)]
struct ExtractedItem {
    #[serde(default)]
    category: String,
    content: String,
    #[serde(default)]
    importance: String,
}

/// Counters across the daemon's lifetime (debug surface)
#[derive(Debug, Default)]
pub struct ConsolidationStats {
    pub runs: AtomicU64,
    pub items_extracted: AtomicU64,
    pub items_merged: AtomicU64,
    pub rebuilds: AtomicU64,
    pub turns_compressed: AtomicU64,
}

impl ConsolidationStats {
    pub fn summary(&self) -> String {
        format!(
            "runs={} extracted={} merged={} rebuilds={} compressed={}",
            self.runs.load(Ordering::Relaxed),
            self.items_extracted.load(Ordering::Relaxed),
            self.items_merged.load(Ordering::Relaxed),
            self.rebuilds.load(Ordering::Relaxed),
            self.turns_compressed.load(Ordering::Relaxed),
        )
    }
}

pub struct Consolidator {
    ctx: Arc<Context>,
    reasoning: Arc<dyn Reasoning>,
    stats: Arc<ConsolidationStats>,
    last_run_day: Option<String>,
}

impl Consolidator {
    pub fn new(ctx: Arc<Context>, reasoning: Arc<dyn Reasoning>) -> Self {
        Self {
            ctx,
            reasoning,
            stats: Arc::new(ConsolidationStats::default()),
            last_run_day: None,
        }
    }

    pub fn stats(&self) -> Arc<ConsolidationStats> {
        Arc::clone(&self.stats)
    }

    /// Background loop: fire once per local day when the consolidation
    /// hour arrives.
    pub async fn run_continuous(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Consolidator started: nightly at {:02}:00 local",
            self.ctx.config.consolidation_hour
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TRIGGER_POLL) => {
                    let now = self.ctx.now();
                    if self.due(now) {
                        self.last_run_day = Some(now.format("%Y-%m-%d").to_string());
                        if let Err(e) = self.run_once().await {
                            warn!("Consolidation run failed: {e:#}");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Consolidator shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn due(&self, now: DateTime<FixedOffset>) -> bool {
        if now.hour() != self.ctx.config.consolidation_hour {
            return false;
        }
        let day = now.format("%Y-%m-%d").to_string();
        self.last_run_day.as_deref() != Some(day.as_str())
    }

    /// One full pipeline run. Holds the cycle lock end to end.
    pub async fn run_once(&self) -> Result<()> {
        let lock = Arc::clone(&self.ctx.cycle_lock);
        let _guard = lock.lock().await;
        let started = std::time::Instant::now();

        let extracted = self.extract().await.context("extract stage")?;
        let merged = self.dedup().context("dedup stage")?;
        let rebuilt = self.rebuild().await.context("rebuild stage")?;
        let compressed = self.compress().context("compress stage")?;

        self.stats.runs.fetch_add(1, Ordering::Relaxed);
        info!(
            "Consolidation done in {:?}: extracted={} merged={} rebuilt={} compressed={}",
            started.elapsed(),
            extracted,
            merged,
            rebuilt,
            compressed,
        );

        let store = self.lock_store()?;
        store.log_heartbeat(
            "consolidation",
            "nightly_run",
            Some(&format!(
                "extracted={extracted} merged={merged} compressed={compressed}"
            )),
        )?;
        Ok(())
    }

    // ── Stage 1: extraction ──────────────────────────────────────────

    async fn extract(&self) -> Result<usize> {
        let turns = {
            let store = self.lock_store()?;
            store.unprocessed_turns(self.ctx.config.owner_id, EXTRACT_BATCH)?
        };
        if turns.is_empty() {
            debug!("No unprocessed turns, skipping extraction");
            return Ok(0);
        }

        let transcript = self.render_transcript(&turns);
        let reply = tokio::time::timeout(
            self.ctx.config.reasoning_timeout,
            self.reasoning
                .complete("extract", EXTRACT_SYSTEM_PROMPT, &transcript, EXTRACT_MAX_TOKENS),
        )
        .await
        .context("extraction timed out")??;

        let items = parse_extracted(&reply.content);
        let first_id = turns[0].id;
        let last_id = turns[turns.len() - 1].id;

        let saved = {
            let store = self.lock_store()?;
            store.record_usage("extract", reply.prompt_tokens, reply.completion_tokens)?;

            let mut saved = 0usize;
            for item in &items {
                if item.content.trim().is_empty() {
                    continue;
                }
                store.save_memory_item(
                    MemoryCategory::parse(&item.category),
                    item.content.trim(),
                    Importance::parse(&item.importance),
                    Some((first_id, last_id)),
                )?;
                saved += 1;
            }

            // Watermark moves only after the items are durably saved
            store.mark_processed(self.ctx.config.owner_id, last_id)?;
            saved
        };

        self.stats
            .items_extracted
            .fetch_add(saved as u64, Ordering::Relaxed);
        info!("Extracted {} memory items from {} turns", saved, turns.len());
        Ok(saved)
    }

    fn render_transcript(&self, turns: &[Turn]) -> String {
        let tz = self.ctx.config.tz();
        let mut out = String::new();
        for turn in turns {
            let when = tz
                .timestamp_opt(turn.created_at, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            out.push_str(&format!("[{}] {}: {}\n", when, turn.role, turn.content));
        }
        out
    }

    // ── Stage 2: dedup ───────────────────────────────────────────────

    /// Greedy pairwise merge across all categories. Two items whose
    /// word-set overlap coefficient meets the threshold collapse into
    /// one; the merged item keeps the higher importance and the oldest
    /// timestamp.
    fn dedup(&self) -> Result<usize> {
        let items = {
            let store = self.lock_store()?;
            store.all_memory_items()?
        };
        if items.len() < 2 {
            return Ok(0);
        }

        let word_sets: Vec<HashSet<String>> =
            items.iter().map(|i| word_set(&i.content)).collect();
        let threshold = self.ctx.config.dedup_similarity;

        let mut grouped = vec![false; items.len()];
        let mut merged_total = 0usize;

        for i in 0..items.len() {
            if grouped[i] {
                continue;
            }
            let mut group = vec![i];
            for j in (i + 1)..items.len() {
                if grouped[j] {
                    continue;
                }
                if overlap_coefficient(&word_sets[i], &word_sets[j]) >= threshold {
                    group.push(j);
                    grouped[j] = true;
                }
            }
            if group.len() < 2 {
                continue;
            }

            let merged = merge_group(&items, &group);
            let replaced: Vec<String> =
                group.iter().map(|&k| items[k].id.clone()).collect();
            debug!(
                "Merging {} near-duplicates into '{}'",
                replaced.len(),
                merged.content
            );

            let mut store = self.lock_store()?;
            store.merge_memory_items(&merged, &replaced)?;
            merged_total += group.len() - 1;
        }

        if merged_total > 0 {
            self.stats
                .items_merged
                .fetch_add(merged_total as u64, Ordering::Relaxed);
            info!("Dedup merged {} items", merged_total);
        }
        Ok(merged_total)
    }

    // ── Stage 3: core summary rebuild ────────────────────────────────

    async fn rebuild(&self) -> Result<bool> {
        let items = {
            let store = self.lock_store()?;
            store.all_memory_items()?
        };
        if items.is_empty() {
            debug!("No memory items, keeping existing core summary");
            return Ok(false);
        }

        let mut listing = String::new();
        for item in &items {
            let tier = match item.importance {
                Importance::High => "high",
                Importance::Normal => "normal",
            };
            listing.push_str(&format!(
                "- [{}/{}] {}\n",
                item.category.as_str(),
                tier,
                item.content
            ));
        }

        let reply = tokio::time::timeout(
            self.ctx.config.reasoning_timeout,
            self.reasoning
                .complete("rebuild", REBUILD_SYSTEM_PROMPT, &listing, REBUILD_MAX_TOKENS),
        )
        .await
        .context("rebuild timed out")??;

        let summary = truncate_chars(reply.content.trim(), self.ctx.config.core_summary_max_chars);

        let mut store = self.lock_store()?;
        store.record_usage("rebuild", reply.prompt_tokens, reply.completion_tokens)?;
        store.swap_core_summary(summary, self.ctx.now().timestamp())?;

        self.stats.rebuilds.fetch_add(1, Ordering::Relaxed);
        info!("Core summary rebuilt from {} items", items.len());
        Ok(true)
    }

    // ── Stage 4: compression ─────────────────────────────────────────

    fn compress(&self) -> Result<usize> {
        let cutoff =
            self.ctx.now().timestamp() - self.ctx.config.turn_retention_days * 86_400;
        let store = self.lock_store()?;
        let removed = store.compress_turns(cutoff)?;
        store.trim_heartbeat_log(cutoff)?;
        self.stats
            .turns_compressed
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.ctx
            .store
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))
    }
}

/// Salvage a JSON array from a chatty reply: everything from the first
/// `[` to the last `]`. Unparseable output yields no items rather than
/// failing the run.
fn parse_extracted(raw: &str) -> Vec<ExtractedItem> {
    let candidate = match (raw.find('['), raw.rfind(']')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => raw,
    };
    match serde_json::from_str::<Vec<ExtractedItem>>(candidate) {
        Ok(items) => items,
        Err(e) => {
            warn!("Extraction reply was not a JSON array, saving nothing: {}", e);
            Vec::new()
        }
    }
}

/// Lowercased alphanumeric word set
fn word_set(content: &str) -> HashSet<String> {
    content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// Overlap coefficient: |A ∩ B| / min(|A|, |B|). A statement that is a
/// strict elaboration of another scores 1.0 regardless of length.
fn overlap_coefficient(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / smaller as f64
}

/// Collapse a duplicate group into one item. The longest content is
/// the base; contents it does not already cover get appended.
fn merge_group(items: &[MemoryItem], group: &[usize]) -> MemoryItem {
    let base_idx = group
        .iter()
        .copied()
        .max_by_key(|&k| items[k].content.len())
        .unwrap_or(group[0]);

    let mut content = items[base_idx].content.clone();
    let mut covered = word_set(&content);
    let mut importance = items[base_idx].importance;
    let mut created_at = items[base_idx].created_at;
    let mut source_from = items[base_idx].source_from;
    let mut source_to = items[base_idx].source_to;

    for &k in group {
        let item = &items[k];
        importance = importance.max(item.importance);
        created_at = created_at.min(item.created_at);
        source_from = match (source_from, item.source_from) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        source_to = match (source_to, item.source_to) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        if k == base_idx {
            continue;
        }
        let words = word_set(&item.content);
        if !words.is_subset(&covered) {
            content.push_str("; ");
            content.push_str(&item.content);
            covered.extend(words);
        }
    }

    MemoryItem {
        id: Store::content_id(&content),
        category: items[base_idx].category,
        content,
        importance,
        created_at,
        source_from,
        source_to,
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::CompanionError;
    use crate::reasoning::ReasoningReply;
    use crate::sensors::SensorRegistry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct QueuedReasoning {
        replies: Mutex<VecDeque<Result<String, CompanionError>>>,
    }

    impl QueuedReasoning {
        fn with(replies: Vec<Result<String, CompanionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait]
    impl Reasoning for QueuedReasoning {
        async fn complete(
            &self,
            _purpose: &str,
            _system: &str,
            _user: &str,
            _max_tokens: u32,
        ) -> Result<ReasoningReply, CompanionError> {
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(r#"[]"#.to_string()));
            next.map(|content| ReasoningReply {
                content,
                prompt_tokens: 500,
                completion_tokens: 80,
            })
        }
    }

    fn ctx() -> Arc<Context> {
        Context::new(
            Config::for_tests(PathBuf::from(":memory:")),
            Store::open_in_memory().unwrap(),
            SensorRegistry::discover(vec![], &HashSet::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_overlap_coefficient() {
        let a = word_set("likes hiking");
        let b = word_set("likes hiking on weekends");
        let c = word_set("likes coffee");
        assert_eq!(overlap_coefficient(&a, &b), 1.0);
        assert_eq!(overlap_coefficient(&a, &c), 0.5);
        assert_eq!(overlap_coefficient(&a, &word_set("")), 0.0);
    }

    #[test]
    fn test_parse_extracted_salvages_chatty_reply() {
        let items = parse_extracted(
            "Here you go:\n[{\"category\": \"fact\", \"content\": \"owns a cat\"}]\nDone!",
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "owns a cat");
    }

    #[test]
    fn test_parse_extracted_garbage_yields_nothing() {
        assert!(parse_extracted("I could not find anything").is_empty());
    }

    #[tokio::test]
    async fn test_run_extracts_and_advances_watermark() {
        let ctx = ctx();
        {
            let store = ctx.store.lock().unwrap();
            store.log_message(1, "user", "went hiking today, it was great").unwrap();
            store.log_message(1, "assistant", "sounds lovely!").unwrap();
        }
        let reasoning = QueuedReasoning::with(vec![
            Ok(r#"[{"category": "preference", "content": "enjoys hiking", "importance": "normal"}]"#
                .to_string()),
            Ok("The owner enjoys hiking.".to_string()),
        ]);

        let consolidator = Consolidator::new(ctx.clone(), reasoning);
        consolidator.run_once().await.unwrap();

        let store = ctx.store.lock().unwrap();
        let items = store.all_memory_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "enjoys hiking");
        assert!(items[0].source_from.is_some());
        assert!(store.unprocessed_turns(1, 100).unwrap().is_empty());
        assert_eq!(
            store.core_summary().unwrap().as_deref(),
            Some("The owner enjoys hiking.")
        );
    }

    #[tokio::test]
    async fn test_extraction_failure_leaves_watermark() {
        let ctx = ctx();
        {
            let store = ctx.store.lock().unwrap();
            store.log_message(1, "user", "remember this").unwrap();
        }
        let reasoning = QueuedReasoning::with(vec![Err(
            CompanionError::ReasoningUnavailable("down for maintenance".into()),
        )]);

        let consolidator = Consolidator::new(ctx.clone(), reasoning);
        assert!(consolidator.run_once().await.is_err());

        // Same turns are still pending for the next run
        let store = ctx.store.lock().unwrap();
        assert_eq!(store.unprocessed_turns(1, 100).unwrap().len(), 1);
        assert!(store.all_memory_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dedup_merges_elaboration_across_categories() {
        let ctx = ctx();
        {
            let store = ctx.store.lock().unwrap();
            store
                .save_memory_item(MemoryCategory::Fact, "likes hiking", Importance::High, None)
                .unwrap();
            store
                .save_memory_item(
                    MemoryCategory::Preference,
                    "likes hiking on weekends",
                    Importance::Normal,
                    None,
                )
                .unwrap();
        }
        let reasoning = QueuedReasoning::with(vec![Ok("Summary.".to_string())]);

        let consolidator = Consolidator::new(ctx.clone(), reasoning);
        consolidator.run_once().await.unwrap();

        let store = ctx.store.lock().unwrap();
        let items = store.all_memory_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "likes hiking on weekends");
        // The higher importance from either side survives the merge
        assert_eq!(items[0].importance, Importance::High);
    }

    #[tokio::test]
    async fn test_dedup_keeps_distinct_items() {
        let ctx = ctx();
        {
            let store = ctx.store.lock().unwrap();
            store
                .save_memory_item(MemoryCategory::Fact, "likes hiking", Importance::Normal, None)
                .unwrap();
            store
                .save_memory_item(
                    MemoryCategory::Preference,
                    "likes coffee",
                    Importance::Normal,
                    None,
                )
                .unwrap();
        }
        let reasoning = QueuedReasoning::with(vec![Ok("Summary.".to_string())]);

        let consolidator = Consolidator::new(ctx.clone(), reasoning);
        consolidator.run_once().await.unwrap();

        let store = ctx.store.lock().unwrap();
        assert_eq!(store.all_memory_items().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_store_run_is_a_noop() {
        let ctx = ctx();
        // No turns, no items: no reasoning calls at all
        let reasoning = QueuedReasoning::with(vec![Err(CompanionError::ReasoningUnavailable(
            "should never be called".into(),
        ))]);

        let consolidator = Consolidator::new(ctx.clone(), reasoning);
        consolidator.run_once().await.unwrap();

        let store = ctx.store.lock().unwrap();
        assert!(store.core_summary().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_fires_once_per_day() {
        let ctx = ctx();
        let reasoning = QueuedReasoning::with(vec![]);
        let mut consolidator = Consolidator::new(ctx.clone(), reasoning);

        let at_hour = chrono::FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 8, 30, 3, 5, 0)
            .unwrap();
        assert!(consolidator.due(at_hour));

        consolidator.last_run_day = Some("2026-08-30".to_string());
        assert!(!consolidator.due(at_hour));

        let next_day = at_hour + chrono::Duration::days(1);
        assert!(consolidator.due(next_day));

        let wrong_hour = at_hour + chrono::Duration::hours(2);
        assert!(!consolidator.due(wrong_hour));
    }

    #[test]
    fn test_merge_group_appends_uncovered_content() {
        let mk = |content: &str| MemoryItem {
            id: Store::content_id(content),
            category: MemoryCategory::Fact,
            content: content.to_string(),
            importance: Importance::Normal,
            created_at: 100,
            source_from: Some(1),
            source_to: Some(2),
        };
        let items = vec![mk("enjoys long hikes"), mk("enjoys hikes with the dog")];
        let merged = merge_group(&items, &[0, 1]);
        assert!(merged.content.contains("enjoys hikes with the dog"));
        assert!(merged.content.contains("enjoys long hikes"));
    }
}
