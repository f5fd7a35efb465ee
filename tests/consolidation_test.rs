//! Nightly consolidation pipeline tests against a real on-disk store.

use async_trait::async_trait;
use companiond::store::{Importance, MemoryCategory};
use companiond::{
    CompanionError, Config, Consolidator, Context, Reasoning, ReasoningReply, SensorRegistry,
    Store,
};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

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
            .unwrap_or_else(|| Ok("[]".to_string()));
        next.map(|content| ReasoningReply {
            content,
            prompt_tokens: 800,
            completion_tokens: 120,
        })
    }
}

fn ctx_at(db_path: &Path) -> Arc<Context> {
    Context::new(
        Config::for_tests(db_path.to_path_buf()),
        Store::open(db_path).unwrap(),
        SensorRegistry::discover(vec![], &HashSet::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn full_pipeline_promotes_turns_to_core_memory() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("companion.db");
    let ctx = ctx_at(&db_path);
    {
        let store = ctx.store.lock().unwrap();
        store
            .log_message(1, "user", "started a new job at the botanical garden")
            .unwrap();
        store.log_message(1, "assistant", "congratulations!").unwrap();
        store
            .log_message(1, "user", "I water the orchids every morning now")
            .unwrap();
    }

    let reasoning = QueuedReasoning::with(vec![
        Ok(concat!(
            r#"[{"category": "event", "content": "started a new job at the botanical garden", "importance": "high"},"#,
            r#" {"category": "habit", "content": "waters the orchids every morning", "importance": "normal"}]"#
        )
        .to_string()),
        Ok("Works at the botanical garden; waters orchids every morning.".to_string()),
    ]);
    let consolidator = Consolidator::new(ctx.clone(), reasoning);
    consolidator.run_once().await.unwrap();

    // Survives a restart: check through a fresh connection
    let store = Store::open(&db_path).unwrap();
    let items = store.all_memory_items().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().any(|i| i.importance == Importance::High));
    assert!(store.unprocessed_turns(1, 100).unwrap().is_empty());
    assert_eq!(
        store.core_summary().unwrap().unwrap(),
        "Works at the botanical garden; waters orchids every morning."
    );
}

#[tokio::test]
async fn failed_extraction_is_retried_from_the_same_turns() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_at(&dir.path().join("companion.db"));
    {
        let store = ctx.store.lock().unwrap();
        store.log_message(1, "user", "my sister visits next week").unwrap();
    }

    let down = QueuedReasoning::with(vec![Err(CompanionError::ReasoningUnavailable(
        "timeout".into(),
    ))]);
    let consolidator = Consolidator::new(ctx.clone(), down);
    assert!(consolidator.run_once().await.is_err());
    assert_eq!(
        ctx.store.lock().unwrap().unprocessed_turns(1, 100).unwrap().len(),
        1
    );

    // Next night the same turns are still pending and succeed
    let up = QueuedReasoning::with(vec![
        Ok(r#"[{"category": "event", "content": "sister visits next week"}]"#.to_string()),
        Ok("Sister visiting next week.".to_string()),
    ]);
    let consolidator = Consolidator::new(ctx.clone(), up);
    consolidator.run_once().await.unwrap();

    let store = ctx.store.lock().unwrap();
    assert_eq!(store.all_memory_items().unwrap().len(), 1);
    assert!(store.unprocessed_turns(1, 100).unwrap().is_empty());
}

#[tokio::test]
async fn near_duplicates_collapse_during_the_nightly_run() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_at(&dir.path().join("companion.db"));
    {
        let store = ctx.store.lock().unwrap();
        store
            .save_memory_item(MemoryCategory::Fact, "likes hiking", Importance::Normal, None)
            .unwrap();
        store
            .save_memory_item(
                MemoryCategory::Preference,
                "likes hiking on weekends",
                Importance::Normal,
                None,
            )
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
    let contents: Vec<String> = store
        .all_memory_items()
        .unwrap()
        .into_iter()
        .map(|i| i.content)
        .collect();
    assert_eq!(contents.len(), 2);
    assert!(contents.contains(&"likes hiking on weekends".to_string()));
    assert!(contents.contains(&"likes coffee".to_string()));
}

#[tokio::test]
async fn consolidation_waits_for_an_in_flight_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_at(&dir.path().join("companion.db"));
    let reasoning = QueuedReasoning::with(vec![]);
    let consolidator = Consolidator::new(ctx.clone(), reasoning);

    // Simulate a Think cycle in flight
    let guard = ctx.cycle_lock.clone().lock_owned().await;

    let blocked =
        tokio::time::timeout(Duration::from_millis(100), consolidator.run_once()).await;
    assert!(blocked.is_err(), "run should block while a cycle holds the lock");

    drop(guard);
    tokio::time::timeout(Duration::from_secs(5), consolidator.run_once())
        .await
        .expect("run should proceed once the cycle ends")
        .unwrap();
}

#[tokio::test]
async fn stats_track_pipeline_work() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_at(&dir.path().join("companion.db"));
    {
        let store = ctx.store.lock().unwrap();
        store.log_message(1, "user", "adopted a cat named miso").unwrap();
    }

    let reasoning = QueuedReasoning::with(vec![
        Ok(r#"[{"category": "fact", "content": "has a cat named miso"}]"#.to_string()),
        Ok("Has a cat named miso.".to_string()),
    ]);
    let consolidator = Consolidator::new(ctx, reasoning);
    let stats = consolidator.stats();
    consolidator.run_once().await.unwrap();

    let summary = stats.summary();
    assert!(summary.contains("runs=1"), "got: {summary}");
    assert!(summary.contains("extracted=1"), "got: {summary}");
    assert!(summary.contains("rebuilds=1"), "got: {summary}");
}
