//! Heartbeat scheduler
//!
//! The Observe -> Think -> Act loop. Each tick builds a fresh snapshot;
//! the Think step only fires when something salient changed since the
//! previous snapshot or the fallback ceiling elapsed, so reasoning
//! calls are bounded by "something changed", never a fixed cadence.
//! Outside the awake window ticks log and skip collection entirely,
//! unless fresh owner activity forces a wake: a forced-wake cycle
//! observes and may think, but the executor still suppresses any
//! notify until the window opens. The forced phase lapses on the next
//! quiet tick.
//!
//! A cycle holds the shared cycle lock end to end, so it can never
//! interleave with a consolidation run.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Timelike};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::decision::{parse_decision, Decision};
use crate::executor::{ActionExecutor, ExecutionOutcome};
use crate::reasoning::Reasoning;
use crate::snapshot::{ObservationSnapshot, SalientFields, SnapshotBuilder};
use crate::store::UsageSummary;
use crate::transport::Transport;

const THINK_SYSTEM_PROMPT: &str = r#"You are the proactive side of a personal companion. You receive a JSON observation of the owner's current context plus your long-term memory summary. Decide whether to reach out right now.

Reply with exactly one JSON object and nothing else:
  {"type": "notify", "content": "<short, warm message>"}
  {"type": "save_memory", "content": "<one factual observation worth remembering>"}
  {"type": "nothing"}

Rules:
- Silence is usually fine. Only notify when the observation clearly warrants it (an upcoming reminder, a worrying quiet streak, a pending todo nudge).
- If several things warrant attention, combine them into one message.
- Respect the notification counts in the observation; do not be clingy."#;

const THINK_MAX_TOKENS: u32 = 512;

/// Awake/sleep phase of the heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Awake,
    Sleeping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Awake => "awake",
            Phase::Sleeping => "sleeping",
        }
    }
}

/// What the last completed cycle did (debug surface)
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub at: DateTime<FixedOffset>,
    pub decision: Decision,
    /// Whether the reasoning service was actually consulted
    pub invoked_reasoning: bool,
    pub outcome: ExecutionOutcome,
}

/// Outward debug answer: last cycle plus current-period usage
#[derive(Debug, Clone)]
pub struct DebugStatus {
    pub phase: &'static str,
    pub last_cycle: Option<CycleReport>,
    pub usage_today: UsageSummary,
    pub notifications_today: u32,
}

pub struct Heartbeat {
    ctx: Arc<Context>,
    builder: SnapshotBuilder,
    reasoning: Arc<dyn Reasoning>,
    executor: ActionExecutor,
    phase: Phase,
    last_salient: Option<SalientFields>,
    last_think_at: Option<DateTime<FixedOffset>>,
    last_cycle: Arc<StdMutex<Option<CycleReport>>>,
}

impl Heartbeat {
    pub fn new(
        ctx: Arc<Context>,
        reasoning: Arc<dyn Reasoning>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let builder = SnapshotBuilder::new(ctx.config.clone(), Arc::clone(&ctx.store));
        let executor = ActionExecutor::new(Arc::clone(&ctx), transport);
        let phase = if ctx.config.in_awake_window(ctx.now().hour()) {
            Phase::Awake
        } else {
            Phase::Sleeping
        };
        Self {
            ctx,
            builder,
            reasoning,
            executor,
            phase,
            last_salient: None,
            last_think_at: None,
            last_cycle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Wake early, off-schedule. The next cycle observes and may
    /// think; notifies stay suppressed until the awake window opens.
    /// Lapses once `update_phase` runs on a tick without fresh owner
    /// activity.
    pub fn force_wake(&mut self) {
        if self.phase == Phase::Sleeping {
            info!("Forced wake: owner activity during sleeping hours");
            self.phase = Phase::Awake;
        }
    }

    /// Shared handle to the last cycle report for the debug surface
    pub fn cycle_handle(&self) -> Arc<StdMutex<Option<CycleReport>>> {
        Arc::clone(&self.last_cycle)
    }

    pub fn debug_status(&self) -> Result<DebugStatus> {
        let now = self.ctx.now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| naive.and_local_timezone(self.ctx.config.tz()).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(now.timestamp() - 86_400);

        let usage_today = {
            let store = self
                .ctx
                .store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
            store.usage_since(midnight)?
        };

        Ok(DebugStatus {
            phase: self.phase.as_str(),
            last_cycle: self.last_cycle.lock().ok().and_then(|c| c.clone()),
            usage_today,
            notifications_today: self.ctx.rate_limit_snapshot().count_today,
        })
    }

    /// Main loop. A tick in flight always completes before shutdown is
    /// observed, so shared state is never left mid-write.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Heartbeat started: interval={:?}, awake={}-{}",
            self.ctx.config.heartbeat_interval,
            self.ctx.config.awake_hour_start,
            self.ctx.config.awake_hour_end,
        );

        let mut ticker = tokio::time::interval(self.ctx.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick so the first cycle waits a
        // full interval after startup
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Heartbeat cycle error: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full Observe -> Think -> Act cycle
    pub async fn tick(&mut self) -> Result<()> {
        let now = self.ctx.now();
        self.update_phase(now.hour());

        if self.phase == Phase::Sleeping {
            if self.owner_active_since_last_tick(now)? {
                self.force_wake();
            } else {
                let store = self
                    .ctx
                    .store
                    .lock()
                    .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
                store.log_heartbeat(self.phase.as_str(), "sleeping", None)?;
                return Ok(());
            }
        }

        let lock = Arc::clone(&self.ctx.cycle_lock);
        let _guard = lock.lock().await;

        let snapshot = self
            .builder
            .collect_all(&self.ctx.registry, &self.ctx.rate_limit_snapshot())
            .await?;
        let salient = snapshot.salient();

        let (decision, invoked) = if !self.should_think(now, &salient) {
            debug!("No salient delta, observe only");
            self.log_action("observe_only", None)?;
            (Decision::Nothing, false)
        } else {
            self.last_think_at = Some(now);
            (self.think(&snapshot).await?, true)
        };

        self.last_salient = Some(salient);

        let outcome = self.executor.execute(&decision, self.phase.as_str()).await?;
        if let Ok(mut last) = self.last_cycle.lock() {
            *last = Some(CycleReport {
                at: now,
                decision,
                invoked_reasoning: invoked,
                outcome,
            });
        }
        Ok(())
    }

    /// Whether the owner sent a message within the last heartbeat
    /// interval. Activity during sleeping hours wakes the companion.
    fn owner_active_since_last_tick(&self, now: DateTime<FixedOffset>) -> Result<bool> {
        let last = {
            let store = self
                .ctx
                .store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
            store.last_user_message_at(self.ctx.config.owner_id)?
        };
        let window = self.ctx.config.heartbeat_interval.as_secs() as i64;
        Ok(last.is_some_and(|ts| now.timestamp() - ts <= window))
    }

    /// Delta detection: think on first run, on any salient change, or
    /// once the fallback ceiling elapses.
    fn should_think(&self, now: DateTime<FixedOffset>, salient: &SalientFields) -> bool {
        let last_think = match self.last_think_at {
            None => return true,
            Some(t) => t,
        };

        let elapsed = (now - last_think)
            .to_std()
            .unwrap_or_default();
        if elapsed >= self.ctx.config.think_fallback {
            return true;
        }

        match &self.last_salient {
            None => true,
            Some(prev) => prev != salient,
        }
    }

    /// Consult the reasoning service. Every failure mode degrades to
    /// `Nothing`; the owner never sees an internal fault.
    async fn think(&self, snapshot: &ObservationSnapshot) -> Result<Decision> {
        let core_memory = {
            let store = self
                .ctx
                .store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
            store.core_summary()?
        };

        let payload = serde_json::json!({
            "observation": snapshot,
            "core_memory": core_memory,
        });
        let user = serde_json::to_string_pretty(&payload)?;

        let reply = match tokio::time::timeout(
            self.ctx.config.reasoning_timeout,
            self.reasoning
                .complete("think", THINK_SYSTEM_PROMPT, &user, THINK_MAX_TOKENS),
        )
        .await
        {
            Err(_) => {
                warn!("Think timed out, defaulting to nothing");
                self.log_action("think_timeout", None)?;
                return Ok(Decision::Nothing);
            }
            Ok(Err(e)) => {
                warn!("Think failed, defaulting to nothing: {}", e);
                self.log_action("think_failed", Some(&e.to_string()))?;
                return Ok(Decision::Nothing);
            }
            Ok(Ok(reply)) => reply,
        };

        {
            let store = self
                .ctx
                .store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
            store.record_usage("think", reply.prompt_tokens, reply.completion_tokens)?;
        }

        match parse_decision(&reply.content) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!("Think protocol violation, defaulting to nothing: {}", e);
                self.log_action("protocol_violation", Some(&e.to_string()))?;
                Ok(Decision::Nothing)
            }
        }
    }

    fn update_phase(&mut self, hour: u32) {
        let next = if self.ctx.config.in_awake_window(hour) {
            Phase::Awake
        } else {
            Phase::Sleeping
        };
        if next != self.phase {
            info!("Phase transition: {} -> {}", self.phase.as_str(), next.as_str());
            self.phase = next;
        }
    }

    fn log_action(&self, action: &str, detail: Option<&str>) -> Result<()> {
        let store = self
            .ctx
            .store
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
        store.log_heartbeat(self.phase.as_str(), action, detail)?;
        Ok(())
    }
}
