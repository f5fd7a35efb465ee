//! Action executor
//!
//! Carries out exactly one decision per cycle. `Notify` goes through
//! the rate limiter and the awake window before touching the transport;
//! a blocked notify downgrades silently to a logged no-op. Delivery
//! failures are not retried within the cycle - if the triggering
//! condition persists, the next cycle produces the message again.

use anyhow::Result;
use chrono::Timelike;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::Context;
use crate::decision::Decision;
use crate::rate_limit::NotifyDenied;
use crate::store::{Importance, MemoryCategory};
use crate::transport::Transport;

/// What actually happened when a decision was executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// `Nothing`, or a notify suppressed by policy
    Noop,
    /// Notify delivered and counted
    Delivered,
    /// Notify suppressed: daily cap reached
    SuppressedCap,
    /// Notify suppressed: cooldown since last notification
    SuppressedCooldown,
    /// Notify suppressed: current hour outside the awake window
    SuppressedAsleep,
    /// Transport refused the message; no same-cycle retry
    DeliveryFailed,
    /// Memory item written to Layer 2
    MemorySaved,
}

pub struct ActionExecutor {
    ctx: Arc<Context>,
    transport: Arc<dyn Transport>,
}

impl ActionExecutor {
    pub fn new(ctx: Arc<Context>, transport: Arc<dyn Transport>) -> Self {
        Self { ctx, transport }
    }

    /// Execute one decision. `phase` labels the heartbeat log entry.
    pub async fn execute(&self, decision: &Decision, phase: &str) -> Result<ExecutionOutcome> {
        match decision {
            Decision::Nothing => {
                self.log(phase, "nothing", None)?;
                Ok(ExecutionOutcome::Noop)
            }
            Decision::Notify { content } => self.execute_notify(content, phase).await,
            Decision::SaveMemory { content } => self.execute_save_memory(content, phase),
        }
    }

    async fn execute_notify(&self, content: &str, phase: &str) -> Result<ExecutionOutcome> {
        let now = self.ctx.now();

        // Invariant: a notify never goes out off-hours, no matter what
        // the reasoning service returned
        if !self.ctx.config.in_awake_window(now.hour()) {
            info!("Notify suppressed: hour {} outside awake window", now.hour());
            self.log(phase, "suppressed_notify", Some("outside awake window"))?;
            return Ok(ExecutionOutcome::SuppressedAsleep);
        }

        // Check the limiter without holding its lock across the send
        let denied = {
            let mut rate = self
                .ctx
                .rate_limit
                .lock()
                .map_err(|e| anyhow::anyhow!("rate limit lock poisoned: {e}"))?;
            rate.check(
                now,
                self.ctx.config.max_daily_notifications,
                self.ctx.config.notify_cooldown,
            )
            .err()
        };

        match denied {
            Some(NotifyDenied::DailyCapReached { cap }) => {
                info!("Notify suppressed: daily cap {} reached", cap);
                self.log(phase, "suppressed_notify", Some("daily cap reached"))?;
                Ok(ExecutionOutcome::SuppressedCap)
            }
            Some(NotifyDenied::CooldownActive { remaining_secs }) => {
                info!("Notify suppressed: cooldown, {}s remaining", remaining_secs);
                self.log(phase, "suppressed_notify", Some("cooldown active"))?;
                Ok(ExecutionOutcome::SuppressedCooldown)
            }
            None => match self.transport.send(content).await {
                Ok(()) => {
                    let state = {
                        let mut rate = self
                            .ctx
                            .rate_limit
                            .lock()
                            .map_err(|e| anyhow::anyhow!("rate limit lock poisoned: {e}"))?;
                        rate.record_notify(now);
                        rate.clone()
                    };

                    let store = self
                        .ctx
                        .store
                        .lock()
                        .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
                    store.save_rate_limit(&state)?;
                    store.log_message(self.ctx.config.owner_id, "assistant", content)?;
                    store.log_heartbeat(phase, "notify", Some(truncate(content, 100)))?;

                    info!(
                        "Proactive message sent ({}/{} today)",
                        state.count_today, self.ctx.config.max_daily_notifications
                    );
                    Ok(ExecutionOutcome::Delivered)
                }
                Err(e) => {
                    warn!("Delivery failed, will not retry this cycle: {}", e);
                    self.log(phase, "delivery_failed", Some(&e.to_string()))?;
                    Ok(ExecutionOutcome::DeliveryFailed)
                }
            },
        }
    }

    /// An immediate, high-confidence observation goes straight to Layer
    /// 2, bypassing extraction and its dedup pass.
    fn execute_save_memory(&self, content: &str, phase: &str) -> Result<ExecutionOutcome> {
        let store = self
            .ctx
            .store
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
        store.save_memory_item(MemoryCategory::General, content, Importance::Normal, None)?;
        store.log_heartbeat(phase, "save_memory", Some(truncate(content, 100)))?;
        Ok(ExecutionOutcome::MemorySaved)
    }

    fn log(&self, phase: &str, action: &str, detail: Option<&str>) -> Result<()> {
        let store = self
            .ctx
            .store
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {e}"))?;
        store.log_heartbeat(phase, action, detail)?;
        Ok(())
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
