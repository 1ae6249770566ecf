//! Periodic sweep of deadline-expired running tasks.
//!
//! Agents that never report back (network loss, container death,
//! firewall) would leave their tasks running forever; the janitor fills
//! every missing `(agent, method)` cell with a synthetic failure row and
//! closes the task. The agent snapshot is taken at deadline, not at
//! intake: an agent added mid-window that stayed silent gets a synthetic
//! row, a revoked one does not.

use crate::constants::{JANITOR_PERIOD_SECS, SYNTHETIC_FAILURE_MESSAGE};
use crate::models::{NewResult, ProbeMethod, TaskStatus};
use crate::store::Store;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Janitor {
    store: Store,
    period: Duration,
}

impl Janitor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            period: Duration::from_secs(JANITOR_PERIOD_SECS),
        }
    }

    #[cfg(test)]
    fn with_period(store: Store, period: Duration) -> Self {
        Self { store, period }
    }

    /// Sweep loop; runs until the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("janitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        warn!("janitor sweep failed: {}", err);
                    }
                }
            }
        }
    }

    /// One pass over every expired running task. Returns how many tasks
    /// were closed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.list_expired_running(now).await;
        let mut closed = 0usize;
        for task in expired {
            let results = self.store.list_results_by_task(task.id).await;
            let existing: HashSet<(String, ProbeMethod)> = results
                .iter()
                .map(|r| (r.agent_id.clone(), r.method))
                .collect();

            let agents = self.store.list_active_agents().await;
            let mut synthesized = 0usize;
            for agent in &agents {
                for method in &task.methods {
                    if existing.contains(&(agent.name.clone(), *method)) {
                        continue;
                    }
                    let (_, novel) = self
                        .store
                        .insert_result(NewResult {
                            task_id: task.id,
                            agent_id: agent.name.clone(),
                            region: agent.region.clone(),
                            method: *method,
                            success: false,
                            latency_ms: 0,
                            status_code: 0,
                            message: SYNTHETIC_FAILURE_MESSAGE.to_string(),
                            checked_at: now,
                            details: None,
                        })
                        .await?;
                    if novel {
                        self.store.increment_received(task.id).await?;
                    }
                    synthesized += 1;
                }
            }

            self.store
                .update_task_status(task.id, TaskStatus::Finished)
                .await?;
            closed += 1;
            info!(
                "janitor closed task {} ({} synthetic results)",
                task.id, synthesized
            );
        }
        Ok(closed)
    }
}
