//! Durable store for tasks, results and agents.
//!
//! A single `RwLock` guards all three tables, so every public operation is
//! atomic at the row level and `increment_received` is linearizable per
//! task id. Multi-row flows (intake, janitor sweeps) compose separate
//! atomic calls rather than transactions.

use crate::models::{AgentRecord, CheckResult, CheckTask, NewResult, ProbeMethod, TaskStatus};
use crate::{ProbeMeshError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct StoreInner {
    agents: HashMap<Uuid, AgentRecord>,
    tasks: HashMap<Uuid, CheckTask>,
    // Results keyed by task id, kept in arrival order.
    results: HashMap<Uuid, Vec<CheckResult>>,
}

impl StoreInner {
    fn distinct_tasks_for_agent(&self, name: &str) -> i64 {
        let mut seen: HashSet<Uuid> = HashSet::new();
        for rows in self.results.values() {
            for row in rows {
                if row.agent_id == name {
                    seen.insert(row.task_id);
                }
            }
        }
        seen.len() as i64
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
        }
    }

    // --- tasks ---

    /// Inserts a task as `queued`, assigning id and timestamps.
    pub async fn insert_task(
        &self,
        target: &str,
        methods: Vec<ProbeMethod>,
        expected_results: u32,
        deadline: DateTime<Utc>,
    ) -> CheckTask {
        let now = Utc::now();
        let task = CheckTask {
            id: Uuid::new_v4(),
            target: target.to_string(),
            methods,
            status: TaskStatus::Queued,
            expected_results,
            received_results: 0,
            deadline,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write().await;
        inner.tasks.insert(task.id, task.clone());
        debug!("inserted task {} target={}", task.id, task.target);
        task
    }

    pub async fn get_task(&self, id: Uuid) -> Result<CheckTask> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| ProbeMeshError::NotFound(format!("task {id}")))
    }

    /// Tasks still `running` whose deadline has passed, oldest first.
    pub async fn list_expired_running(&self, now: DateTime<Utc>) -> Vec<CheckTask> {
        let inner = self.inner.read().await;
        let mut out: Vec<CheckTask> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.deadline < now)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Writes a task status, enforcing terminal stickiness: once a task is
    /// `finished` or `failed` its status never changes again. Returns the
    /// effective status after the call.
    pub async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<TaskStatus> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| ProbeMeshError::NotFound(format!("task {id}")))?;
        if task.status.is_terminal() {
            debug!(
                "task {} already {:?}; ignoring transition to {:?}",
                id, task.status, status
            );
            return Ok(task.status);
        }
        task.status = status;
        task.updated_at = Utc::now();
        Ok(task.status)
    }

    /// Atomically advances the received counter and returns the new
    /// `(expected, received)` pair.
    pub async fn increment_received(&self, id: Uuid) -> Result<(u32, u32)> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| ProbeMeshError::NotFound(format!("task {id}")))?;
        task.received_results += 1;
        task.updated_at = Utc::now();
        Ok((task.expected_results, task.received_results))
    }

    // --- results ---

    /// Appends a result row. The store keeps duplicate `(task, agent,
    /// method)` rows; the returned flag reports whether the cell was novel
    /// so callers can decide what counts toward completion.
    pub async fn insert_result(&self, new: NewResult) -> Result<(CheckResult, bool)> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&new.task_id) {
            return Err(ProbeMeshError::NotFound(format!("task {}", new.task_id)));
        }
        let rows = inner.results.entry(new.task_id).or_default();
        let novel = !rows
            .iter()
            .any(|r| r.agent_id == new.agent_id && r.method == new.method);
        let result = CheckResult {
            id: Uuid::new_v4(),
            task_id: new.task_id,
            agent_id: new.agent_id,
            region: new.region,
            method: new.method,
            success: new.success,
            latency_ms: new.latency_ms,
            status_code: new.status_code,
            message: new.message,
            checked_at: new.checked_at,
            created_at: Utc::now(),
            details: new.details,
        };
        rows.push(result.clone());
        Ok((result, novel))
    }

    /// Result rows for a task in arrival order.
    pub async fn list_results_by_task(&self, task_id: Uuid) -> Vec<CheckResult> {
        let inner = self.inner.read().await;
        inner.results.get(&task_id).cloned().unwrap_or_default()
    }

    // --- agents ---

    /// Inserts a new agent row. Multiple rows may share a name (a revoked
    /// predecessor and its replacement after token rotation).
    pub async fn create_agent(&self, name: &str, region: &str, token: &str) -> AgentRecord {
        let agent = AgentRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: region.to_string(),
            ip: None,
            token: token.to_string(),
            revoked: false,
            tasks_completed: 0,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        inner.agents.insert(agent.id, agent.clone());
        agent
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<AgentRecord> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| ProbeMeshError::NotFound(format!("agent {id}")))
    }

    /// Non-revoked agents, newest first, with `tasks_completed` derived
    /// from the result rows carrying the agent's name.
    pub async fn list_active_agents(&self) -> Vec<AgentRecord> {
        let inner = self.inner.read().await;
        let mut out: Vec<AgentRecord> = inner
            .agents
            .values()
            .filter(|a| !a.revoked)
            .cloned()
            .collect();
        for agent in &mut out {
            agent.tasks_completed = inner.distinct_tasks_for_agent(&agent.name);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub async fn count_active_agents(&self) -> usize {
        let inner = self.inner.read().await;
        inner.agents.values().filter(|a| !a.revoked).count()
    }

    pub async fn revoke_agent(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let agent = inner
            .agents
            .get_mut(&id)
            .ok_or_else(|| ProbeMeshError::NotFound(format!("agent {id}")))?;
        agent.revoked = true;
        Ok(())
    }

    /// Touches `last_heartbeat` and `ip` for the non-revoked agent whose
    /// token matches the identifier. When `match_name` is set the agent's
    /// name is accepted as well (legacy affordance).
    pub async fn update_heartbeat(
        &self,
        identifier: &str,
        ip: Option<String>,
        match_name: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let agent = inner.agents.values_mut().find(|a| {
            !a.revoked && (a.token == identifier || (match_name && a.name == identifier))
        });
        match agent {
            Some(agent) => {
                agent.last_heartbeat = Some(Utc::now());
                if ip.is_some() {
                    agent.ip = ip;
                }
                Ok(())
            }
            None => Err(ProbeMeshError::NotFound(
                "agent not found or revoked".to_string(),
            )),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
