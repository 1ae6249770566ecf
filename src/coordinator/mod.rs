//! Task coordinator: intake, fan-out, result ingress and progress.
//!
//! All task state lives in the durable store; the coordinator composes
//! store, bus and hub calls and owns the status decisions. Transitions
//! into a terminal status are sticky at the store level, so concurrent
//! closures (two results racing, or the janitor racing a late result) are
//! harmless.

use crate::bus::JobBus;
use crate::config::TaskPolicy;
use crate::hub::EventHub;
use crate::models::{
    normalize_methods, CheckResult, CheckTask, Event, NewResult, TaskJob, TaskStatus,
};
use crate::store::Store;
use crate::{ProbeMeshError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// A result payload as posted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSubmission {
    pub task_id: Uuid,
    pub agent_id: String,
    pub region: String,
    pub method: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default)]
    pub status_code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub checked_at: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// A task joined with its results in arrival order.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    #[serde(flatten)]
    pub task: CheckTask,
    pub results: Vec<CheckResult>,
}

#[derive(Clone)]
pub struct TaskCoordinator {
    store: Store,
    bus: JobBus,
    hub: EventHub,
    policy: TaskPolicy,
}

impl TaskCoordinator {
    pub fn new(store: Store, bus: JobBus, hub: EventHub, policy: TaskPolicy) -> Self {
        Self {
            store,
            bus,
            hub,
            policy,
        }
    }

    /// Intake: validates and normalizes the request, inserts the task,
    /// fans one job out to every active agent's queue and moves the task
    /// to `running`.
    ///
    /// The expected count is fixed at the intake snapshot: active agents
    /// times normalized methods, with the configured floor standing in
    /// when no agent is active.
    pub async fn submit(&self, target: &str, methods: &[String]) -> Result<CheckTask> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ProbeMeshError::BadRequest("target is required".to_string()));
        }
        let methods = normalize_methods(methods);
        if methods.is_empty() {
            return Err(ProbeMeshError::BadRequest("no valid methods".to_string()));
        }

        let active = self.store.list_active_agents().await;
        let agent_count = if active.is_empty() {
            self.policy.agents_floor
        } else {
            active.len()
        };
        let expected = (agent_count * methods.len()) as u32;
        let deadline = Utc::now() + Duration::seconds(self.policy.task_ttl_seconds as i64);

        let task = self
            .store
            .insert_task(target, methods.clone(), expected, deadline)
            .await;

        let keys: Vec<String> = active.iter().map(|a| a.name.clone()).collect();
        let job = TaskJob {
            task_id: task.id,
            target: task.target.clone(),
            methods,
            requested_at: Utc::now(),
        };
        if let Err(err) = self.bus.fan_out(&keys, &job).await {
            warn!("fan-out for task {} failed: {}", task.id, err);
            self.store
                .update_task_status(task.id, TaskStatus::Failed)
                .await?;
            return Err(err);
        }

        self.store
            .update_task_status(task.id, TaskStatus::Running)
            .await?;
        info!(
            "task {} fanned out to {} agents, expecting {} results",
            task.id,
            keys.len(),
            expected
        );
        self.store.get_task(task.id).await
    }

    /// Result ingress. The row is always persisted and broadcast, late
    /// and duplicate posts included, but only a novel `(task, agent,
    /// method)` cell advances the received counter and can close the
    /// task.
    pub async fn ingest_result(&self, submission: ResultSubmission) -> Result<CheckResult> {
        let method = submission
            .method
            .parse()
            .map_err(ProbeMeshError::BadRequest)?;
        let checked_at = parse_checked_at(submission.checked_at.as_deref());

        let (result, novel) = self
            .store
            .insert_result(NewResult {
                task_id: submission.task_id,
                agent_id: submission.agent_id,
                region: submission.region,
                method,
                success: submission.success,
                latency_ms: submission.latency_ms,
                status_code: submission.status_code,
                message: submission.message,
                checked_at,
                details: submission.details,
            })
            .await?;

        if novel {
            self.settle(submission.task_id).await?;
        }

        self.hub
            .broadcast(Event::Result {
                task_id: result.task_id,
                data: result.clone(),
            })
            .await;
        Ok(result)
    }

    /// Advances the counter for one accepted result and applies the
    /// closure rules: full house finishes, a post past the deadline
    /// finishes late, anything else keeps the task running.
    async fn settle(&self, task_id: Uuid) -> Result<()> {
        let (expected, received) = self.store.increment_received(task_id).await?;
        let next = if received >= expected {
            TaskStatus::Finished
        } else if Utc::now() > self.store.get_task(task_id).await?.deadline {
            TaskStatus::Finished
        } else {
            TaskStatus::Running
        };
        let effective = self.store.update_task_status(task_id, next).await?;
        if effective == TaskStatus::Finished && next == TaskStatus::Finished {
            info!(
                "task {} finished ({}/{} results)",
                task_id, received, expected
            );
        }
        Ok(())
    }

    /// The task row joined with all its results in arrival order.
    pub async fn progress(&self, task_id: Uuid) -> Result<TaskProgress> {
        let task = self.store.get_task(task_id).await?;
        let results = self.store.list_results_by_task(task_id).await;
        Ok(TaskProgress { task, results })
    }
}

/// RFC 3339 `checked_at` with a fallback to now when absent or malformed.
fn parse_checked_at(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;

    struct Fixture {
        store: Store,
        bus: JobBus,
        hub: EventHub,
        registry: AgentRegistry,
        coordinator: TaskCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Store::new();
        let bus = JobBus::new();
        let hub = EventHub::new();
        let registry = AgentRegistry::new(store.clone(), false);
        let coordinator = TaskCoordinator::new(
            store.clone(),
            bus.clone(),
            hub.clone(),
            TaskPolicy {
                agents_floor: 3,
                task_ttl_seconds: 90,
                allow_name_heartbeat: false,
            },
        );
        Fixture {
            store,
            bus,
            hub,
            registry,
            coordinator,
        }
    }

    fn submission(task_id: Uuid, agent: &str, method: &str) -> ResultSubmission {
        ResultSubmission {
            task_id,
            agent_id: agent.to_string(),
            region: "eu".to_string(),
            method: method.to_string(),
            success: true,
            latency_ms: 20,
            status_code: 200,
            message: String::new(),
            checked_at: None,
            details: None,
        }
    }

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn intake_computes_expected_and_fans_out() {
        let f = fixture();
        f.registry.create("agent-a", "eu").await.unwrap();
        f.registry.create("agent-b", "us").await.unwrap();

        let task = f
            .coordinator
            .submit("example.com", &strings(&["http", "dns"]))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.expected_results, 4);
        assert_eq!(f.bus.len("agent-a").await, 1);
        assert_eq!(f.bus.len("agent-b").await, 1);

        let (_, payload) = f.bus.blocking_pop(&strings(&["agent-a"])).await;
        let job: TaskJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(job.task_id, task.id);
        assert_eq!(job.target, "example.com");
        assert_eq!(job.methods.len(), 2);
    }

    #[tokio::test]
    async fn intake_uses_floor_when_no_agents_are_active() {
        let f = fixture();
        let task = f
            .coordinator
            .submit("t", &strings(&["icmp"]))
            .await
            .unwrap();
        // floor 3 × 1 method
        assert_eq!(task.expected_results, 3);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn intake_filters_methods_and_rejects_empty() {
        let f = fixture();
        f.registry.create("agent-a", "eu").await.unwrap();

        let task = f
            .coordinator
            .submit("t", &strings(&["HTTP", "ftp", "dns", "dns"]))
            .await
            .unwrap();
        assert_eq!(task.methods.len(), 2);
        assert_eq!(task.expected_results, 2);

        assert!(matches!(
            f.coordinator.submit("t", &strings(&["ftp"])).await,
            Err(ProbeMeshError::BadRequest(_))
        ));
        assert!(matches!(
            f.coordinator.submit("  ", &strings(&["http"])).await,
            Err(ProbeMeshError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn full_house_finishes_the_task() {
        let f = fixture();
        f.registry.create("agent-a", "eu").await.unwrap();
        f.registry.create("agent-b", "us").await.unwrap();
        let task = f
            .coordinator
            .submit("example.com", &strings(&["http", "dns"]))
            .await
            .unwrap();

        for agent in ["agent-a", "agent-b"] {
            for method in ["http", "dns"] {
                f.coordinator
                    .ingest_result(submission(task.id, agent, method))
                    .await
                    .unwrap();
            }
        }

        let progress = f.coordinator.progress(task.id).await.unwrap();
        assert_eq!(progress.task.status, TaskStatus::Finished);
        assert_eq!(progress.task.received_results, 4);
        assert_eq!(progress.results.len(), 4);
    }

    #[tokio::test]
    async fn duplicates_persist_but_do_not_close_early() {
        let f = fixture();
        f.registry.create("agent-a", "eu").await.unwrap();
        f.registry.create("agent-b", "us").await.unwrap();
        let task = f
            .coordinator
            .submit("example.com", &strings(&["icmp"]))
            .await
            .unwrap();
        assert_eq!(task.expected_results, 2);

        f.coordinator
            .ingest_result(submission(task.id, "agent-a", "icmp"))
            .await
            .unwrap();
        // The queue redelivered; the same cell arrives again.
        f.coordinator
            .ingest_result(submission(task.id, "agent-a", "icmp"))
            .await
            .unwrap();

        let progress = f.coordinator.progress(task.id).await.unwrap();
        assert_eq!(progress.task.status, TaskStatus::Running);
        assert_eq!(progress.task.received_results, 1);
        assert_eq!(progress.results.len(), 2, "duplicate row is kept");
    }

    #[tokio::test]
    async fn post_after_deadline_closes_late() {
        let f = fixture();
        let store = f.store.clone();
        f.registry.create("agent-a", "eu").await.unwrap();
        f.registry.create("agent-b", "us").await.unwrap();

        // Insert directly with an already-passed deadline.
        let task = store
            .insert_task(
                "t",
                vec![crate::models::ProbeMethod::Icmp],
                2,
                Utc::now() - Duration::seconds(1),
            )
            .await;
        store
            .update_task_status(task.id, TaskStatus::Running)
            .await
            .unwrap();

        f.coordinator
            .ingest_result(submission(task.id, "agent-a", "icmp"))
            .await
            .unwrap();

        let fetched = store.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Finished);
        assert_eq!(fetched.received_results, 1);
    }

    #[tokio::test]
    async fn unknown_method_and_missing_task_are_rejected() {
        let f = fixture();
        f.registry.create("agent-a", "eu").await.unwrap();
        let task = f
            .coordinator
            .submit("t", &strings(&["http"]))
            .await
            .unwrap();

        assert!(matches!(
            f.coordinator
                .ingest_result(submission(task.id, "agent-a", "ftp"))
                .await,
            Err(ProbeMeshError::BadRequest(_))
        ));
        assert!(matches!(
            f.coordinator
                .ingest_result(submission(Uuid::new_v4(), "agent-a", "http"))
                .await,
            Err(ProbeMeshError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ingress_broadcasts_every_result() {
        let f = fixture();
        f.registry.create("agent-a", "eu").await.unwrap();
        let task = f
            .coordinator
            .submit("t", &strings(&["http"]))
            .await
            .unwrap();

        let (_, mut rx) = f.hub.subscribe().await;
        f.coordinator
            .ingest_result(submission(task.id, "agent-a", "http"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::Result { task_id, data } => {
                assert_eq!(task_id, task.id);
                assert_eq!(data.agent_id, "agent-a");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // A late result after closure still broadcasts (task finished at
        // expected=1 above).
        f.coordinator
            .ingest_result(submission(task.id, "agent-b", "http"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Event::Result { .. }));
        let progress = f.coordinator.progress(task.id).await.unwrap();
        assert_eq!(progress.task.status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn checked_at_falls_back_to_now_on_garbage() {
        let parsed = parse_checked_at(Some("2024-05-01T10:00:00Z"));
        assert_eq!(
            parsed,
            DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap()
        );

        let before = Utc::now();
        let fallback = parse_checked_at(Some("not-a-time"));
        assert!(fallback >= before);
        let absent = parse_checked_at(None);
        assert!(absent >= before);
    }
}
