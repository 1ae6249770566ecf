//! Agent runtime: pops jobs from the agent's queue, runs every probe
//! method and reports results, stage logs and heartbeats back to the
//! control plane.
//!
//! Probe implementations are external; the runtime only drives the
//! `Prober` seam and owns the reporting side.

use crate::bus::JobBus;
use crate::config::AgentConfig;
use crate::constants::{
    HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS, LOG_POST_TIMEOUT_SECS,
    RESULT_POST_TIMEOUT_SECS,
};
use crate::coordinator::ResultSubmission;
use crate::models::{ProbeMethod, TaskJob};
use crate::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: i64,
    pub status_code: i32,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// The per-method probe function. Implementations (DNS, HTTP, TCP, ICMP,
/// UDP, WHOIS, traceroute) live outside the control plane.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, method: ProbeMethod, target: &str) -> ProbeOutcome;
}

#[derive(Debug, Clone, Serialize)]
struct StageLog<'a> {
    task_id: String,
    agent_id: &'a str,
    region: &'a str,
    stage: &'a str,
    message: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatBody<'a> {
    token: &'a str,
}

/// HTTP client for the control plane's agent-facing endpoints.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    results_token: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, results_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            results_token: results_token.to_string(),
        }
    }

    pub async fn post_result(&self, submission: &ResultSubmission) -> Result<()> {
        self.http
            .post(format!("{}/api/results", self.base_url))
            .timeout(Duration::from_secs(RESULT_POST_TIMEOUT_SECS))
            .header("X-Token", &self.results_token)
            .json(submission)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_log(&self, log: &StageLog<'_>) -> Result<()> {
        self.http
            .post(format!("{}/api/agent/log", self.base_url))
            .timeout(Duration::from_secs(LOG_POST_TIMEOUT_SECS))
            .json(log)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self, token: &str) -> Result<()> {
        self.http
            .post(format!("{}/api/agent/heartbeat", self.base_url))
            .timeout(Duration::from_secs(HEARTBEAT_TIMEOUT_SECS))
            .json(&HeartbeatBody { token })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct AgentRuntime {
    config: AgentConfig,
    bus: JobBus,
    prober: Arc<dyn Prober>,
    client: ControlPlaneClient,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, bus: JobBus, prober: Arc<dyn Prober>) -> Self {
        let client = ControlPlaneClient::new(&config.api_base, &config.results_token);
        Self {
            config,
            bus,
            prober,
            client,
        }
    }

    /// Pop-and-probe loop with a background heartbeat cadence. Runs until
    /// the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let keys = vec![self.config.name.clone()];
        let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        info!("agent {} pulling from its queue", self.config.name);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("agent {} stopping", self.config.name);
                    return;
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.client.heartbeat(self.heartbeat_identifier()).await {
                        warn!("heartbeat failed: {}", err);
                    }
                }
                (_, payload) = self.bus.blocking_pop(&keys) => {
                    match serde_json::from_str::<TaskJob>(&payload) {
                        Ok(job) => self.handle_job(job).await,
                        Err(err) => warn!("discarding malformed job: {}", err),
                    }
                }
            }
        }
    }

    /// Agents provisioned without a token fall back to their name, which
    /// only authenticates when the legacy heartbeat flag is enabled
    /// server-side.
    fn heartbeat_identifier(&self) -> &str {
        if self.config.token.is_empty() {
            &self.config.name
        } else {
            &self.config.token
        }
    }

    /// Runs every method of the job in received order, posting one result
    /// per probe. Stage logs are fire-and-forget.
    async fn handle_job(&self, job: TaskJob) {
        debug!("agent {} picked up task {}", self.config.name, job.task_id);
        self.log(&job, "start", format!("starting checks: {:?}", job.methods))
            .await;
        for method in &job.methods {
            self.log(&job, method.as_str(), "probing".to_string()).await;
            let outcome = self.prober.probe(*method, &job.target).await;
            let submission = ResultSubmission {
                task_id: job.task_id,
                agent_id: self.config.name.clone(),
                region: self.config.region.clone(),
                method: method.as_str().to_string(),
                success: outcome.success,
                latency_ms: outcome.latency_ms,
                status_code: outcome.status_code,
                message: outcome.message,
                checked_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)),
                details: outcome.details,
            };
            if let Err(err) = self.client.post_result(&submission).await {
                warn!(
                    "posting {} result for task {} failed: {}",
                    method, job.task_id, err
                );
            }
        }
        self.log(&job, "done", "all methods complete".to_string())
            .await;
    }

    async fn log(&self, job: &TaskJob, stage: &str, message: String) {
        let entry = StageLog {
            task_id: job.task_id.to_string(),
            agent_id: &self.config.name,
            region: &self.config.region,
            stage,
            message,
        };
        if let Err(err) = self.client.post_log(&entry).await {
            debug!("stage log dropped: {}", err);
        }
    }
}
