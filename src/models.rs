use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::ONLINE_WINDOW_SECS;

/// A single network test an agent can run against a target.
///
/// The set is closed; anything outside it is dropped at intake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    Http,
    Dns,
    Tcp,
    Icmp,
    Udp,
    Whois,
    Traceroute,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeMethod::Http => "http",
            ProbeMethod::Dns => "dns",
            ProbeMethod::Tcp => "tcp",
            ProbeMethod::Icmp => "icmp",
            ProbeMethod::Udp => "udp",
            ProbeMethod::Whois => "whois",
            ProbeMethod::Traceroute => "traceroute",
        }
    }
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(ProbeMethod::Http),
            "dns" => Ok(ProbeMethod::Dns),
            "tcp" => Ok(ProbeMethod::Tcp),
            "icmp" => Ok(ProbeMethod::Icmp),
            "udp" => Ok(ProbeMethod::Udp),
            "whois" => Ok(ProbeMethod::Whois),
            "traceroute" => Ok(ProbeMethod::Traceroute),
            other => Err(format!("unknown probe method: {other}")),
        }
    }
}

/// Normalizes a raw method list: trim, lower-case, filter to the closed
/// set, de-duplicate preserving first-seen order. Idempotent.
pub fn normalize_methods(raw: &[String]) -> Vec<ProbeMethod> {
    let mut out: Vec<ProbeMethod> = Vec::with_capacity(raw.len());
    for entry in raw {
        if let Ok(method) = entry.parse::<ProbeMethod>() {
            if !out.contains(&method) {
                out.push(method);
            }
        }
    }
    out
}

/// Current status of a check task.
///
/// `Finished` and `Failed` are terminal; the store never moves a task out
/// of a terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

/// A client-submitted check request, fanned out to every active agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTask {
    pub id: Uuid,
    pub target: String,
    pub methods: Vec<ProbeMethod>,
    pub status: TaskStatus,
    pub expected_results: u32,
    pub received_results: u32,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One `(task, agent, method)` outcome posted by an agent or synthesized
/// by the janitor. `agent_id` carries the agent's public name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub region: String,
    pub method: ProbeMethod,
    pub success: bool,
    pub latency_ms: i64,
    pub status_code: i32,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Insert payload for a result row; the store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub region: String,
    pub method: ProbeMethod,
    pub success: bool,
    pub latency_ms: i64,
    pub status_code: i32,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

/// A registered probe agent.
///
/// `name` is the public identity used in results and as the queue key;
/// `token` is the secret the agent presents for heartbeats.
/// `tasks_completed` is derived by the store when listing (distinct tasks
/// the agent has produced any result for).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    pub region: String,
    pub ip: Option<String>,
    pub token: String,
    pub revoked: bool,
    pub tasks_completed: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Online means active (not revoked) and heartbeated within the window.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        match self.last_heartbeat {
            Some(beat) => now - beat <= Duration::seconds(ONLINE_WINDOW_SECS),
            None => false,
        }
    }

    /// Token suffix safe to show in admin views.
    pub fn token_tail(&self) -> String {
        token_tail(&self.token)
    }
}

pub fn token_tail(token: &str) -> String {
    let tail_len = crate::constants::TOKEN_TAIL_LEN;
    if token.len() > tail_len {
        token[token.len() - tail_len..].to_string()
    } else {
        token.to_string()
    }
}

/// The job record fanned out to each active agent's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskJob {
    pub task_id: Uuid,
    pub target: String,
    pub methods: Vec<ProbeMethod>,
    pub requested_at: DateTime<Utc>,
}

/// An event broadcast to hub subscribers, one JSON message per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Result {
        task_id: Uuid,
        data: CheckResult,
    },
    Log {
        task_id: String,
        agent_id: String,
        region: String,
        stage: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_lowercases_filters_and_dedupes() {
        let methods = normalize_methods(&strings(&["HTTP", "ftp", "dns", "dns"]));
        assert_eq!(methods, vec![ProbeMethod::Http, ProbeMethod::Dns]);
    }

    #[test]
    fn normalize_preserves_first_seen_order() {
        let methods = normalize_methods(&strings(&["whois", " tcp ", "http", "TCP"]));
        assert_eq!(
            methods,
            vec![ProbeMethod::Whois, ProbeMethod::Tcp, ProbeMethod::Http]
        );
    }

    #[test]
    fn normalize_empty_when_nothing_valid() {
        assert!(normalize_methods(&strings(&["ftp", "gopher", ""])).is_empty());
    }

    #[test]
    fn method_serde_is_lowercase() {
        let json = serde_json::to_string(&ProbeMethod::Traceroute).unwrap();
        assert_eq!(json, "\"traceroute\"");
        let parsed: ProbeMethod = serde_json::from_str("\"icmp\"").unwrap();
        assert_eq!(parsed, ProbeMethod::Icmp);
    }

    #[test]
    fn online_window_boundary() {
        let now = Utc::now();
        let mut agent = AgentRecord {
            id: Uuid::new_v4(),
            name: "probe-1".to_string(),
            region: "eu".to_string(),
            ip: None,
            token: "t".to_string(),
            revoked: false,
            tasks_completed: 0,
            last_heartbeat: Some(now - Duration::seconds(ONLINE_WINDOW_SECS)),
            created_at: now,
        };
        assert!(agent.is_online(now));

        agent.last_heartbeat = Some(now - Duration::seconds(ONLINE_WINDOW_SECS + 1));
        assert!(!agent.is_online(now));

        agent.last_heartbeat = None;
        assert!(!agent.is_online(now));
    }

    #[test]
    fn revoked_agent_is_never_online() {
        let now = Utc::now();
        let agent = AgentRecord {
            id: Uuid::new_v4(),
            name: "probe-1".to_string(),
            region: "eu".to_string(),
            ip: None,
            token: "t".to_string(),
            revoked: true,
            tasks_completed: 0,
            last_heartbeat: Some(now),
            created_at: now,
        };
        assert!(!agent.is_online(now));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::Log {
            task_id: "t1".to_string(),
            agent_id: "probe-1".to_string(),
            region: "eu".to_string(),
            stage: "start".to_string(),
            message: "beginning checks".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["stage"], "start");
    }

    #[test]
    fn token_tail_truncates_long_tokens() {
        assert_eq!(token_tail("abcdef123"), "f123");
        assert_eq!(token_tail("ab"), "ab");
    }
}
