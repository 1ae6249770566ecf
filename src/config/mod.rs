use crate::constants::{DEFAULT_AGENTS_FLOOR, DEFAULT_TASK_TTL_SECS};
use crate::{ProbeMeshError, Result};
use serde::{Deserialize, Serialize};
use std::env;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub tasks: TaskPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token agents present on POST /api/results.
    pub results_token: String,
    pub admin_user: String,
    pub admin_pass: String,
    /// Base URL agents are told to reach the API on; embedded in rendered
    /// launch commands.
    pub public_api_base: String,
    pub agent_image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPolicy {
    /// Expected-count floor used when the registry reports zero active agents.
    pub agents_floor: usize,
    pub task_ttl_seconds: u64,
    /// Legacy affordance: accept an agent's name in place of its token on
    /// heartbeat. Off unless explicitly enabled.
    pub allow_name_heartbeat: bool,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ProbeMeshError::Configuration(format!("invalid {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // .env is optional; running without one is the container default.
        if let Ok(path) = dotenvy::dotenv() {
            tracing::info!("loaded .env file from {}", path.display());
        }

        let results_token = env_or("RESULTS_TOKEN", "dev-token");
        if results_token.trim().is_empty() {
            return Err(ProbeMeshError::Configuration(
                "RESULTS_TOKEN cannot be blank".to_string(),
            ));
        }

        let admin_user = env_or("ADMIN_USER", "admin");
        let admin_pass = env_or("ADMIN_PASS", "admin");
        if admin_user.trim().is_empty() || admin_pass.trim().is_empty() {
            return Err(ProbeMeshError::Configuration(
                "ADMIN_USER and ADMIN_PASS cannot be blank".to_string(),
            ));
        }

        let api = ApiConfig {
            host: env_or("API_HOST", "0.0.0.0"),
            port: parse_env("API_PORT", 8080u16)?,
            results_token,
            admin_user,
            admin_pass,
            public_api_base: env_or("PUBLIC_API_BASE", "http://api:8080")
                .trim_end_matches('/')
                .to_string(),
            agent_image: env_or("AGENT_IMAGE", "probemesh-agent:latest"),
        };

        let agents_floor = parse_env("AGENTS_COUNT_FLOOR", DEFAULT_AGENTS_FLOOR)?;
        if agents_floor == 0 {
            return Err(ProbeMeshError::Configuration(
                "AGENTS_COUNT_FLOOR must be at least 1".to_string(),
            ));
        }
        let task_ttl_seconds = parse_env("TASK_TTL_SECONDS", DEFAULT_TASK_TTL_SECS)?;
        if task_ttl_seconds == 0 {
            return Err(ProbeMeshError::Configuration(
                "TASK_TTL_SECONDS must be at least 1".to_string(),
            ));
        }

        let tasks = TaskPolicy {
            agents_floor,
            task_ttl_seconds,
            allow_name_heartbeat: parse_env("ALLOW_NAME_HEARTBEAT", false)?,
        };

        Ok(Config { api, tasks })
    }
}

/// Configuration for an agent runtime process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub api_base: String,
    pub results_token: String,
    pub name: String,
    pub region: String,
    pub token: String,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let name = env::var("AGENT_NAME")
            .map_err(|_| ProbeMeshError::Configuration("AGENT_NAME is required".to_string()))?;
        if name.trim().is_empty() {
            return Err(ProbeMeshError::Configuration(
                "AGENT_NAME cannot be blank".to_string(),
            ));
        }
        Ok(AgentConfig {
            api_base: env_or("API_BASE", "http://api:8080")
                .trim_end_matches('/')
                .to_string(),
            results_token: env_or("RESULTS_TOKEN", "dev-token"),
            name,
            region: env_or("REGION", "unknown"),
            token: env_or("AGENT_TOKEN", ""),
        })
    }
}
