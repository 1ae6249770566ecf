//! # Probemesh
//!
//! Probemesh is a distributed network-probing control plane: clients
//! submit a target plus a set of probe methods, and the system fans the
//! request out to a fleet of geographically distributed agents that each
//! run every method and report structured results.
//!
//! ## Architecture
//!
//! The control plane consists of:
//! - **Durable store**: tasks, results and agents with atomic counters
//! - **Job bus**: per-agent ordered queues with a blocking pop
//! - **Agent registry**: registration, heartbeat liveness, token rotation
//! - **Task coordinator**: intake, fan-out, result aggregation and
//!   deadline-bounded closure
//! - **Janitor**: sweeps expired running tasks and synthesizes missing
//!   results
//! - **Event hub**: real-time broadcast of results and stage logs to
//!   WebSocket observers
//! - **Agent runtime**: the remote worker loop pulling jobs and invoking
//!   probes behind the `Prober` seam

/// HTTP API server and endpoints
pub mod api;
/// Per-agent job queues and fan-out
pub mod bus;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Task intake, fan-out and result aggregation
pub mod coordinator;
/// Error types and handling
pub mod error;
/// Event broadcast to subscribed observers
pub mod hub;
/// Deadline sweep and synthetic results
pub mod janitor;
/// Core data models
pub mod models;
/// Agent lifecycle and liveness
pub mod registry;
/// Agent-side job execution loop
pub mod runtime;
/// Durable task, result and agent storage
pub mod store;

#[cfg(test)]
mod tests;

pub use error::{ProbeMeshError, Result};
