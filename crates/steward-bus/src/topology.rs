// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue naming.
//!
//! One inbound queue per agent type, per-host subqueues for host-bound
//! work, and two orchestrator-side queues for results and status
//! traffic. All queues are durable.

/// Computes the queue names used across the deployment.
#[derive(Debug, Clone, Copy)]
pub struct Topology;

impl Topology {
    /// Queue the orchestrator consumes `work_result` messages from.
    pub const RESULTS: &'static str = "orchestrator.results";

    /// Queue the orchestrator consumes `work_status` messages from.
    pub const STATUS: &'static str = "orchestrator.status";

    /// Inbound queue for every agent of a type: `agent.<type>`.
    #[must_use]
    pub fn agent_queue(agent_type: &str) -> String {
        format!("agent.{agent_type}")
    }

    /// Host-bound subqueue: `agent.<type>.<host>`.
    #[must_use]
    pub fn agent_host_queue(agent_type: &str, host: &str) -> String {
        format!("agent.{agent_type}.{host}")
    }

    /// The queues the orchestrator itself consumes.
    #[must_use]
    pub fn orchestrator_queues() -> [&'static str; 2] {
        [Self::RESULTS, Self::STATUS]
    }
}
