// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! steward-registry
#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use steward_core::{AgentRecord, SchedulingHints, WorkType, sha256_hex};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The agent id is not registered.
    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),

    /// An agent with this id already exists.
    #[error("agent `{0}` is already registered")]
    DuplicateAgent(String),

    /// Registration input failed validation.
    #[error("invalid registration: {0}")]
    Invalid(String),
}

/// Per-agent circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Excluded from selection for the cooldown window.
    Open,
    /// Cooldown elapsed; one probe dispatch is allowed.
    HalfOpen,
}

/// Heartbeat payload reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// Free capacity in percent, 0–100.
    pub free_capacity_percent: f64,
    /// Tasks the agent believes it is running.
    pub active_tasks: u32,
}

/// Liveness of an agent as derived from its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heard from within the heartbeat TTL.
    Available,
    /// Heartbeat TTL expired.
    Unavailable,
}

struct AgentEntry {
    id: String,
    agent_type: String,
    capabilities: BTreeSet<String>,
    token_sha256: String,
    registered_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    last_heartbeat_mono: Option<Instant>,
    declared_capacity: u32,
    free_capacity_percent: f64,
    active_tasks: u32,
    breaker: BreakerState,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    probe_in_flight: bool,
}

impl AgentEntry {
    fn liveness(&self, ttl: Duration) -> Liveness {
        match self.last_heartbeat_mono {
            Some(at) if at.elapsed() <= ttl => Liveness::Available,
            // Seeded-from-store entries have no monotonic heartbeat yet
            // and stay unavailable until the agent reports in.
            _ => Liveness::Unavailable,
        }
    }

    /// Observe the breaker, applying the open→half-open transition
    /// when the cooldown has elapsed.
    fn observe_breaker(&mut self) -> BreakerState {
        if self.breaker == BreakerState::Open {
            if let Some(until) = self.cooldown_until {
                if Instant::now() >= until {
                    self.breaker = BreakerState::HalfOpen;
                    self.probe_in_flight = false;
                    debug!(
                        target: "steward.registry.breaker",
                        agent_id = %self.id,
                        "cooldown elapsed, breaker half-open"
                    );
                }
            }
        }
        self.breaker
    }
}

/// Reporting view of one registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentView {
    /// Agent id.
    pub id: String,
    /// Agent type.
    pub agent_type: String,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
    /// Liveness as of this snapshot.
    pub liveness: Liveness,
    /// Breaker state as of this snapshot.
    pub breaker: BreakerState,
    /// Free capacity last reported.
    pub free_capacity_percent: f64,
    /// Active task count as tracked by the orchestrator.
    pub active_tasks: u32,
    /// Declared concurrent capacity.
    pub declared_capacity: u32,
    /// Last heartbeat timestamp.
    pub last_heartbeat: DateTime<Utc>,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Persistable record for the state store.
    pub record: AgentRecord,
    /// The bearer token issued to the agent. Only ever returned here;
    /// the registry stores the hash.
    pub token: String,
}

/// Tracks connected agents. All mutation goes through these methods;
/// the internal lock is a plain mutex and is never held across `await`.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentEntry>>,
    heartbeat_ttl: Duration,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl AgentRegistry {
    /// Create a registry with the given liveness and breaker settings.
    #[must_use]
    pub fn new(heartbeat_ttl: Duration, breaker_threshold: u32, breaker_cooldown: Duration) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            heartbeat_ttl,
            breaker_threshold,
            breaker_cooldown,
        }
    }

    /// Register a new agent, issuing a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on duplicate ids or invalid input.
    pub fn register(
        &self,
        id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        declared_capacity: u32,
    ) -> Result<Registration, RegistryError> {
        let id = id.into();
        let agent_type = agent_type.into();
        if id.is_empty() {
            return Err(RegistryError::Invalid("agent id must not be empty".into()));
        }
        if agent_type.is_empty() {
            return Err(RegistryError::Invalid(
                "agent type must not be empty".into(),
            ));
        }
        if declared_capacity == 0 {
            return Err(RegistryError::Invalid(
                "declared capacity must be at least 1".into(),
            ));
        }

        let token = Uuid::new_v4().simple().to_string();
        let token_sha256 = sha256_hex(token.as_bytes());
        let now = Utc::now();
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();

        let mut agents = self.agents.lock().expect("registry lock poisoned");
        if agents.contains_key(&id) {
            return Err(RegistryError::DuplicateAgent(id));
        }
        agents.insert(
            id.clone(),
            AgentEntry {
                id: id.clone(),
                agent_type: agent_type.clone(),
                capabilities: capabilities.clone(),
                token_sha256: token_sha256.clone(),
                registered_at: now,
                last_heartbeat_at: now,
                last_heartbeat_mono: Some(Instant::now()),
                declared_capacity,
                free_capacity_percent: 100.0,
                active_tasks: 0,
                breaker: BreakerState::Closed,
                consecutive_failures: 0,
                cooldown_until: None,
                probe_in_flight: false,
            },
        );
        info!(
            target: "steward.registry",
            agent_id = %id,
            agent_type = %agent_type,
            declared_capacity,
            "agent registered"
        );
        Ok(Registration {
            record: AgentRecord {
                id,
                agent_type,
                capabilities: capabilities.into_iter().collect(),
                token_sha256,
                declared_capacity,
                registered_at: now,
                last_heartbeat: now,
            },
            token,
        })
    }

    /// Seed the registry from persisted records on restart. Seeded
    /// agents are unavailable until their next live heartbeat.
    pub fn seed(&self, records: Vec<AgentRecord>) {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        for record in records {
            agents.entry(record.id.clone()).or_insert(AgentEntry {
                id: record.id,
                agent_type: record.agent_type,
                capabilities: record.capabilities.into_iter().collect(),
                token_sha256: record.token_sha256,
                registered_at: record.registered_at,
                last_heartbeat_at: record.last_heartbeat,
                last_heartbeat_mono: None,
                declared_capacity: record.declared_capacity,
                free_capacity_percent: 0.0,
                active_tasks: 0,
                breaker: BreakerState::Closed,
                consecutive_failures: 0,
                cooldown_until: None,
                probe_in_flight: false,
            });
        }
    }

    /// Record a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] for unregistered ids.
    pub fn heartbeat(&self, id: &str, metrics: HeartbeatMetrics) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        let entry = agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
        entry.last_heartbeat_at = Utc::now();
        entry.last_heartbeat_mono = Some(Instant::now());
        entry.free_capacity_percent = metrics.free_capacity_percent.clamp(0.0, 100.0);
        entry.active_tasks = metrics.active_tasks;
        Ok(())
    }

    /// Remove an agent entirely.
    pub fn forget(&self, id: &str) -> bool {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        agents.remove(id).is_some()
    }

    /// Verify a bearer token against the stored hash.
    #[must_use]
    pub fn verify_token(&self, id: &str, token: &str) -> bool {
        let agents = self.agents.lock().expect("registry lock poisoned");
        agents
            .get(id)
            .is_some_and(|entry| entry.token_sha256 == sha256_hex(token.as_bytes()))
    }

    /// Select an agent for a work type.
    ///
    /// Policy: capability superset, breaker not open (a half-open
    /// agent admits exactly one probe), alive within the heartbeat TTL;
    /// among survivors prefer the lowest active task count, then the
    /// most recent heartbeat. Returns `None` when nobody qualifies —
    /// callers then consult the scheduler for pause-vs-reject.
    #[must_use]
    pub fn select(&self, work_type: WorkType, _hints: &SchedulingHints) -> Option<String> {
        let required = work_type.as_str();
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        let ttl = self.heartbeat_ttl;
        let mut best: Option<(String, u32, Instant)> = None;
        for entry in agents.values_mut() {
            let breaker = entry.observe_breaker();
            if breaker == BreakerState::Open {
                continue;
            }
            if breaker == BreakerState::HalfOpen && entry.probe_in_flight {
                continue;
            }
            if !entry.capabilities.contains(required) {
                continue;
            }
            if entry.liveness(ttl) != Liveness::Available {
                continue;
            }
            let Some(heartbeat) = entry.last_heartbeat_mono else {
                continue;
            };
            let candidate = (entry.id.clone(), entry.active_tasks, heartbeat);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let better = candidate.1 < current.1
                        || (candidate.1 == current.1 && candidate.2 > current.2);
                    if better { Some(candidate) } else { Some(current) }
                }
            };
        }
        best.map(|(id, _, _)| id)
    }

    /// Count a dispatch against the agent. A half-open agent consumes
    /// its single probe slot.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] for unregistered ids.
    pub fn record_dispatch(&self, id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        let entry = agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
        entry.active_tasks += 1;
        if entry.breaker == BreakerState::HalfOpen {
            entry.probe_in_flight = true;
        }
        Ok(())
    }

    /// Record a task outcome for breaker accounting and load tracking.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] for unregistered ids.
    pub fn record_outcome(&self, id: &str, success: bool) -> Result<BreakerState, RegistryError> {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        let entry = agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.to_string()))?;
        entry.active_tasks = entry.active_tasks.saturating_sub(1);
        if success {
            entry.consecutive_failures = 0;
            if entry.breaker != BreakerState::Closed {
                info!(
                    target: "steward.registry.breaker",
                    agent_id = %id,
                    "probe succeeded, breaker closed"
                );
            }
            entry.breaker = BreakerState::Closed;
            entry.cooldown_until = None;
            entry.probe_in_flight = false;
        } else {
            entry.consecutive_failures += 1;
            let reopen = entry.breaker == BreakerState::HalfOpen;
            if reopen || entry.consecutive_failures >= self.breaker_threshold {
                entry.breaker = BreakerState::Open;
                entry.cooldown_until = Some(Instant::now() + self.breaker_cooldown);
                entry.probe_in_flight = false;
                warn!(
                    target: "steward.registry.breaker",
                    agent_id = %id,
                    consecutive_failures = entry.consecutive_failures,
                    cooldown_seconds = self.breaker_cooldown.as_secs(),
                    "breaker open"
                );
            }
        }
        Ok(entry.breaker)
    }

    /// Release a dispatch slot without touching the breaker (used for
    /// cancellations, which say nothing about agent health).
    pub fn release(&self, id: &str) {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        if let Some(entry) = agents.get_mut(id) {
            entry.active_tasks = entry.active_tasks.saturating_sub(1);
            if entry.breaker == BreakerState::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }

    /// Breaker state of an agent, applying cooldown transitions.
    #[must_use]
    pub fn breaker_state(&self, id: &str) -> Option<BreakerState> {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        agents.get_mut(id).map(AgentEntry::observe_breaker)
    }

    /// Free capacity last reported by an agent.
    #[must_use]
    pub fn free_capacity_percent(&self, id: &str) -> Option<f64> {
        let agents = self.agents.lock().expect("registry lock poisoned");
        agents.get(id).map(|e| e.free_capacity_percent)
    }

    /// Whether the agent has a free slot: the orchestrator never keeps
    /// more in-flight tasks on an agent than it declared capacity for.
    #[must_use]
    pub fn has_free_slot(&self, id: &str) -> bool {
        let agents = self.agents.lock().expect("registry lock poisoned");
        agents
            .get(id)
            .is_some_and(|e| e.active_tasks < e.declared_capacity)
    }

    /// The agent type of a registered agent.
    #[must_use]
    pub fn agent_type(&self, id: &str) -> Option<String> {
        let agents = self.agents.lock().expect("registry lock poisoned");
        agents.get(id).map(|e| e.agent_type.clone())
    }

    /// Active tasks currently attributed to an agent.
    #[must_use]
    pub fn active_tasks(&self, id: &str) -> Option<u32> {
        let agents = self.agents.lock().expect("registry lock poisoned");
        agents.get(id).map(|e| e.active_tasks)
    }

    /// Point-in-time view of every agent.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentView> {
        let mut agents = self.agents.lock().expect("registry lock poisoned");
        let ttl = self.heartbeat_ttl;
        let mut views: Vec<AgentView> = agents
            .values_mut()
            .map(|entry| {
                let breaker = entry.observe_breaker();
                AgentView {
                    id: entry.id.clone(),
                    agent_type: entry.agent_type.clone(),
                    capabilities: entry.capabilities.iter().cloned().collect(),
                    liveness: entry.liveness(ttl),
                    breaker,
                    free_capacity_percent: entry.free_capacity_percent,
                    active_tasks: entry.active_tasks,
                    declared_capacity: entry.declared_capacity,
                    last_heartbeat: entry.last_heartbeat_at,
                }
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }
}
