// Coordinator configuration surface
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cadre_types::{AgentRole, RoleRequirements};

use crate::error::{CadreError, Result};

/// Per-role provider call timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTimeouts {
    #[serde(with = "duration_secs")]
    pub planner: Duration,
    #[serde(with = "duration_secs")]
    pub worker: Duration,
    #[serde(with = "duration_secs")]
    pub verifier: Duration,
}

impl Default for RoleTimeouts {
    fn default() -> Self {
        Self {
            planner: Duration::from_secs(120),
            worker: Duration::from_secs(300),
            verifier: Duration::from_secs(180),
        }
    }
}

impl RoleTimeouts {
    pub fn for_role(&self, role: AgentRole) -> Duration {
        match role {
            AgentRole::Planner => self.planner,
            AgentRole::Worker => self.worker,
            AgentRole::Verifier => self.verifier,
        }
    }
}

/// Configuration for one coordination session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum planner/worker/verifier loop iterations before the run is
    /// reported as `MaxIterationsReached`.
    pub max_iterations: u32,
    /// Capacity of the critical-event replay log; oldest entries are evicted
    /// first.
    pub max_log_size: usize,
    /// How many recent events a late bus subscriber receives on attach.
    pub replay_size: usize,
    #[serde(default)]
    pub role_timeouts: RoleTimeouts,
    /// Grace window between asking a session to terminate and killing it.
    #[serde(with = "duration_secs", default = "default_grace_period")]
    pub session_grace_period: Duration,
    /// Overrides of the built-in per-role capability requirements.
    #[serde(default)]
    pub per_role_requirements: HashMap<AgentRole, RoleRequirements>,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_log_size: 1024,
            replay_size: 8,
            role_timeouts: RoleTimeouts::default(),
            session_grace_period: default_grace_period(),
            per_role_requirements: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations < 1 {
            return Err(CadreError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_log_size < 1 {
            return Err(CadreError::Configuration(
                "max_log_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective requirements for a role: the configured override, or the
    /// built-in defaults.
    pub fn requirements_for(&self, role: AgentRole) -> RoleRequirements {
        self.per_role_requirements
            .get(&role)
            .copied()
            .unwrap_or_else(|| RoleRequirements::defaults_for(role))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
