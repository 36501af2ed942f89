//! Health derivation
//!
//! One small pure function per entity kind. Adding a node kind means adding
//! a state type and its `DeriveHealth` impl; nothing else changes.

use crate::models::{
    ClusterNodeState, ConditionStatus, ExternalState, FlowMetrics, HealthStatus, NamespacePhase,
    NamespaceState, NodeState, PodPhase, PodState, PolicyState, ServiceState,
};

/// Error rate above which an edge is failed
pub const EDGE_FAILED_ERROR_RATE: f64 = 0.10;

/// Error rate above which an edge is degraded
pub const EDGE_DEGRADED_ERROR_RATE: f64 = 0.05;

/// Maps observed state to a health classification
pub trait DeriveHealth {
    fn derive_health(&self) -> HealthStatus;
}

impl DeriveHealth for PodState {
    fn derive_health(&self) -> HealthStatus {
        match self.phase {
            PodPhase::Running if self.ready => HealthStatus::Healthy,
            PodPhase::Running | PodPhase::Pending => HealthStatus::Degraded,
            PodPhase::Succeeded => HealthStatus::Healthy,
            PodPhase::Failed => HealthStatus::Failed,
            PodPhase::Unknown => HealthStatus::Unknown,
        }
    }
}

impl DeriveHealth for ClusterNodeState {
    fn derive_health(&self) -> HealthStatus {
        match self.ready {
            ConditionStatus::True
                if self.memory_pressure || self.disk_pressure || self.pid_pressure =>
            {
                HealthStatus::Degraded
            }
            ConditionStatus::True => HealthStatus::Healthy,
            ConditionStatus::False => HealthStatus::Failed,
            ConditionStatus::Unknown => HealthStatus::Unknown,
        }
    }
}

impl DeriveHealth for ServiceState {
    fn derive_health(&self) -> HealthStatus {
        match (self.ready_endpoints, self.total_endpoints) {
            (None, _) => HealthStatus::Unknown,
            (Some(0), _) => HealthStatus::Failed,
            (Some(ready), Some(total)) if ready < total => HealthStatus::Degraded,
            (Some(_), _) => HealthStatus::Healthy,
        }
    }
}

impl DeriveHealth for NamespaceState {
    fn derive_health(&self) -> HealthStatus {
        match self.phase {
            NamespacePhase::Active => HealthStatus::Healthy,
            NamespacePhase::Terminating => HealthStatus::Degraded,
        }
    }
}

impl DeriveHealth for PolicyState {
    fn derive_health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

impl DeriveHealth for ExternalState {
    fn derive_health(&self) -> HealthStatus {
        HealthStatus::Unknown
    }
}

impl DeriveHealth for NodeState {
    fn derive_health(&self) -> HealthStatus {
        match self {
            NodeState::Pod(s) => s.derive_health(),
            NodeState::Service(s) => s.derive_health(),
            NodeState::ClusterNode(s) => s.derive_health(),
            NodeState::Namespace(s) => s.derive_health(),
            NodeState::Policy(s) => s.derive_health(),
            NodeState::External(s) => s.derive_health(),
        }
    }
}

/// Edge health from its flow metrics; keeps `prior` when there is nothing
/// newer to go on (no metrics, or an idle flow with a low error rate)
pub fn derive_edge_health(flow: Option<&FlowMetrics>, prior: HealthStatus) -> HealthStatus {
    match flow {
        Some(m) if m.error_rate > EDGE_FAILED_ERROR_RATE => HealthStatus::Failed,
        Some(m) if m.error_rate > EDGE_DEGRADED_ERROR_RATE => HealthStatus::Degraded,
        Some(m) if m.is_active => HealthStatus::Healthy,
        _ => prior,
    }
}
