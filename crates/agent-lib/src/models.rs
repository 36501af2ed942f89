//! Core data models for the topology and flow store

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification shared by nodes and edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Failed => write!(f, "failed"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Where an entity's current health value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSource {
    /// Computed from the entity's observed state
    #[default]
    Derived,
    /// Set explicitly by a probe or simulation until the next organic update
    Override,
}

/// Kind of topology node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Pod,
    Service,
    ClusterNode,
    Namespace,
    External,
    /// Network policy object, recorded for labeling only
    Policy,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Pod => "pod",
            NodeKind::Service => "service",
            NodeKind::ClusterNode => "cluster_node",
            NodeKind::Namespace => "namespace",
            NodeKind::External => "external",
            NodeKind::Policy => "policy",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod lifecycle phase as reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Tri-state condition value (`True`/`False`/`Unknown`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespacePhase {
    Active,
    Terminating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodState {
    pub phase: PodPhase,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Ready endpoint count; `None` until endpoints have been observed
    #[serde(default)]
    pub ready_endpoints: Option<u32>,
    #[serde(default)]
    pub total_endpoints: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterNodeState {
    #[serde(default)]
    pub ready: ConditionStatus,
    #[serde(default)]
    pub memory_pressure: bool,
    #[serde(default)]
    pub disk_pressure: bool,
    #[serde(default)]
    pub pid_pressure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceState {
    pub phase: NamespacePhase,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyState {
    #[serde(default)]
    pub pod_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub policy_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Kind-specific attributes of a node; the variant determines the node kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pod(PodState),
    Service(ServiceState),
    ClusterNode(ClusterNodeState),
    Namespace(NamespaceState),
    Policy(PolicyState),
    External(ExternalState),
}

impl NodeState {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeState::Pod(_) => NodeKind::Pod,
            NodeState::Service(_) => NodeKind::Service,
            NodeState::ClusterNode(_) => NodeKind::ClusterNode,
            NodeState::Namespace(_) => NodeKind::Namespace,
            NodeState::Policy(_) => NodeKind::Policy,
            NodeState::External(_) => NodeKind::External,
        }
    }
}

/// A cluster entity in the topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub health_source: HealthSource,
    pub state: NodeState,
}

impl Node {
    /// Build a node with its identity derived from kind, namespace and name
    pub fn new(name: impl Into<String>, namespace: Option<String>, state: NodeState) -> Self {
        let name = name.into();
        let kind = state.kind();
        Self {
            id: Self::identity(kind, namespace.as_deref(), &name),
            kind,
            name,
            namespace,
            labels: BTreeMap::new(),
            properties: BTreeMap::new(),
            health: HealthStatus::Unknown,
            health_source: HealthSource::Derived,
            state,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// `kind/namespace/name`, or `kind/name` for cluster-scoped entities
    pub fn identity(kind: NodeKind, namespace: Option<&str>, name: &str) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => format!("{}/{}/{}", kind, ns, name),
            _ => format!("{}/{}", kind, name),
        }
    }
}

/// Logical type of a relationship between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Connection,
    ServiceBinding,
    Policy,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Connection => "connection",
            EdgeKind::ServiceBinding => "service_binding",
            EdgeKind::Policy => "policy",
        }
    }
}

/// Direction of traffic on an edge relative to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    #[default]
    Bidirectional,
    Ingress,
    Egress,
}

/// Aggregated traffic metrics attached to an edge
///
/// Always replaced as a whole; never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMetrics {
    pub bytes_per_sec: f64,
    pub packets_per_sec: f64,
    pub active_connections: u32,
    /// Fraction of errored packets, 0..=1
    pub error_rate: f64,
    pub protocol: String,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub direction: FlowDirection,
}

/// A directed relationship between two topology nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub health_source: HealthSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowMetrics>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: EdgeKind) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: Self::identity(&source, &target, kind),
            source,
            target,
            kind,
            health: HealthStatus::Unknown,
            health_source: HealthSource::Derived,
            latency_ms: None,
            packet_loss: None,
            flow: None,
        }
    }

    /// `source->target` for connections, `source->target#kind` otherwise
    pub fn identity(source: &str, target: &str, kind: EdgeKind) -> String {
        match kind {
            EdgeKind::Connection => format!("{}->{}", source, target),
            other => format!("{}->{}#{}", source, target, other.as_str()),
        }
    }

    pub fn is_flow_active(&self) -> bool {
        self.flow.as_ref().map(|f| f.is_active).unwrap_or(false)
    }
}

/// A single observed flow event from the telemetry producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(default)]
    pub protocol: String,
    pub bytes: u64,
    pub packets: u64,
    /// Packets in this record observed as failed
    #[serde(default)]
    pub errors: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<FlowDirection>,
}

/// Point-in-time copy of the whole topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub timestamp: DateTime<Utc>,
}
