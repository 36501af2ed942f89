//! Concurrent topology registry
//!
//! Holds nodes and edges behind a single reader/writer lock so that a
//! snapshot always sees both maps at the same instant. Every method takes the
//! lock for its own duration only and hands out clones.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::derive::{derive_edge_health, DeriveHealth};
use crate::error::{require, ValidationError};
use crate::models::{
    Edge, EdgeKind, FlowMetrics, HealthSource, HealthStatus, Node, NodeKind, Topology,
};

#[derive(Debug, Default)]
struct TopologyState {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
}

/// Registry of cluster entities and the relationships between them
#[derive(Debug, Default)]
pub struct TopologyStore {
    state: RwLock<TopologyState>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node
    ///
    /// Identity and kind are recomputed from the node's state, and health is
    /// always derived here; any health on the input is ignored.
    pub fn upsert_node(&self, mut node: Node) -> Result<Node, ValidationError> {
        require(&node.name, "node", "name")?;

        node.kind = node.state.kind();
        node.id = Node::identity(node.kind, node.namespace.as_deref(), &node.name);
        node.health = node.state.derive_health();
        node.health_source = HealthSource::Derived;

        debug!(node_id = %node.id, health = %node.health, "Upserting node");
        self.state
            .write()
            .nodes
            .insert(node.id.clone(), node.clone());
        Ok(node)
    }

    /// Insert or replace an edge, keyed by (source, target, kind)
    ///
    /// The stored edge is replaced, except that flow metrics and probed
    /// latency the input leaves unset are carried over from the existing
    /// edge. Health is re-derived; any health on the input is ignored.
    pub fn upsert_edge(&self, mut edge: Edge) -> Result<Edge, ValidationError> {
        require(&edge.source, "edge", "source")?;
        require(&edge.target, "edge", "target")?;

        edge.id = Edge::identity(&edge.source, &edge.target, edge.kind);

        let mut state = self.state.write();
        let prior_health = match state.edges.get(&edge.id) {
            Some(existing) => {
                if edge.flow.is_none() {
                    edge.flow = existing.flow.clone();
                }
                if edge.latency_ms.is_none() {
                    edge.latency_ms = existing.latency_ms;
                }
                existing.health
            }
            None => HealthStatus::default(),
        };
        edge.health = derive_edge_health(edge.flow.as_ref(), prior_health);
        edge.health_source = HealthSource::Derived;
        state.edges.insert(edge.id.clone(), edge.clone());
        Ok(edge)
    }

    /// Create the edge if it does not exist yet; returns its id either way
    pub fn ensure_edge(
        &self,
        source: &str,
        target: &str,
        kind: EdgeKind,
    ) -> Result<String, ValidationError> {
        require(source, "edge", "source")?;
        require(target, "edge", "target")?;

        let id = Edge::identity(source, target, kind);
        let mut state = self.state.write();
        if !state.edges.contains_key(&id) {
            debug!(edge_id = %id, "Creating edge");
            state
                .edges
                .insert(id.clone(), Edge::new(source, target, kind));
        }
        Ok(id)
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.state.read().nodes.get(id).cloned()
    }

    pub fn get_edge(&self, id: &str) -> Option<Edge> {
        self.state.read().edges.get(id).cloned()
    }

    pub fn node_kind(&self, id: &str) -> Option<NodeKind> {
        self.state.read().nodes.get(id).map(|n| n.kind)
    }

    /// Edges whose source is `id`
    pub fn edges_from(&self, id: &str) -> Vec<Edge> {
        self.edges_where(|e| e.source == id)
    }

    /// Edges whose target is `id`
    pub fn edges_to(&self, id: &str) -> Vec<Edge> {
        self.edges_where(|e| e.target == id)
    }

    pub fn edges_where<F>(&self, predicate: F) -> Vec<Edge>
    where
        F: Fn(&Edge) -> bool,
    {
        let mut edges: Vec<Edge> = self
            .state
            .read()
            .edges
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    pub fn edge_ids(&self) -> HashSet<String> {
        self.state.read().edges.keys().cloned().collect()
    }

    /// Fully materialized copy of the topology
    ///
    /// Edges with an endpoint missing from the store are reported with
    /// unknown health; the stored edge is left untouched.
    pub fn snapshot(&self) -> Topology {
        let state = self.state.read();

        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        let mut edges: Vec<Edge> = state
            .edges
            .values()
            .map(|edge| {
                let mut edge = edge.clone();
                if !state.nodes.contains_key(&edge.source)
                    || !state.nodes.contains_key(&edge.target)
                {
                    edge.health = HealthStatus::Unknown;
                }
                edge
            })
            .collect();
        drop(state);

        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        Topology {
            nodes,
            edges,
            timestamp: Utc::now(),
        }
    }

    /// Override a node's health until its next upsert
    pub fn set_node_health(&self, id: &str, health: HealthStatus) -> bool {
        match self.state.write().nodes.get_mut(id) {
            Some(node) => {
                node.health = health;
                node.health_source = HealthSource::Override;
                true
            }
            None => false,
        }
    }

    /// Override an edge's health and record a probed latency until the next
    /// flow update or upsert for that edge
    pub fn set_edge_health(
        &self,
        id: &str,
        health: HealthStatus,
        latency_ms: Option<f64>,
    ) -> bool {
        match self.state.write().edges.get_mut(id) {
            Some(edge) => {
                edge.health = health;
                edge.health_source = HealthSource::Override;
                if latency_ms.is_some() {
                    edge.latency_ms = latency_ms;
                }
                true
            }
            None => false,
        }
    }

    /// Replace the flow metrics of the connection edge `source -> target`,
    /// creating the edge on first observation
    ///
    /// `update` receives the previous metrics (if any) and must return a
    /// complete replacement. It runs under the writer lock, so updates to the
    /// same edge apply in the order they acquire it.
    pub fn apply_flow_metrics<F>(
        &self,
        source: &str,
        target: &str,
        update: F,
    ) -> Result<Edge, ValidationError>
    where
        F: FnOnce(Option<&FlowMetrics>) -> FlowMetrics,
    {
        require(source, "flow", "source")?;
        require(target, "flow", "destination")?;

        let id = Edge::identity(source, target, EdgeKind::Connection);
        let mut state = self.state.write();
        let edge = state
            .edges
            .entry(id)
            .or_insert_with(|| Edge::new(source, target, EdgeKind::Connection));

        let metrics = update(edge.flow.as_ref());
        edge.health = derive_edge_health(Some(&metrics), edge.health);
        edge.health_source = HealthSource::Derived;
        edge.flow = Some(metrics);
        Ok(edge.clone())
    }

    /// Mark flows last seen before `cutoff` as inactive; returns how many
    /// edges changed
    pub fn sweep_inactive(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let mut swept = 0;
        for edge in state.edges.values_mut() {
            if let Some(flow) = edge.flow.as_mut() {
                if flow.is_active && flow.last_seen < cutoff {
                    flow.is_active = false;
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Atomically drop every node and edge
    pub fn reset(&self) {
        let mut state = self.state.write();
        let (nodes, edges) = (state.nodes.len(), state.edges.len());
        state.nodes.clear();
        state.edges.clear();
        info!(nodes, edges, "Topology store reset");
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ClusterNodeState, ConditionStatus, ExternalState, FlowDirection, NodeState, PodPhase,
        PodState,
    };
    use std::sync::Arc;
    use std::thread;

    fn pod(name: &str, phase: PodPhase) -> Node {
        Node::new(
            name,
            Some("default".to_string()),
            NodeState::Pod(PodState {
                phase,
                ready: true,
                pod_ip: Some("10.1.0.7".to_string()),
                host_node: Some("worker-1".to_string()),
            }),
        )
    }

    fn metrics(error_rate: f64) -> FlowMetrics {
        FlowMetrics {
            bytes_per_sec: 512.0,
            packets_per_sec: 4.0,
            active_connections: 1,
            error_rate,
            protocol: "tcp".to_string(),
            last_seen: Utc::now(),
            is_active: true,
            direction: FlowDirection::Bidirectional,
        }
    }

    #[test]
    fn test_upsert_node_last_write_wins() {
        let store = TopologyStore::new();
        store.upsert_node(pod("web", PodPhase::Pending)).unwrap();
        store
            .upsert_node(pod("web", PodPhase::Running).with_label("app", "web"))
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        let node = &snapshot.nodes[0];
        assert_eq!(node.health, HealthStatus::Healthy);
        assert_eq!(node.labels.get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_upsert_node_ignores_supplied_health() {
        let store = TopologyStore::new();
        let mut node = pod("web", PodPhase::Failed);
        node.health = HealthStatus::Healthy;
        node.id = "bogus".to_string();

        let stored = store.upsert_node(node).unwrap();
        assert_eq!(stored.health, HealthStatus::Failed);
        assert_eq!(stored.id, "pod/default/web");
        assert!(store.get_node("bogus").is_none());
    }

    #[test]
    fn test_upsert_node_rejects_missing_name() {
        let store = TopologyStore::new();
        let err = store.upsert_node(pod("", PodPhase::Running)).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { field: "name", .. }));
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn test_ensure_edge_is_idempotent() {
        let store = TopologyStore::new();
        let first = store.ensure_edge("a", "b", EdgeKind::Connection).unwrap();
        let second = store.ensure_edge("a", "b", EdgeKind::Connection).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.edge_count(), 1);

        // a different logical type on the same pair is a separate edge
        store.ensure_edge("a", "b", EdgeKind::ServiceBinding).unwrap();
        assert_eq!(store.edge_count(), 2);
    }

    #[test]
    fn test_ensure_edge_keeps_existing_metrics() {
        let store = TopologyStore::new();
        store.apply_flow_metrics("a", "b", |_| metrics(0.0)).unwrap();
        let id = store.ensure_edge("a", "b", EdgeKind::Connection).unwrap();
        assert!(store.get_edge(&id).unwrap().flow.is_some());
    }

    #[test]
    fn test_upsert_edge_is_idempotent() {
        let store = TopologyStore::new();
        let binding = || Edge::new("pod/default/a", "service/default/b", EdgeKind::ServiceBinding);
        let first = store.upsert_edge(binding()).unwrap();
        let second = store.upsert_edge(binding()).unwrap();

        assert_eq!(first.id, "pod/default/a->service/default/b#service_binding");
        assert_eq!(first.id, second.id);
        assert_eq!(store.edge_count(), 1);

        // a different kind for the same pair is a separate edge
        let connection = Edge::new("pod/default/a", "service/default/b", EdgeKind::Connection);
        store.upsert_edge(connection).unwrap();
        assert_eq!(store.edge_count(), 2);
    }

    #[test]
    fn test_upsert_edge_replaces_but_keeps_unset_metrics() {
        let store = TopologyStore::new();
        let mut edge = Edge::new("pod/default/a", "pod/default/b", EdgeKind::Connection);
        edge.flow = Some(metrics(0.12));
        edge.latency_ms = Some(4.5);
        edge.packet_loss = Some(0.01);
        assert_eq!(store.upsert_edge(edge).unwrap().health, HealthStatus::Failed);

        let stored = store
            .upsert_edge(Edge::new("pod/default/a", "pod/default/b", EdgeKind::Connection))
            .unwrap();
        assert_eq!(stored.flow.as_ref().map(|f| f.error_rate), Some(0.12));
        assert_eq!(stored.latency_ms, Some(4.5));
        // fields without carry-over are replaced
        assert_eq!(stored.packet_loss, None);
        assert_eq!(stored.health, HealthStatus::Failed);

        let mut replacement = Edge::new("pod/default/a", "pod/default/b", EdgeKind::Connection);
        replacement.flow = Some(metrics(0.0));
        let stored = store.upsert_edge(replacement).unwrap();
        assert_eq!(stored.health, HealthStatus::Healthy);
        assert_eq!(stored.health_source, HealthSource::Derived);
        assert_eq!(store.get_edge(&stored.id), Some(stored));
    }

    #[test]
    fn test_edges_from_and_to() {
        let store = TopologyStore::new();
        store.ensure_edge("a", "b", EdgeKind::Connection).unwrap();
        store.ensure_edge("a", "c", EdgeKind::Connection).unwrap();
        store.ensure_edge("c", "b", EdgeKind::Connection).unwrap();

        assert_eq!(store.edges_from("a").len(), 2);
        assert_eq!(store.edges_to("b").len(), 2);
        assert!(store.edges_from("b").is_empty());
    }

    #[test]
    fn test_returned_copies_are_independent() {
        let store = TopologyStore::new();
        store.upsert_node(pod("web", PodPhase::Running)).unwrap();

        let mut copy = store.get_node("pod/default/web").unwrap();
        copy.name = "changed".to_string();
        copy.health = HealthStatus::Failed;

        let stored = store.get_node("pod/default/web").unwrap();
        assert_eq!(stored.name, "web");
        assert_eq!(stored.health, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_override_until_next_upsert() {
        let store = TopologyStore::new();
        store.upsert_node(pod("web", PodPhase::Running)).unwrap();

        assert!(store.set_node_health("pod/default/web", HealthStatus::Failed));
        let node = store.get_node("pod/default/web").unwrap();
        assert_eq!(node.health, HealthStatus::Failed);
        assert_eq!(node.health_source, HealthSource::Override);

        store.upsert_node(pod("web", PodPhase::Running)).unwrap();
        let node = store.get_node("pod/default/web").unwrap();
        assert_eq!(node.health, HealthStatus::Healthy);
        assert_eq!(node.health_source, HealthSource::Derived);

        assert!(!store.set_node_health("pod/default/missing", HealthStatus::Failed));
    }

    #[test]
    fn test_edge_override_records_latency() {
        let store = TopologyStore::new();
        let id = store.ensure_edge("a", "b", EdgeKind::Connection).unwrap();
        assert!(store.set_edge_health(&id, HealthStatus::Degraded, Some(42.5)));

        let edge = store.get_edge(&id).unwrap();
        assert_eq!(edge.health, HealthStatus::Degraded);
        assert_eq!(edge.health_source, HealthSource::Override);
        assert_eq!(edge.latency_ms, Some(42.5));

        // next flow update derives health again
        store.apply_flow_metrics("a", "b", |_| metrics(0.0)).unwrap();
        let edge = store.get_edge(&id).unwrap();
        assert_eq!(edge.health, HealthStatus::Healthy);
        assert_eq!(edge.health_source, HealthSource::Derived);
    }

    #[test]
    fn test_flow_metrics_drive_edge_health() {
        let store = TopologyStore::new();
        let edge = store.apply_flow_metrics("a", "b", |_| metrics(0.12)).unwrap();
        assert_eq!(edge.health, HealthStatus::Failed);

        let edge = store.apply_flow_metrics("a", "b", |_| metrics(0.02)).unwrap();
        assert_eq!(edge.health, HealthStatus::Healthy);
        assert_eq!(store.edge_count(), 1);
    }

    #[test]
    fn test_sweep_inactive_marks_stale_flows() {
        let store = TopologyStore::new();
        store.apply_flow_metrics("a", "b", |_| metrics(0.0)).unwrap();

        let swept = store.sweep_inactive(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(swept, 1);
        let edge = store.get_edge("a->b").unwrap();
        assert!(!edge.is_flow_active());
        // health is left at its prior value
        assert_eq!(edge.health, HealthStatus::Healthy);

        assert_eq!(store.sweep_inactive(Utc::now()), 0);
    }

    #[test]
    fn test_snapshot_flags_dangling_edges_unknown() {
        let store = TopologyStore::new();
        let a = store.upsert_node(pod("a", PodPhase::Running)).unwrap();
        let b = store.upsert_node(pod("b", PodPhase::Running)).unwrap();
        store.apply_flow_metrics(&a.id, &b.id, |_| metrics(0.0)).unwrap();
        store
            .apply_flow_metrics(&a.id, "pod/default/gone", |_| metrics(0.0))
            .unwrap();

        let snapshot = store.snapshot();
        let linked = snapshot.edges.iter().find(|e| e.target == b.id).unwrap();
        let dangling = snapshot
            .edges
            .iter()
            .find(|e| e.target == "pod/default/gone")
            .unwrap();
        assert_eq!(linked.health, HealthStatus::Healthy);
        assert_eq!(dangling.health, HealthStatus::Unknown);

        // the stored edge keeps its derived health
        let stored = store.get_edge(&dangling.id).unwrap();
        assert_eq!(stored.health, HealthStatus::Healthy);
    }

    #[test]
    fn test_reset_then_snapshot_is_empty() {
        let store = TopologyStore::new();
        store.upsert_node(pod("web", PodPhase::Running)).unwrap();
        store
            .upsert_node(Node::new(
                "8.8.8.8",
                None,
                NodeState::External(ExternalState::default()),
            ))
            .unwrap();
        store.ensure_edge("a", "b", EdgeKind::Connection).unwrap();

        store.reset();
        let snapshot = store.snapshot();
        assert!(snapshot.nodes.is_empty());
        assert!(snapshot.edges.is_empty());
    }

    #[test]
    fn test_concurrent_upserts_never_expose_partial_entities() {
        let store = Arc::new(TopologyStore::new());
        let mut handles = Vec::new();

        for writer in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let name = format!("node-{}", i % 20);
                    let state = NodeState::ClusterNode(ClusterNodeState {
                        ready: if (i + writer) % 2 == 0 {
                            ConditionStatus::True
                        } else {
                            ConditionStatus::False
                        },
                        ..Default::default()
                    });
                    let node = Node::new(name, None, state)
                        .with_label("writer", writer.to_string());
                    store.upsert_node(node).unwrap();
                    let source = format!("cluster_node/node-{}", i % 20);
                    store
                        .ensure_edge(&source, "external/lb", EdgeKind::Connection)
                        .unwrap();
                }
            }));
        }

        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = store.snapshot();
                    for node in &snapshot.nodes {
                        assert!(!node.id.is_empty());
                        assert!(!node.name.is_empty());
                        assert_eq!(node.id, format!("cluster_node/{}", node.name));
                        assert!(node.labels.contains_key("writer"));
                        assert_ne!(node.health, HealthStatus::Unknown);
                    }
                    for edge in &snapshot.edges {
                        assert_eq!(edge.id, format!("{}->{}", edge.source, edge.target));
                    }
                }
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.nodes.len(), 20);
        assert_eq!(snapshot.edges.len(), 20);
    }
}
