//! Producer ingestion
//!
//! Each producer (resource watcher, flow stream, connectivity prober) gets
//! its own bounded channel and its own `IngestionLoop` task. Submitting never
//! blocks: when the channel is full the event is dropped and counted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::flow::FlowAggregator;
use crate::health::{components, HealthRegistry};
use crate::models::{EdgeKind, FlowRecord, HealthStatus, Node};
use crate::observability::{AgentMetrics, StructuredLogger};

/// A single mutation pushed by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    /// Node/pod/service/policy record from resource discovery
    Node(Node),
    /// Relationship observed by discovery (service endpoints, policies)
    Edge {
        source: String,
        target: String,
        #[serde(default)]
        kind: EdgeKind,
    },
    /// Flow record from the telemetry stream
    Flow(FlowRecord),
    /// Connectivity probe result, applied as a health override
    Probe {
        edge_id: String,
        health: HealthStatus,
        #[serde(default)]
        latency_ms: Option<f64>,
    },
    /// Full resync: drop the whole topology and all flow history
    Reset,
}

/// Non-blocking producer handle
#[derive(Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<IngestEvent>,
    metrics: AgentMetrics,
}

impl IngestSender {
    /// Queue an event; returns false if it was dropped
    pub fn submit(&self, event: IngestEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_ingest_dropped();
                debug!("Ingest channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Ingest channel closed, dropping event");
                false
            }
        }
    }
}

/// Create a bounded ingest channel
pub fn ingest_channel(capacity: usize) -> (IngestSender, mpsc::Receiver<IngestEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        IngestSender {
            tx,
            metrics: AgentMetrics::new(),
        },
        rx,
    )
}

/// Counters for one ingestion loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    pub rejected: u64,
}

/// Applies one producer's events to the store and aggregator
pub struct IngestionLoop {
    producer: String,
    aggregator: Arc<FlowAggregator>,
    rx: mpsc::Receiver<IngestEvent>,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
    stats: IngestStats,
}

impl IngestionLoop {
    pub fn new(
        producer: impl Into<String>,
        aggregator: Arc<FlowAggregator>,
        rx: mpsc::Receiver<IngestEvent>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            producer: producer.into(),
            aggregator,
            rx,
            logger,
            health: None,
            stats: IngestStats::default(),
        }
    }

    /// Mark ingestion unhealthy when the producer side goes away
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Apply a single event in full
    pub fn apply(&self, event: IngestEvent) -> Result<(), ValidationError> {
        let store = self.aggregator.store();
        match event {
            IngestEvent::Node(node) => store.upsert_node(node).map(|_| ()),
            IngestEvent::Edge {
                source,
                target,
                kind,
            } => store.ensure_edge(&source, &target, kind).map(|_| ()),
            IngestEvent::Flow(record) => self.aggregator.record_flow(record).map(|_| ()),
            IngestEvent::Probe {
                edge_id,
                health,
                latency_ms,
            } => {
                if !store.set_edge_health(&edge_id, health, latency_ms) {
                    debug!(edge_id = %edge_id, "Probe result for unknown edge ignored");
                }
                Ok(())
            }
            IngestEvent::Reset => {
                self.aggregator.reset();
                Ok(())
            }
        }
    }

    /// Consume events until the channel closes or shutdown is signalled
    ///
    /// The shutdown check comes first on every iteration, so a stop signal is
    /// honoured before the next event is taken; an event already taken is
    /// always applied in full.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> IngestStats {
        info!(producer = %self.producer, "Starting ingestion loop");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(producer = %self.producer, "Shutting down ingestion loop");
                    break;
                }
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        warn!(producer = %self.producer, "Ingest channel closed");
                        if let Some(health) = &self.health {
                            health
                                .set_unhealthy(
                                    components::INGESTION,
                                    format!("{} ingest channel closed", self.producer),
                                )
                                .await;
                        }
                        break;
                    }
                }
            }
        }

        self.stats
    }

    fn handle(&mut self, event: IngestEvent) {
        match self.apply(event) {
            Ok(()) => self.stats.applied += 1,
            Err(e) => {
                self.stats.rejected += 1;
                self.logger
                    .log_rejected_input(&self.producer, e.entity(), &e.to_string());
            }
        }
    }
}
