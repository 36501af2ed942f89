//! Periodic sweep-and-detect loop
//!
//! Each tick marks idle flows inactive, runs the anomaly detector over the
//! aggregator's window, publishes new events to subscribers and refreshes
//! the topology gauges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyDetector, AnomalyEvent};
use crate::flow::{FlowAggregator, SweepReport};
use crate::health::{components, HealthRegistry};
use crate::observability::{AgentMetrics, StructuredLogger};

/// Configuration for the detection loop
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Tick interval (default: 10 seconds)
    pub interval: Duration,
    /// Capacity of the broadcast channel for new anomaly events
    pub event_channel_size: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            event_channel_size: 256,
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sweep: SweepReport,
    pub events: Vec<AnomalyEvent>,
    pub elapsed: Duration,
}

/// Runs the detector on a fixed interval
pub struct DetectionLoop {
    aggregator: Arc<FlowAggregator>,
    detector: AnomalyDetector,
    config: DetectionConfig,
    events_tx: broadcast::Sender<AnomalyEvent>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl DetectionLoop {
    pub fn new(
        aggregator: Arc<FlowAggregator>,
        detector: AnomalyDetector,
        config: DetectionConfig,
        logger: StructuredLogger,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_channel_size.max(1));
        Self {
            aggregator,
            detector,
            config,
            events_tx,
            health: None,
            logger,
            metrics: AgentMetrics::new(),
        }
    }

    /// Report tick overruns to the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Receive anomaly events as they are detected
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.events_tx.subscribe()
    }

    /// Sweep, detect and publish once
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let start = Instant::now();

        let sweep = self.aggregator.sweep(now);
        let events = self.detector.detect_at(now);

        for event in &events {
            self.logger.log_anomaly(event);
            // no subscribers is fine; the log still has the event
            let _ = self.events_tx.send(event.clone());
        }

        let store = self.aggregator.store();
        self.metrics
            .set_topology_size(store.node_count() as i64, store.edge_count() as i64);
        self.metrics
            .set_active_flows(self.aggregator.active_flows().len() as i64);
        self.metrics
            .set_flow_buffer_items(self.aggregator.buffer_stats().entries as i64);

        let elapsed = start.elapsed();
        self.metrics.observe_detection_latency(elapsed.as_secs_f64());

        TickReport {
            sweep,
            events,
            elapsed,
        }
    }

    /// Tick until shutdown is signalled
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting anomaly detection loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut degraded = false;
        let mut tick_count = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down anomaly detection loop");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now());
                    tick_count += 1;

                    if tick_count % 6 == 0 || !report.events.is_empty() {
                        debug!(
                            anomalies = report.events.len(),
                            flows_deactivated = report.sweep.flows_deactivated,
                            elapsed_us = report.elapsed.as_micros() as u64,
                            "Detection tick complete"
                        );
                    }

                    let overran = report.elapsed > self.config.interval;
                    if overran != degraded {
                        degraded = overran;
                        self.report_overrun(overran, report.elapsed).await;
                    }
                }
            }
        }
    }

    async fn report_overrun(&self, overran: bool, elapsed: Duration) {
        let Some(health) = &self.health else {
            return;
        };
        if overran {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Detection tick exceeded its interval"
            );
            health
                .set_degraded(components::DETECTOR, "Detection tick exceeded interval")
                .await;
        } else {
            info!("Detection tick back within interval");
            health.set_healthy(components::DETECTOR).await;
        }
    }
}
