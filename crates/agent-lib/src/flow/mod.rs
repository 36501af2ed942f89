//! Flow telemetry aggregation
//!
//! This module provides:
//! - Per-edge rate metrics folded from streaming flow records
//! - A bounded drop-oldest ring of recent flow records
//! - Inactivity sweeps and per-source port activity for scan detection

mod aggregator;
mod ring;

pub use aggregator::{
    AggregatorConfig, FlowAggregator, SourcePortActivity, SweepReport, MAX_WINDOW_SECS,
};
pub use ring::{FlowRingBuffer, RingStats, DEFAULT_RING_CAPACITY};
