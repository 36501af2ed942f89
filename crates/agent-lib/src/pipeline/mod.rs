//! Producer ingestion and periodic detection
//!
//! This module provides:
//! - Bounded, never-blocking ingest channels, one loop per producer
//! - The timer-driven sweep-and-detect loop
//! - Cooperative shutdown for both via a broadcast signal

mod detection;
mod ingest;


pub use detection::{DetectionConfig, DetectionLoop, TickReport};
pub use ingest::{ingest_channel, IngestEvent, IngestSender, IngestStats, IngestionLoop};
