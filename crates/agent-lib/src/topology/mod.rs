//! Live model of the cluster topology
//!
//! This module provides:
//! - The concurrent node/edge registry shared by all producers
//! - Per-kind health derivation for nodes and flow-based edge health

mod derive;
mod store;

pub use derive::{
    derive_edge_health, DeriveHealth, EDGE_DEGRADED_ERROR_RATE, EDGE_FAILED_ERROR_RATE,
};
pub use store::TopologyStore;
