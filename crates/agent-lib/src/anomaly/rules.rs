//! Detection rules
//!
//! Each rule is an independent predicate plus severity function. Edge rules
//! are evaluated in order on every tick and all of them may fire for the
//! same edge; a new rule is a new `EdgeRule` impl appended to the list.

use std::collections::BTreeMap;

use super::baseline::{Baseline, MetricKind};
use super::event::{AnomalyKind, Severity};
use crate::flow::SourcePortActivity;
use crate::models::{Edge, FlowDirection, FlowMetrics};

/// What a rule sees for one edge on one tick
pub struct EdgeObservation<'a> {
    pub edge: &'a Edge,
    pub metrics: &'a FlowMetrics,
    /// Baseline of the rule's metric, as it stood before this tick
    pub baseline: &'a Baseline,
    /// Consecutive ticks (including this one) above the exfiltration rate
    pub exfil_streak: u32,
}

/// A rule's verdict
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
    pub values: BTreeMap<String, f64>,
}

pub trait EdgeRule: Send + Sync {
    fn kind(&self) -> AnomalyKind;

    /// Metric whose baseline must be warmed up before this rule may fire
    fn metric(&self) -> MetricKind;

    fn evaluate(&self, obs: &EdgeObservation<'_>) -> Option<Finding>;
}

fn values<const N: usize>(pairs: [(&str, f64); N]) -> BTreeMap<String, f64> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Current bytes/sec above `threshold` times the baseline mean
#[derive(Debug, Clone)]
pub struct TrafficSpikeRule {
    pub threshold: f64,
}

impl EdgeRule for TrafficSpikeRule {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::TrafficSpike
    }

    fn metric(&self) -> MetricKind {
        MetricKind::BytesPerSec
    }

    fn evaluate(&self, obs: &EdgeObservation<'_>) -> Option<Finding> {
        let mean = obs.baseline.mean;
        if mean < f64::EPSILON {
            return None;
        }

        let current = obs.metrics.bytes_per_sec;
        let ratio = current / mean;
        if ratio <= self.threshold {
            return None;
        }

        let description = format!(
            "Traffic spike on {}: {:.1} B/s is {:.1}x the baseline of {:.1} B/s",
            obs.edge.id, current, ratio, mean
        );
        let mut fields = values([
            ("bytes_per_sec", current),
            ("baseline_mean", mean),
            ("baseline_std_dev", obs.baseline.std_dev),
            ("ratio", ratio),
            ("threshold", self.threshold),
        ]);
        // undefined for a flat baseline
        if let Some(z) = obs.baseline.z_score(current) {
            fields.insert("z_score".to_string(), z);
        }

        Some(Finding {
            severity: Severity::from_exceedance(ratio / self.threshold),
            description,
            values: fields,
        })
    }
}

/// Error rate above a fixed fraction
#[derive(Debug, Clone)]
pub struct HighErrorRateRule {
    pub threshold: f64,
}

impl EdgeRule for HighErrorRateRule {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::HighErrorRate
    }

    fn metric(&self) -> MetricKind {
        MetricKind::ErrorRate
    }

    fn evaluate(&self, obs: &EdgeObservation<'_>) -> Option<Finding> {
        let rate = obs.metrics.error_rate;
        if rate <= self.threshold || self.threshold <= 0.0 {
            return None;
        }

        Some(Finding {
            severity: Severity::from_exceedance(rate / self.threshold),
            description: format!(
                "High error rate on {}: {:.1}% of packets failing (threshold {:.1}%)",
                obs.edge.id,
                rate * 100.0,
                self.threshold * 100.0
            ),
            values: values([
                ("error_rate", rate),
                ("baseline_mean", obs.baseline.mean),
                ("threshold", self.threshold),
            ]),
        })
    }
}

/// Sustained egress rate above an absolute limit
#[derive(Debug, Clone)]
pub struct DataExfiltrationRule {
    /// Bytes per second
    pub threshold: f64,
    /// Consecutive ticks the rate must stay above the threshold
    pub sustain_ticks: u32,
}

impl DataExfiltrationRule {
    /// Whether the current metrics count toward the sustain streak
    pub fn exceeds(&self, metrics: &FlowMetrics) -> bool {
        metrics.direction == FlowDirection::Egress && metrics.bytes_per_sec > self.threshold
    }
}

impl EdgeRule for DataExfiltrationRule {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::DataExfiltration
    }

    fn metric(&self) -> MetricKind {
        MetricKind::BytesPerSec
    }

    fn evaluate(&self, obs: &EdgeObservation<'_>) -> Option<Finding> {
        if !self.exceeds(obs.metrics) || obs.exfil_streak < self.sustain_ticks.max(1) {
            return None;
        }

        let rate = obs.metrics.bytes_per_sec;
        let severity = Severity::from_exceedance(rate / self.threshold).max(Severity::High);
        Some(Finding {
            severity,
            description: format!(
                "Possible data exfiltration on {}: {:.2} MB/s egress for {} consecutive ticks",
                obs.edge.id,
                rate / (1024.0 * 1024.0),
                obs.exfil_streak
            ),
            values: values([
                ("bytes_per_sec", rate),
                ("threshold", self.threshold),
                ("sustained_ticks", obs.exfil_streak as f64),
            ]),
        })
    }
}

/// One source reaching many distinct destination ports within the window
#[derive(Debug, Clone)]
pub struct PortScanRule {
    pub threshold: usize,
}

impl PortScanRule {
    pub fn evaluate(&self, activity: &SourcePortActivity) -> Option<Finding> {
        if self.threshold == 0 || activity.distinct_ports < self.threshold {
            return None;
        }

        let ratio = activity.distinct_ports as f64 / self.threshold as f64;
        Some(Finding {
            severity: Severity::from_exceedance(ratio).max(Severity::Medium),
            description: format!(
                "Port scan from {}: {} distinct destination ports ({}-{}) within the window",
                activity.source,
                activity.distinct_ports,
                activity.port_range.0,
                activity.port_range.1
            ),
            values: values([
                ("distinct_ports", activity.distinct_ports as f64),
                ("threshold", self.threshold as f64),
                ("port_min", activity.port_range.0 as f64),
                ("port_max", activity.port_range.1 as f64),
            ]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EdgeKind;
    use chrono::Utc;

    fn metrics(bytes_per_sec: f64, error_rate: f64, direction: FlowDirection) -> FlowMetrics {
        FlowMetrics {
            bytes_per_sec,
            packets_per_sec: 1.0,
            active_connections: 1,
            error_rate,
            protocol: "tcp".to_string(),
            last_seen: Utc::now(),
            is_active: true,
            direction,
        }
    }

    fn baseline_at(mean: f64) -> Baseline {
        let mut baseline = Baseline::default();
        for _ in 0..10 {
            baseline.add_sample(mean);
        }
        baseline
    }

    #[test]
    fn test_spike_threshold_boundary() {
        let edge = Edge::new("a", "b", EdgeKind::Connection);
        let baseline = baseline_at(100.0);
        let rule = TrafficSpikeRule { threshold: 3.0 };

        let spike = metrics(350.0, 0.0, FlowDirection::Bidirectional);
        let finding = rule
            .evaluate(&EdgeObservation {
                edge: &edge,
                metrics: &spike,
                baseline: &baseline,
                exfil_streak: 0,
            })
            .unwrap();
        assert_eq!(finding.values["ratio"], 3.5);

        let calm = metrics(250.0, 0.0, FlowDirection::Bidirectional);
        assert!(rule
            .evaluate(&EdgeObservation {
                edge: &edge,
                metrics: &calm,
                baseline: &baseline,
                exfil_streak: 0,
            })
            .is_none());
    }

    #[test]
    fn test_spike_reports_z_score_when_baseline_varies() {
        let edge = Edge::new("a", "b", EdgeKind::Connection);
        let rule = TrafficSpikeRule { threshold: 3.0 };
        let spike = metrics(350.0, 0.0, FlowDirection::Bidirectional);

        let mut varied = Baseline::default();
        for i in 0..10 {
            varied.add_sample(if i % 2 == 0 { 90.0 } else { 110.0 });
        }
        let finding = rule
            .evaluate(&EdgeObservation {
                edge: &edge,
                metrics: &spike,
                baseline: &varied,
                exfil_streak: 0,
            })
            .unwrap();
        assert!(finding.values["z_score"] > 20.0);

        let flat = baseline_at(100.0);
        let finding = rule
            .evaluate(&EdgeObservation {
                edge: &edge,
                metrics: &spike,
                baseline: &flat,
                exfil_streak: 0,
            })
            .unwrap();
        assert!(!finding.values.contains_key("z_score"));
    }

    #[test]
    fn test_spike_severity_grows_with_ratio() {
        let edge = Edge::new("a", "b", EdgeKind::Connection);
        let baseline = baseline_at(100.0);
        let rule = TrafficSpikeRule { threshold: 3.0 };

        let severity = |bytes: f64| {
            let m = metrics(bytes, 0.0, FlowDirection::Bidirectional);
            rule.evaluate(&EdgeObservation {
                edge: &edge,
                metrics: &m,
                baseline: &baseline,
                exfil_streak: 0,
            })
            .unwrap()
            .severity
        };
        assert_eq!(severity(350.0), Severity::Low);
        assert_eq!(severity(500.0), Severity::Medium);
        assert_eq!(severity(700.0), Severity::High);
        assert_eq!(severity(1_000.0), Severity::Critical);
    }

    #[test]
    fn test_exfiltration_needs_egress_and_streak() {
        let edge = Edge::new("pod/ns/a", "external/x", EdgeKind::Connection);
        let baseline = baseline_at(20.0 * 1024.0 * 1024.0);
        let rule = DataExfiltrationRule {
            threshold: 10.0 * 1024.0 * 1024.0,
            sustain_ticks: 3,
        };

        let egress = metrics(20.0 * 1024.0 * 1024.0, 0.0, FlowDirection::Egress);
        let obs = |m: &FlowMetrics, streak| {
            rule.evaluate(&EdgeObservation {
                edge: &edge,
                metrics: m,
                baseline: &baseline,
                exfil_streak: streak,
            })
        };
        assert!(obs(&egress, 2).is_none());
        let finding = obs(&egress, 3).unwrap();
        assert_eq!(finding.severity, Severity::High);

        let internal = metrics(20.0 * 1024.0 * 1024.0, 0.0, FlowDirection::Bidirectional);
        assert!(obs(&internal, 5).is_none());
    }

    #[test]
    fn test_port_scan_threshold() {
        let rule = PortScanRule { threshold: 20 };
        let activity = |ports| SourcePortActivity {
            source: "pod/ns/scanner".to_string(),
            distinct_ports: ports,
            port_range: (1, ports as u16),
        };

        assert!(rule.evaluate(&activity(19)).is_none());
        let finding = rule.evaluate(&activity(25)).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.values["distinct_ports"], 25.0);
    }
}
