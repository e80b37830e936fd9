//! Structural metrics of a single connectivity matrix.
//!
//! [`MetricsEngine::analyze`] is a pure function of one matrix. The diagonal
//! (self-connections) never contributes to a metric.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::matrix::ConnectivityMatrix;

/// Density thresholds used when none are configured.
pub const DEFAULT_DENSITY_THRESHOLDS: [f64; 3] = [0.0001, 0.0005, 0.001];

/// Separator between source and target in directed pair names.
pub const PAIR_ARROW: &str = "→";

/// Net direction of a channel's influence.
///
/// The declaration order (sender, receiver, neutral) is also the tie-break
/// order when picking the most frequent category across recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Sender,
    Receiver,
    Neutral,
}

impl NodeCategory {
    pub const ALL: [NodeCategory; 3] = [Self::Sender, Self::Receiver, Self::Neutral];

    /// Classification by the exact sign of the causal flow.
    pub fn from_flow(causal_flow: f64) -> Self {
        if causal_flow > 0.0 {
            Self::Sender
        } else if causal_flow < 0.0 {
            Self::Receiver
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodalMetric {
    pub channel: String,
    pub in_strength: f64,
    pub out_strength: f64,
    pub causal_flow: f64,
    pub category: NodeCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectedPair {
    pub source: String,
    pub target: String,
    pub value: f64,
}

impl DirectedPair {
    /// `"source→target"`.
    pub fn name(&self) -> String {
        format!("{}{PAIR_ARROW}{}", self.source, self.target)
    }
}

/// Asymmetry of an unordered pair, oriented so that positive means `first`
/// dominates. `first` precedes `second` in channel order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsymmetryIndex {
    pub first: String,
    pub second: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PairwiseMetrics {
    /// Every ordered pair `s ≠ t`, row-major in channel order.
    pub directional: Vec<DirectedPair>,
    /// One entry per unordered pair.
    pub asymmetry: Vec<AsymmetryIndex>,
}

impl PairwiseMetrics {
    pub fn directional_value(&self, source: &str, target: &str) -> Option<f64> {
        self.directional
            .iter()
            .find(|p| p.source == source && p.target == target)
            .map(|p| p.value)
    }

    /// Signed asymmetry from `source`'s point of view, either orientation.
    pub fn asymmetry_between(&self, source: &str, target: &str) -> Option<f64> {
        self.asymmetry.iter().find_map(|a| {
            if a.first == source && a.second == target {
                Some(a.value)
            } else if a.first == target && a.second == source {
                Some(-a.value)
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityAtThreshold {
    pub threshold: f64,
    pub density: f64,
}

impl DensityAtThreshold {
    pub fn metric_name(&self) -> String {
        format!("network_density_th{}", self.threshold)
    }
}

/// Strength statistics over off-diagonal cells plus density per threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_strength: f64,
    pub mean_strength: f64,
    pub median_strength: f64,
    pub max_strength: f64,
    pub min_strength: f64,
    /// Population standard deviation.
    pub std_strength: f64,
    pub density: Vec<DensityAtThreshold>,
}

impl GlobalMetrics {
    /// `(name, value)` in a fixed order: the six strength statistics, then
    /// densities in threshold order.
    pub fn named_values(&self) -> Vec<(String, f64)> {
        let mut out = vec![
            ("global_gc_strength".to_string(), self.total_strength),
            ("mean_gc_strength".to_string(), self.mean_strength),
            ("median_gc_strength".to_string(), self.median_strength),
            ("max_gc_strength".to_string(), self.max_strength),
            ("min_gc_strength".to_string(), self.min_strength),
            ("std_gc_strength".to_string(), self.std_strength),
        ];
        out.extend(self.density.iter().map(|d| (d.metric_name(), d.density)));
        out
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.named_values()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// Everything computed for one matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixMetrics {
    pub pairwise: PairwiseMetrics,
    pub nodal: Vec<NodalMetric>,
    pub global: GlobalMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsEngine {
    thresholds: Vec<f64>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_DENSITY_THRESHOLDS.to_vec())
    }
}

impl MetricsEngine {
    /// Density is reported for each threshold in the given order.
    pub fn new(thresholds: Vec<f64>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    pub fn analyze(&self, m: &ConnectivityMatrix) -> MatrixMetrics {
        MatrixMetrics {
            pairwise: pairwise_metrics(m),
            nodal: nodal_metrics(m),
            global: global_metrics(m, &self.thresholds),
        }
    }
}

/// `(a - b) / (a + b)` when the sum is positive, else 0.
pub fn asymmetry_index(forward: f64, backward: f64) -> f64 {
    let sum = forward + backward;
    if sum > 0.0 {
        (forward - backward) / sum
    } else {
        0.0
    }
}

pub fn pairwise_metrics(m: &ConnectivityMatrix) -> PairwiseMetrics {
    let ch = m.channels();
    let directional = m
        .off_diagonal()
        .map(|(i, j, value)| DirectedPair {
            source: ch[i].clone(),
            target: ch[j].clone(),
            value,
        })
        .collect();
    let mut asymmetry = Vec::new();
    for i in 0..m.size() {
        for j in (i + 1)..m.size() {
            asymmetry.push(AsymmetryIndex {
                first: ch[i].clone(),
                second: ch[j].clone(),
                value: asymmetry_index(m.get(i, j), m.get(j, i)),
            });
        }
    }
    PairwiseMetrics {
        directional,
        asymmetry,
    }
}

pub fn nodal_metrics(m: &ConnectivityMatrix) -> Vec<NodalMetric> {
    let n = m.size();
    (0..n)
        .map(|k| {
            let out_strength: f64 = (0..n).filter(|&j| j != k).map(|j| m.get(k, j)).sum();
            let in_strength: f64 = (0..n).filter(|&i| i != k).map(|i| m.get(i, k)).sum();
            let causal_flow = out_strength - in_strength;
            NodalMetric {
                channel: m.channels()[k].clone(),
                in_strength,
                out_strength,
                causal_flow,
                category: NodeCategory::from_flow(causal_flow),
            }
        })
        .collect()
}

pub fn global_metrics(m: &ConnectivityMatrix, thresholds: &[f64]) -> GlobalMetrics {
    let mut values: Vec<f64> = m.off_diagonal().map(|(_, _, v)| v).collect();
    let count = values.len() as f64;
    let total_strength: f64 = values.iter().sum();
    let mean_strength = total_strength / count;
    let std_strength = population_std(&values, mean_strength);
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    let median_strength = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    };
    let max_possible = (m.size() * (m.size() - 1)) as f64;
    let density = thresholds
        .iter()
        .map(|&threshold| DensityAtThreshold {
            threshold,
            density: values.iter().filter(|&&v| v > threshold).count() as f64 / max_possible,
        })
        .collect();
    GlobalMetrics {
        total_strength,
        mean_strength,
        median_strength,
        max_strength: values[values.len() - 1],
        min_strength: values[0],
        std_strength,
        density,
    }
}

/// Population (ddof = 0) standard deviation around a known mean.
pub(crate) fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
