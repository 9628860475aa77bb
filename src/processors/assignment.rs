//! Per-cluster totals and propagation of street clusters to addresses.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::streets::ClusteredStreet;
use crate::config::BalanceMetric;
use crate::core::loaders::AddressRecord;

/// Errors raised while propagating clusters to addresses.
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("street '{street}' has no cluster assignment")]
    Unassigned { street: String },
}

/// Result type for assignment propagation.
pub type Result<T> = std::result::Result<T, AssignmentError>;

/// Summed count and length of one cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTotals {
    pub count: u64,
    pub length: u64,
}

impl ClusterTotals {
    pub fn metric(&self, metric: BalanceMetric) -> u64 {
        match metric {
            BalanceMetric::Count => self.count,
            BalanceMetric::Length => self.length,
        }
    }
}

/// Totals keyed by cluster id, every id in `0..k` present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterStats(BTreeMap<usize, ClusterTotals>);

impl ClusterStats {
    pub fn get(&self, cluster: usize) -> Option<&ClusterTotals> {
        self.0.get(&cluster)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClusterTotals)> {
        self.0.iter().map(|(&id, totals)| (id, totals))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum over all clusters.
    pub fn total(&self) -> ClusterTotals {
        self.0.values().fold(ClusterTotals::default(), |acc, t| ClusterTotals {
            count: acc.count + t.count,
            length: acc.length + t.length,
        })
    }

    /// Largest relative deviation of a cluster's `metric` from the even
    /// split. Zero for an empty or all-zero table.
    pub fn max_deviation(&self, metric: BalanceMetric) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        let ideal = self.total().metric(metric) as f64 / self.0.len() as f64;
        if ideal == 0.0 {
            return 0.0;
        }
        self.0
            .values()
            .map(|t| (t.metric(metric) as f64 - ideal).abs() / ideal)
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(id, t)| format!("#{} count={} length={}", id, t.count, t.length))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Sum count and length per cluster over non-replicated streets.
///
/// All ids in `0..k` are present, zero-filled when a cluster got no street.
pub fn cluster_stats(streets: &[ClusteredStreet], k: usize) -> ClusterStats {
    let mut totals: BTreeMap<usize, ClusterTotals> =
        (0..k).map(|id| (id, ClusterTotals::default())).collect();
    for street in streets {
        let entry = totals.entry(street.cluster).or_default();
        entry.count += street.summary.count;
        entry.length += street.summary.length;
    }
    ClusterStats(totals)
}

/// Street name to cluster id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterAssignment(BTreeMap<String, usize>);

impl ClusterAssignment {
    pub fn from_streets(streets: &[ClusteredStreet]) -> Self {
        Self(
            streets
                .iter()
                .map(|s| (s.summary.street.clone(), s.cluster))
                .collect(),
        )
    }

    pub fn cluster_of(&self, street: &str) -> Option<usize> {
        self.0.get(street).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An input address with the cluster of its street.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedAddress {
    #[serde(flatten)]
    pub record: AddressRecord,
    pub cluster: usize,
}

/// Attach the cluster of each record's street, preserving row order.
///
/// # Errors
///
/// `Unassigned` if a record's street is missing from `assignment`.
pub fn propagate(records: &[AddressRecord], assignment: &ClusterAssignment) -> Result<Vec<AnnotatedAddress>> {
    records
        .iter()
        .map(|record| {
            let cluster = assignment
                .cluster_of(&record.street)
                .ok_or_else(|| AssignmentError::Unassigned {
                    street: record.street.clone(),
                })?;
            Ok(AnnotatedAddress {
                record: record.clone(),
                cluster,
            })
        })
        .collect()
}
