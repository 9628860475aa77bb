//! Balance duplication transform.
//!
//! Balancing the *sum* of a street metric across clusters is the same as
//! balancing the *number* of points per cluster once every street is
//! replicated as many times as its metric value. This module produces the
//! replicated point set and the per-cluster size bounds derived from the
//! tolerance.
//!
//! Replicas of a street are interchangeable (same position, same street),
//! so the set is stored run-length encoded: one run per street with its
//! copy count. `iter()` expands it into individual replicas.
//!
//! Street metrics are whole numbers (`u64`) from aggregation onwards, so
//! copy counts are the metric values themselves.

use serde::Serialize;

use super::streets::StreetSummary;
use crate::config::BalanceMetric;

/// One replicated point, carrying the index of its street.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Replica {
    pub street: usize,
    pub position: [f64; 2],
}

/// All replicas of one street.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicaRun {
    pub street: usize,
    pub position: [f64; 2],
    pub copies: u64,
}

/// Replicated point set, indexed by street.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicatedPoints {
    positions: Vec<[f64; 2]>,
    copies: Vec<u64>,
    total: u64,
}

impl ReplicatedPoints {
    fn from_counts(streets: &[StreetSummary], copies: Vec<u64>) -> Self {
        debug_assert_eq!(streets.len(), copies.len());
        let total = copies.iter().sum();
        Self {
            positions: streets.iter().map(StreetSummary::position).collect(),
            copies,
            total,
        }
    }

    /// Total number of replicas.
    #[inline]
    pub fn len(&self) -> u64 {
        self.total
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of source streets, including those with zero copies.
    #[inline]
    pub fn num_streets(&self) -> usize {
        self.copies.len()
    }

    /// Copy count of street `i`.
    #[inline]
    pub fn copies(&self, street: usize) -> u64 {
        self.copies[street]
    }

    #[inline]
    pub fn position(&self, street: usize) -> [f64; 2] {
        self.positions[street]
    }

    /// Runs of streets with at least one replica, in street order.
    pub fn runs(&self) -> impl Iterator<Item = ReplicaRun> + '_ {
        (0..self.copies.len())
            .filter(move |&i| self.copies[i] > 0)
            .map(move |i| ReplicaRun {
                street: i,
                position: self.positions[i],
                copies: self.copies[i],
            })
    }

    /// Every replica, street by street.
    pub fn iter(&self) -> impl Iterator<Item = Replica> + '_ {
        self.runs().flat_map(|run| {
            (0..run.copies).map(move |_| Replica {
                street: run.street,
                position: run.position,
            })
        })
    }
}

/// Per-cluster population bounds for the constrained engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizeBounds {
    pub points: u64,
    pub clusters: usize,
    pub ideal: f64,
    pub min: u64,
    pub max: u64,
}

impl SizeBounds {
    /// `min = floor(ideal * (1 - tolerance))`, `max = floor(ideal * (1 + tolerance))`
    /// with `ideal = points / clusters`.
    pub fn new(points: u64, clusters: usize, tolerance: f64) -> Self {
        let ideal = if clusters == 0 {
            0.0
        } else {
            points as f64 / clusters as f64
        };
        Self {
            points,
            clusters,
            ideal,
            min: (ideal * (1.0 - tolerance)).floor().max(0.0) as u64,
            max: (ideal * (1.0 + tolerance)).floor().max(0.0) as u64,
        }
    }

    /// Whether `clusters` groups within `[min, max]` can hold exactly `points`.
    pub fn is_feasible(&self) -> bool {
        let k = self.clusters as u64;
        self.min.saturating_mul(k) <= self.points && self.max.saturating_mul(k) >= self.points
    }

    #[inline]
    pub fn contains(&self, size: u64) -> bool {
        self.min <= size && size <= self.max
    }
}

/// Replicate every street `metric` times.
pub fn replicate(streets: &[StreetSummary], metric: BalanceMetric) -> ReplicatedPoints {
    let copies = streets.iter().map(|s| s.metric(metric)).collect();
    let points = ReplicatedPoints::from_counts(streets, copies);
    log::debug!(
        "Replicated {} streets into {} points by {}",
        streets.len(),
        points.len(),
        metric
    );
    points
}
