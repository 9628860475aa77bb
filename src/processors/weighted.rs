//! Weighted k-means over street centroids.
//!
//! Each street is one point whose pull on its centre is its metric value,
//! or 1 for plain `kmeans`. Balance across clusters is only a side effect
//! of the weighting; nothing bounds cluster sizes. When every street has
//! a zero metric, streets are weighted uniformly instead.

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use super::assignment::{cluster_stats, ClusterStats};
use super::kmeans::{center_shift, init_centers, nearest, scaled_tolerance, CentroidAccumulator};
use super::streets::{ClusteredStreet, StreetSummary};
use super::warnings::PipelineWarning;
use crate::config::{BalanceMetric, CircuitConfig};
use crate::core::transforms::squared_distance;

/// Errors raised by the weighted engine.
#[derive(Debug, Error)]
pub enum WeightedError {
    #[error("cluster count must be at least 1")]
    NoClusters,
}

/// Result type for the weighted engine.
pub type Result<T> = std::result::Result<T, WeightedError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedParams {
    pub clusters: usize,
    pub seed: u64,
    pub max_iter: usize,
    pub tol: f64,
}

impl From<&CircuitConfig> for WeightedParams {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            clusters: config.n_circuits,
            seed: config.seed,
            max_iter: config.max_iter,
            tol: config.tol,
        }
    }
}

/// Output of the weighted engine.
#[derive(Debug, Clone, Serialize)]
pub struct WeightedOutcome {
    pub streets: Vec<ClusteredStreet>,
    pub stats: ClusterStats,
    pub centers: Vec<[f64; 2]>,
    pub inertia: f64,
    pub iterations: usize,
    pub warnings: Vec<PipelineWarning>,
}

/// Give every empty cluster the point farthest from its current centre,
/// taken from a cluster that keeps at least one member.
fn relocate_empty(labels: &mut [usize], points: &[[f64; 2]], centers: &[[f64; 2]]) -> usize {
    let mut members = vec![0usize; centers.len()];
    for &label in labels.iter() {
        members[label] += 1;
    }

    let mut moved = 0;
    for target in 0..centers.len() {
        if members[target] > 0 {
            continue;
        }
        let farthest = (0..labels.len())
            .filter(|&i| members[labels[i]] > 1)
            .map(|i| (i, squared_distance(points[i], centers[labels[i]])))
            .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
                Some((_, bd)) if bd >= d => best,
                _ => Some((i, d)),
            });
        if let Some((i, _)) = farthest {
            members[labels[i]] -= 1;
            members[target] += 1;
            labels[i] = target;
            moved += 1;
        }
    }
    moved
}

/// Cluster streets into `params.clusters` groups, weighting each street by
/// `metric` (or uniformly when `None`).
///
/// Single k-means++ initialisation from `params.seed`, then Lloyd
/// iterations until labels stop changing, the centre shift drops under
/// the scaled tolerance, or `max_iter` is reached. When there are at least
/// `k` streets every cluster ends up non-empty.
pub fn weighted_spatial_clustering(
    streets: &[StreetSummary],
    metric: Option<BalanceMetric>,
    params: &WeightedParams,
) -> Result<WeightedOutcome> {
    let k = params.clusters;
    if k == 0 {
        return Err(WeightedError::NoClusters);
    }

    let mut warnings = Vec::new();
    let points: Vec<[f64; 2]> = streets.iter().map(StreetSummary::position).collect();
    let weights: Vec<f64> = match metric {
        Some(m) if streets.iter().any(|s| s.metric(m) > 0) => {
            streets.iter().map(|s| s.metric(m) as f64).collect()
        }
        Some(m) => {
            if !streets.is_empty() {
                warnings.push(PipelineWarning::MetricAllZero { metric: m.to_string() }.logged());
            }
            vec![1.0; streets.len()]
        }
        None => vec![1.0; streets.len()],
    };

    match metric {
        Some(m) => log::info!("Starting k-means on {} streets weighted by {}", streets.len(), m),
        None => log::info!("Starting k-means on {} streets", streets.len()),
    }

    let threshold = scaled_tolerance(&points, &weights, params.tol);
    let mut rng = SmallRng::seed_from_u64(params.seed);
    let mut centers = init_centers(&points, &weights, k, &mut rng);
    centers.resize(k, [0.0; 2]);

    let mut labels: Vec<usize> = Vec::new();
    let mut iterations = 0;
    for _ in 0..params.max_iter {
        iterations += 1;

        let mut assigned: Vec<usize> = points.par_iter().map(|&p| nearest(p, &centers).0).collect();
        let moved = relocate_empty(&mut assigned, &points, &centers);
        if moved > 0 {
            log::debug!("Relocated {} points into empty clusters", moved);
        }

        let mut acc = CentroidAccumulator::new(k);
        for ((&label, &p), &w) in assigned.iter().zip(&points).zip(&weights) {
            acc.add(label, p, w);
        }
        let next = acc.centers(&centers);
        let shift = center_shift(&centers, &next);
        let stable = assigned == labels;

        labels = assigned;
        centers = next;

        if stable || shift <= threshold {
            break;
        }
    }

    let inertia = labels
        .iter()
        .zip(&points)
        .zip(&weights)
        .map(|((&label, &p), &w)| w * squared_distance(p, centers[label]))
        .sum();

    let clustered: Vec<ClusteredStreet> = streets
        .iter()
        .cloned()
        .zip(labels)
        .map(|(summary, cluster)| ClusteredStreet { summary, cluster })
        .collect();
    let stats = cluster_stats(&clustered, k);

    log::info!("k-means finished after {} iterations: {}", iterations, stats);

    Ok(WeightedOutcome {
        streets: clustered,
        stats,
        centers,
        inertia,
        iterations,
        warnings,
    })
}
