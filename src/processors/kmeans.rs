//! Building blocks shared by the constrained and weighted engines.
//!
//! Points are `[lat, lon]` pairs; distances are squared Euclidean in
//! degree space, the objective both engines minimise.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use rayon::prelude::*;

use crate::core::transforms::squared_distance;

/// Index of the closest centre and its squared distance. Ties go to the
/// lowest index.
pub fn nearest(point: [f64; 2], centers: &[[f64; 2]]) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(j, &c)| (j, squared_distance(point, c)))
        .fold((0, f64::INFINITY), |best, (j, d)| if d < best.1 { (j, d) } else { best })
}

/// Draw an index with probability proportional to `weights`, uniformly
/// when the weights are all zero.
fn sample_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    match WeightedIndex::<f64>::new(weights) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.random_range(0..weights.len()),
    }
}

/// k-means++ seeding with per-point weights.
///
/// The first centre is drawn proportionally to weight, each next one
/// proportionally to `weight * D(x)^2` where `D` is the distance to the
/// closest centre chosen so far.
pub fn init_centers<R: Rng>(
    points: &[[f64; 2]],
    weights: &[f64],
    k: usize,
    rng: &mut R,
) -> Vec<[f64; 2]> {
    debug_assert_eq!(points.len(), weights.len());
    if points.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut centers = Vec::with_capacity(k);
    let first = points[sample_index(weights, rng)];
    centers.push(first);

    let mut potentials: Vec<f64> = points
        .par_iter()
        .map(|&p| squared_distance(p, first))
        .collect();

    while centers.len() < k {
        let scores: Vec<f64> = potentials
            .iter()
            .zip(weights)
            .map(|(d, w)| d * w)
            .collect();
        let x = points[sample_index(&scores, rng)];
        centers.push(x);
        potentials = points
            .par_iter()
            .zip(potentials.par_iter())
            .map(|(&p, &d)| d.min(squared_distance(p, x)))
            .collect();
    }

    centers
}

/// Convergence threshold: `tol` times the mean per-axis weighted variance
/// of the points, so the criterion does not depend on the coordinate scale.
pub fn scaled_tolerance(points: &[[f64; 2]], weights: &[f64], tol: f64) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mut mean = [0.0; 2];
    for (p, w) in points.iter().zip(weights) {
        mean[0] += p[0] * w;
        mean[1] += p[1] * w;
    }
    mean[0] /= total;
    mean[1] /= total;

    let mut var = [0.0; 2];
    for (p, w) in points.iter().zip(weights) {
        var[0] += w * (p[0] - mean[0]).powi(2);
        var[1] += w * (p[1] - mean[1]).powi(2);
    }
    tol * (var[0] + var[1]) / (2.0 * total)
}

/// Sum of squared centre displacements between two iterations.
pub fn center_shift(old: &[[f64; 2]], new: &[[f64; 2]]) -> f64 {
    old.iter()
        .zip(new)
        .map(|(&a, &b)| squared_distance(a, b))
        .sum()
}

/// Accumulates weighted positions per cluster.
#[derive(Debug, Clone)]
pub struct CentroidAccumulator {
    sums: Vec<[f64; 2]>,
    weights: Vec<f64>,
}

impl CentroidAccumulator {
    pub fn new(k: usize) -> Self {
        Self {
            sums: vec![[0.0; 2]; k],
            weights: vec![0.0; k],
        }
    }

    #[inline]
    pub fn add(&mut self, cluster: usize, point: [f64; 2], weight: f64) {
        self.sums[cluster][0] += point[0] * weight;
        self.sums[cluster][1] += point[1] * weight;
        self.weights[cluster] += weight;
    }

    /// Weighted means; a cluster with no mass keeps its previous centre.
    pub fn centers(&self, previous: &[[f64; 2]]) -> Vec<[f64; 2]> {
        self.sums
            .iter()
            .zip(&self.weights)
            .zip(previous)
            .map(|((s, &w), &prev)| {
                if w > 0.0 {
                    [s[0] / w, s[1] / w]
                } else {
                    prev
                }
            })
            .collect()
    }
}
