//! Size-constrained k-means on the replicated street set.
//!
//! The engine clusters the replicated (lat, lon) points into exactly `k`
//! groups whose populations lie within `[size_min, size_max]`, minimising
//! within-cluster squared distance. It alternates:
//!
//! 1. **Assignment**: a min-cost flow that ships every replica to a
//!    cluster. Streets are supply nodes (supply = copy count), clusters
//!    must receive at least `size_min` and at most `size_max`, and moving
//!    one replica of street `i` to cluster `j` costs `|x_i - c_j|^2`.
//!    Replicas of one street are interchangeable, so this is the exact
//!    constrained assignment of the literal replica set.
//! 2. **Update**: each centre moves to the mean of the replicas it holds.
//!
//! Restarts (`n_init`) run in parallel with seeds drawn from the base
//! seed; the lowest-inertia run wins, the earliest on ties.
//!
//! Replica labels are folded back to one cluster per street with a
//! `FoldPolicy`. Folding a split street moves its minority replicas too,
//! so a final pass shifts or swaps whole streets between clusters until
//! every per-street total is back in bounds, or reports the clusters it
//! could not fix.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use super::assignment::{cluster_stats, ClusterStats};
use super::duplication::{replicate, ReplicatedPoints, SizeBounds};
use super::kmeans::{center_shift, init_centers, nearest, scaled_tolerance, CentroidAccumulator};
use super::streets::{ClusteredStreet, StreetSummary};
use super::warnings::PipelineWarning;
use super::weighted::{weighted_spatial_clustering, WeightedError, WeightedParams};
use crate::config::{BalanceMetric, CircuitConfig, FoldPolicy};
use crate::core::transforms::squared_distance;

/// Errors raised by the constrained engine.
#[derive(Debug, Error)]
pub enum ConstrainedError {
    #[error(
        "cannot split {points} replicated points into {clusters} clusters sized \
         [{size_min}, {size_max}]; loosen the tolerance or change the cluster count"
    )]
    Infeasible {
        points: u64,
        clusters: usize,
        size_min: u64,
        size_max: u64,
    },

    #[error("cluster count must be at least 1")]
    NoClusters,

    #[error(transparent)]
    Spatial(#[from] WeightedError),
}

/// Result type for the constrained engine.
pub type Result<T> = std::result::Result<T, ConstrainedError>;

/// Solver parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstrainedParams {
    pub clusters: usize,
    pub tolerance: f64,
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub fold: FoldPolicy,
}

impl From<&CircuitConfig> for ConstrainedParams {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            clusters: config.n_circuits,
            tolerance: config.tolerance,
            seed: config.seed,
            n_init: config.n_init,
            max_iter: config.max_iter,
            tol: config.tol,
            fold: config.fold_policy,
        }
    }
}

/// Output of the constrained engine.
#[derive(Debug, Clone, Serialize)]
pub struct ConstrainedOutcome {
    /// Street summaries with their cluster id, in input order.
    pub streets: Vec<ClusteredStreet>,
    /// Count/length totals per cluster over the non-replicated streets.
    pub stats: ClusterStats,
    pub bounds: SizeBounds,
    /// Replica population per cluster before folding; each lies in bounds.
    pub sizes: Vec<u64>,
    pub centers: Vec<[f64; 2]>,
    pub inertia: f64,
    /// Clusters whose folded per-street total is still outside bounds.
    pub out_of_bounds: Vec<usize>,
    pub warnings: Vec<PipelineWarning>,
}

// ---------------------------------------------------------------------------
// Min-cost flow (successive shortest paths with Dijkstra and potentials)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Edge {
    to: usize,
    rev: usize,
    cap: u64,
    cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Frontier {
    dist: f64,
    node: usize,
}

impl Eq for Frontier {}

impl Ord for Frontier {
    // Reversed for a min-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct FlowNetwork {
    graph: Vec<Vec<Edge>>,
}

impl FlowNetwork {
    fn new(nodes: usize) -> Self {
        Self {
            graph: vec![Vec::new(); nodes],
        }
    }

    /// Adds `from -> to`; returns the edge handle for reading its flow.
    fn add_edge(&mut self, from: usize, to: usize, cap: u64, cost: f64) -> (usize, usize) {
        let fwd = self.graph[from].len();
        let bwd = self.graph[to].len() + usize::from(from == to);
        self.graph[from].push(Edge {
            to,
            rev: bwd,
            cap,
            cost,
        });
        self.graph[to].push(Edge {
            to: from,
            rev: fwd,
            cap: 0,
            cost: -cost,
        });
        (from, fwd)
    }

    /// Flow on an edge added with capacity `cap`.
    fn flow(&self, handle: (usize, usize), cap: u64) -> u64 {
        cap - self.graph[handle.0][handle.1].cap
    }

    /// Ships up to `limit` units from `s` to `t` at minimum cost.
    /// Requires non-negative initial costs. Returns the amount shipped.
    fn min_cost_flow(&mut self, s: usize, t: usize, limit: u64) -> u64 {
        let n = self.graph.len();
        let mut potential = vec![0.0f64; n];
        let mut shipped = 0u64;

        while shipped < limit {
            let mut dist = vec![f64::INFINITY; n];
            let mut prev: Vec<Option<(usize, usize)>> = vec![None; n];
            let mut heap = BinaryHeap::new();
            dist[s] = 0.0;
            heap.push(Frontier { dist: 0.0, node: s });

            while let Some(Frontier { dist: d, node: u }) = heap.pop() {
                if d > dist[u] {
                    continue;
                }
                for (i, e) in self.graph[u].iter().enumerate() {
                    if e.cap == 0 {
                        continue;
                    }
                    // Rounding can leave reduced costs a hair below zero.
                    let reduced = (e.cost + potential[u] - potential[e.to]).max(0.0);
                    let nd = d + reduced;
                    if nd < dist[e.to] {
                        dist[e.to] = nd;
                        prev[e.to] = Some((u, i));
                        heap.push(Frontier { dist: nd, node: e.to });
                    }
                }
            }

            if !dist[t].is_finite() {
                break;
            }
            for v in 0..n {
                if dist[v].is_finite() {
                    potential[v] += dist[v];
                }
            }

            let mut push = limit - shipped;
            let mut v = t;
            while let Some((u, i)) = prev[v] {
                push = push.min(self.graph[u][i].cap);
                v = u;
            }

            let mut v = t;
            while let Some((u, i)) = prev[v] {
                let rev = self.graph[u][i].rev;
                self.graph[u][i].cap -= push;
                self.graph[v][rev].cap += push;
                v = u;
            }
            shipped += push;
        }

        shipped
    }
}

/// A street with at least one replica.
#[derive(Debug, Clone, Copy)]
struct Site {
    position: [f64; 2],
    copies: u64,
}

/// Replicas shipped from each site to each cluster, `[site][cluster]`.
type Flows = Vec<Vec<u64>>;

/// Constrained assignment of all replicas to the given centres.
fn assign(sites: &[Site], centers: &[[f64; 2]], bounds: &SizeBounds) -> Result<Flows> {
    let s = sites.len();
    let k = centers.len();
    let source = 0;
    let site_node = |i: usize| 1 + i;
    let cluster_node = |j: usize| 1 + s + j;
    let overflow = 1 + s + k;
    let sink = overflow + 1;

    let mut net = FlowNetwork::new(sink + 1);
    let mut handles = Vec::with_capacity(s);
    for (i, site) in sites.iter().enumerate() {
        net.add_edge(source, site_node(i), site.copies, 0.0);
        let row: Vec<(usize, usize)> = centers
            .iter()
            .enumerate()
            .map(|(j, &c)| {
                net.add_edge(
                    site_node(i),
                    cluster_node(j),
                    site.copies,
                    squared_distance(site.position, c),
                )
            })
            .collect();
        handles.push(row);
    }
    for j in 0..k {
        net.add_edge(cluster_node(j), sink, bounds.min, 0.0);
        net.add_edge(cluster_node(j), overflow, bounds.max - bounds.min, 0.0);
    }
    let k_min = bounds.min * k as u64;
    net.add_edge(overflow, sink, bounds.points.saturating_sub(k_min), 0.0);

    let shipped = net.min_cost_flow(source, sink, bounds.points);
    if shipped < bounds.points {
        return Err(ConstrainedError::Infeasible {
            points: bounds.points,
            clusters: k,
            size_min: bounds.min,
            size_max: bounds.max,
        });
    }

    Ok(sites
        .iter()
        .zip(&handles)
        .map(|(site, row)| row.iter().map(|&h| net.flow(h, site.copies)).collect())
        .collect())
}

fn inertia(sites: &[Site], centers: &[[f64; 2]], flows: &Flows) -> f64 {
    sites
        .iter()
        .zip(flows)
        .map(|(site, row)| {
            row.iter()
                .zip(centers)
                .filter(|(&f, _)| f > 0)
                .map(|(&f, &c)| f as f64 * squared_distance(site.position, c))
                .sum::<f64>()
        })
        .sum()
}

/// One converged run.
#[derive(Debug, Clone)]
struct Solution {
    centers: Vec<[f64; 2]>,
    flows: Flows,
    inertia: f64,
}

fn single_run(sites: &[Site], bounds: &SizeBounds, seed: u64, params: &ConstrainedParams) -> Result<Solution> {
    let points: Vec<[f64; 2]> = sites.iter().map(|s| s.position).collect();
    let weights: Vec<f64> = sites.iter().map(|s| s.copies as f64).collect();
    let threshold = scaled_tolerance(&points, &weights, params.tol);

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut centers = init_centers(&points, &weights, params.clusters, &mut rng);
    let mut flows: Flows = Vec::new();

    for iteration in 0..params.max_iter {
        let assigned = assign(sites, &centers, bounds)?;

        let mut acc = CentroidAccumulator::new(params.clusters);
        for (site, row) in sites.iter().zip(&assigned) {
            for (j, &f) in row.iter().enumerate() {
                if f > 0 {
                    acc.add(j, site.position, f as f64);
                }
            }
        }
        let next = acc.centers(&centers);
        let shift = center_shift(&centers, &next);
        let stable = assigned == flows;

        flows = assigned;
        centers = next;

        if stable || shift <= threshold {
            log::debug!("constrained run converged after {} iterations", iteration + 1);
            break;
        }
    }

    let inertia = inertia(sites, &centers, &flows);
    Ok(Solution {
        centers,
        flows,
        inertia,
    })
}

/// Run `n_init` seeded restarts and keep the best.
fn fit(sites: &[Site], bounds: &SizeBounds, params: &ConstrainedParams) -> Result<Solution> {
    let mut rng = SmallRng::seed_from_u64(params.seed);
    let seeds: Vec<u64> = (0..params.n_init.max(1)).map(|_| rng.random()).collect();

    let runs = seeds
        .par_iter()
        .map(|&seed| single_run(sites, bounds, seed, params))
        .collect::<Result<Vec<Solution>>>()?;

    runs.into_iter()
        .min_by(|a, b| a.inertia.total_cmp(&b.inertia))
        .ok_or(ConstrainedError::NoClusters)
}

/// Pick one cluster for a street from its replica distribution.
pub fn fold_label(shares: &[u64], policy: FoldPolicy) -> Option<usize> {
    match policy {
        FoldPolicy::First => shares.iter().position(|&f| f > 0),
        FoldPolicy::Majority => shares
            .iter()
            .enumerate()
            .filter(|(_, &f)| f > 0)
            .fold(None, |best: Option<(usize, u64)>, (j, &f)| match best {
                Some((_, bf)) if bf >= f => best,
                _ => Some((j, f)),
            })
            .map(|(j, _)| j),
    }
}

/// Refill clusters that folding left without any street.
///
/// The donor is the street that shipped the most replicas to the empty
/// cluster, else the street closest to its centre, taken only from a
/// cluster that keeps at least one street.
fn refill_empty_clusters(
    labels: &mut [usize],
    shares: &[Option<&Vec<u64>>],
    positions: &[[f64; 2]],
    centers: &[[f64; 2]],
    streets: &[StreetSummary],
) -> Vec<PipelineWarning> {
    let k = centers.len();
    let mut members = vec![0usize; k];
    for &label in labels.iter() {
        members[label] += 1;
    }

    let mut warnings = Vec::new();
    for target in 0..k {
        if members[target] > 0 {
            continue;
        }
        let donors = || (0..labels.len()).filter(|&i| members[labels[i]] > 1);

        let by_share = donors()
            .filter_map(|i| shares[i].map(|row| (i, row[target])))
            .filter(|&(_, f)| f > 0)
            .fold(None, |best: Option<(usize, u64)>, (i, f)| match best {
                Some((_, bf)) if bf >= f => best,
                _ => Some((i, f)),
            })
            .map(|(i, _)| i);

        let chosen = by_share.or_else(|| {
            donors()
                .map(|i| (i, squared_distance(positions[i], centers[target])))
                .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
                    Some((_, bd)) if bd <= d => best,
                    _ => Some((i, d)),
                })
                .map(|(i, _)| i)
        });

        if let Some(i) = chosen {
            let from = labels[i];
            members[from] -= 1;
            members[target] += 1;
            labels[i] = target;
            warnings.push(
                PipelineWarning::ClusterRefilled {
                    street: streets[i].street.clone(),
                    from,
                    to: target,
                }
                .logged(),
            );
        }
    }
    warnings
}

/// A single-street change considered by [`rebalance`].
#[derive(Debug, Clone, Copy, PartialEq)]
enum Move {
    Shift { street: usize, to: usize },
    Swap(usize, usize),
}

/// Distance of a cluster total from `[min, max]`.
fn excess(total: u64, bounds: &SizeBounds) -> u64 {
    bounds.min.saturating_sub(total) + total.saturating_sub(bounds.max)
}

/// Move whole streets between clusters until every per-street total lies
/// in `bounds`.
///
/// Each step applies the shift (one street to another cluster) or, failing
/// that, the swap (two streets trade clusters) that most reduces the summed
/// excess, preferring the one that adds the least squared distance to the
/// centres. No cluster loses its last street. Stops when nothing improves
/// and returns the clusters left out of bounds.
fn rebalance(
    labels: &mut [usize],
    metrics: &[u64],
    positions: &[[f64; 2]],
    centers: &[[f64; 2]],
    bounds: &SizeBounds,
) -> Vec<usize> {
    let k = centers.len();
    let mut totals = vec![0u64; k];
    let mut members = vec![0usize; k];
    for (&label, &m) in labels.iter().zip(metrics) {
        totals[label] += m;
        members[label] += 1;
    }
    let cost = |i: usize, c: usize| squared_distance(positions[i], centers[c]);
    let better = |best: &Option<(u64, f64, Move)>, gain: u64, penalty: f64| match best {
        Some((g, p, _)) => gain > *g || (gain == *g && penalty < *p),
        None => gain > 0,
    };

    loop {
        if totals.iter().all(|&t| excess(t, bounds) == 0) {
            break;
        }

        let mut best: Option<(u64, f64, Move)> = None;
        for i in 0..labels.len() {
            let (a, m) = (labels[i], metrics[i]);
            if m == 0 || members[a] < 2 {
                continue;
            }
            for b in (0..k).filter(|&b| b != a) {
                let before = excess(totals[a], bounds) + excess(totals[b], bounds);
                let after = excess(totals[a] - m, bounds) + excess(totals[b] + m, bounds);
                let gain = before.saturating_sub(after);
                let penalty = cost(i, b) - cost(i, a);
                if better(&best, gain, penalty) {
                    best = Some((gain, penalty, Move::Shift { street: i, to: b }));
                }
            }
        }

        if best.is_none() {
            for i in 0..labels.len() {
                let a = labels[i];
                if excess(totals[a], bounds) == 0 {
                    continue;
                }
                for j in 0..labels.len() {
                    let b = labels[j];
                    if b == a || metrics[i] == metrics[j] {
                        continue;
                    }
                    let before = excess(totals[a], bounds) + excess(totals[b], bounds);
                    let after = excess(totals[a] - metrics[i] + metrics[j], bounds)
                        + excess(totals[b] - metrics[j] + metrics[i], bounds);
                    let gain = before.saturating_sub(after);
                    let penalty = cost(i, b) + cost(j, a) - cost(i, a) - cost(j, b);
                    if better(&best, gain, penalty) {
                        best = Some((gain, penalty, Move::Swap(i, j)));
                    }
                }
            }
        }

        match best.map(|(_, _, mv)| mv) {
            Some(Move::Shift { street, to }) => {
                let from = labels[street];
                totals[from] -= metrics[street];
                totals[to] += metrics[street];
                members[from] -= 1;
                members[to] += 1;
                labels[street] = to;
            }
            Some(Move::Swap(i, j)) => {
                let (a, b) = (labels[i], labels[j]);
                totals[a] = totals[a] - metrics[i] + metrics[j];
                totals[b] = totals[b] - metrics[j] + metrics[i];
                labels.swap(i, j);
            }
            None => break,
        }
    }

    (0..k).filter(|&j| excess(totals[j], bounds) > 0).collect()
}

/// Every street has a zero metric, so every partition is balanced: cluster
/// on position alone.
fn cluster_on_position(
    streets: &[StreetSummary],
    metric: BalanceMetric,
    params: &ConstrainedParams,
) -> Result<ConstrainedOutcome> {
    let mut warnings = vec![PipelineWarning::MetricAllZero {
        metric: metric.to_string(),
    }
    .logged()];
    let spatial = weighted_spatial_clustering(
        streets,
        None,
        &WeightedParams {
            clusters: params.clusters,
            seed: params.seed,
            max_iter: params.max_iter,
            tol: params.tol,
        },
    )?;
    warnings.extend(spatial.warnings);

    Ok(ConstrainedOutcome {
        streets: spatial.streets,
        stats: spatial.stats,
        bounds: SizeBounds::new(0, params.clusters, params.tolerance),
        sizes: vec![0; params.clusters],
        centers: spatial.centers,
        inertia: spatial.inertia,
        out_of_bounds: Vec::new(),
        warnings,
    })
}

/// Balanced spatial clustering of streets on the sum of `metric`.
///
/// Streets are replicated by their metric, clustered under hard size
/// bounds derived from `params.tolerance`, then folded back to one cluster
/// per street and rebalanced. Streets with a zero metric join the nearest
/// final centre. When every metric is zero the streets are clustered on
/// position alone with a `MetricAllZero` warning.
///
/// Clusters whose per-street total cannot be brought into bounds are
/// listed in `out_of_bounds`, each with a `BoundsViolated` warning.
///
/// # Errors
///
/// `Infeasible` when `size_min * k > N` or `size_max * k < N`.
pub fn balanced_spatial_clustering(
    streets: &[StreetSummary],
    metric: BalanceMetric,
    params: &ConstrainedParams,
) -> Result<ConstrainedOutcome> {
    if params.clusters == 0 {
        return Err(ConstrainedError::NoClusters);
    }
    log::info!("Starting balanced spatial clustering on {}", metric);

    let replicated: ReplicatedPoints = replicate(streets, metric);
    if replicated.is_empty() {
        return cluster_on_position(streets, metric, params);
    }
    let mut warnings = Vec::new();

    let bounds = SizeBounds::new(replicated.len(), params.clusters, params.tolerance);
    log::info!(
        "Ideal cluster sizes for {}: size_min={} size_max={} (N={}, k={})",
        metric,
        bounds.min,
        bounds.max,
        bounds.points,
        bounds.clusters
    );
    if !bounds.is_feasible() {
        return Err(ConstrainedError::Infeasible {
            points: bounds.points,
            clusters: bounds.clusters,
            size_min: bounds.min,
            size_max: bounds.max,
        });
    }

    let runs: Vec<_> = replicated.runs().collect();
    let sites: Vec<Site> = runs
        .iter()
        .map(|r| Site {
            position: r.position,
            copies: r.copies,
        })
        .collect();

    let solution = fit(&sites, &bounds, params)?;

    // Fold replica labels back to streets.
    let mut shares: Vec<Option<&Vec<u64>>> = vec![None; streets.len()];
    for (run, row) in runs.iter().zip(&solution.flows) {
        shares[run.street] = Some(row);
    }

    let positions: Vec<[f64; 2]> = streets.iter().map(StreetSummary::position).collect();
    let mut labels = Vec::with_capacity(streets.len());
    let mut splits = Vec::new();
    for (i, street) in streets.iter().enumerate() {
        let label = match shares[i] {
            Some(row) => {
                if row.iter().filter(|&&f| f > 0).count() > 1 {
                    splits.push(i);
                }
                fold_label(row, params.fold).unwrap_or(0)
            }
            None => {
                let label = nearest(positions[i], &solution.centers).0;
                warnings.push(
                    PipelineWarning::ZeroMetricStreet {
                        street: street.street.clone(),
                        assigned: label,
                    }
                    .logged(),
                );
                label
            }
        };
        labels.push(label);
    }

    warnings.extend(refill_empty_clusters(
        &mut labels,
        &shares,
        &positions,
        &solution.centers,
        streets,
    ));

    let metrics: Vec<u64> = streets.iter().map(|s| s.metric(metric)).collect();
    let out_of_bounds = rebalance(&mut labels, &metrics, &positions, &solution.centers, &bounds);

    for i in splits {
        if let Some(row) = shares[i] {
            let split = row
                .iter()
                .enumerate()
                .filter(|(_, &f)| f > 0)
                .map(|(j, &f)| (j, f))
                .collect();
            warnings.push(
                PipelineWarning::StreetSplit {
                    street: streets[i].street.clone(),
                    shares: split,
                    assigned: labels[i],
                }
                .logged(),
            );
        }
    }

    let mut sizes = vec![0u64; params.clusters];
    for row in &solution.flows {
        for (j, &f) in row.iter().enumerate() {
            sizes[j] += f;
        }
    }
    debug_assert!(sizes.iter().all(|&n| bounds.contains(n)));

    let clustered: Vec<ClusteredStreet> = streets
        .iter()
        .cloned()
        .zip(labels)
        .map(|(summary, cluster)| ClusteredStreet { summary, cluster })
        .collect();
    let stats = cluster_stats(&clustered, params.clusters);

    for &cluster in &out_of_bounds {
        let total = stats.get(cluster).map_or(0, |t| t.metric(metric));
        warnings.push(
            PipelineWarning::BoundsViolated {
                cluster,
                total,
                min: bounds.min,
                max: bounds.max,
            }
            .logged(),
        );
    }

    log::info!("Clustering complete for {}: {}", metric, stats);

    Ok(ConstrainedOutcome {
        streets: clustered,
        stats,
        bounds,
        sizes,
        centers: solution.centers,
        inertia: solution.inertia,
        out_of_bounds,
        warnings,
    })
}
