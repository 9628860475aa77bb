//! Non-fatal conditions reported alongside pipeline results.

use std::fmt;

use serde::Serialize;

/// A condition the pipeline absorbed locally but that callers may want to
/// surface. Each warning is also logged when raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// No address records for the requested city.
    EmptyInput,
    /// A single aberrant house number was left out of a center street's numbering.
    OutliersDiscarded { street: String, values: Vec<u32> },
    /// Every street has a zero balancing metric; streets were clustered on
    /// position alone.
    MetricAllZero { metric: String },
    /// A street's replicas were spread over several clusters before folding.
    StreetSplit {
        street: String,
        /// `(cluster, replicas)` pairs in cluster order.
        shares: Vec<(usize, u64)>,
        assigned: usize,
    },
    /// A street with a zero metric had no replica and joined the nearest centre.
    ZeroMetricStreet { street: String, assigned: usize },
    /// Folding emptied a cluster; a street was moved in to refill it.
    ClusterRefilled { street: String, from: usize, to: usize },
    /// No street move could bring this cluster's folded total into bounds.
    BoundsViolated {
        cluster: usize,
        total: u64,
        min: u64,
        max: u64,
    },
}

impl PipelineWarning {
    /// Log this warning and hand it back, for `warnings.push(w.logged())`.
    pub fn logged(self) -> Self {
        log::warn!("{}", self);
        self
    }
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::EmptyInput => write!(f, "no address records for this city"),
            PipelineWarning::OutliersDiscarded { street, values } => {
                write!(f, "outlier house numbers discarded for {}: {:?}", street, values)
            }
            PipelineWarning::MetricAllZero { metric } => write!(
                f,
                "every street has a zero {}; clustered on position only",
                metric
            ),
            PipelineWarning::StreetSplit {
                street,
                shares,
                assigned,
            } => write!(
                f,
                "street {} split across clusters {:?}; folded into cluster {}",
                street, shares, assigned
            ),
            PipelineWarning::ZeroMetricStreet { street, assigned } => write!(
                f,
                "street {} has a zero metric; assigned to nearest cluster {}",
                street, assigned
            ),
            PipelineWarning::ClusterRefilled { street, from, to } => write!(
                f,
                "cluster {} emptied by folding; moved street {} from cluster {}",
                to, street, from
            ),
            PipelineWarning::BoundsViolated {
                cluster,
                total,
                min,
                max,
            } => write!(
                f,
                "cluster {} totals {} after folding, outside [{}, {}]",
                cluster, total, min, max
            ),
        }
    }
}
