//! Street aggregation: one summary row per distinct street name.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::length::{estimate_street_length, LengthEstimate, StreetKind};
use super::warnings::PipelineWarning;
use crate::config::{BalanceMetric, StreetConfig};
use crate::core::loaders::AddressRecord;
use crate::core::transforms::centroid;

/// Errors raised while aggregating streets.
#[derive(Debug, Error)]
pub enum StreetError {
    #[error("{rows} address records lack required fields: {}", .fields.join(", "))]
    MissingFields { fields: Vec<String>, rows: usize },
}

/// Result type for street aggregation.
pub type Result<T> = std::result::Result<T, StreetError>;

/// Aggregated statistics of one street, the unit of clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreetSummary {
    pub street: String,
    pub count: u64,
    /// Mean latitude of the street's addresses.
    pub lat: f64,
    /// Mean longitude of the street's addresses.
    pub lon: f64,
    pub length: u64,
}

impl StreetSummary {
    #[inline]
    pub fn position(&self) -> [f64; 2] {
        [self.lat, self.lon]
    }

    pub fn metric(&self, metric: BalanceMetric) -> u64 {
        match metric {
            BalanceMetric::Count => self.count,
            BalanceMetric::Length => self.length,
        }
    }
}

/// A street summary annotated with its cluster id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredStreet {
    #[serde(flatten)]
    pub summary: StreetSummary,
    pub cluster: usize,
}

/// Output of the street aggregator.
#[derive(Debug, Clone, Default)]
pub struct StreetAggregation {
    /// Summaries sorted by street name.
    pub streets: Vec<StreetSummary>,
    pub warnings: Vec<PipelineWarning>,
}

fn validate(records: &[AddressRecord]) -> Result<()> {
    let mut fields = BTreeSet::new();
    let mut rows = 0;
    for record in records {
        let mut bad = false;
        if record.street.trim().is_empty() {
            fields.insert("street");
            bad = true;
        }
        if !record.lat.is_finite() {
            fields.insert("lat");
            bad = true;
        }
        if !record.lon.is_finite() {
            fields.insert("lon");
            bad = true;
        }
        if bad {
            rows += 1;
        }
    }

    if rows > 0 {
        return Err(StreetError::MissingFields {
            fields: fields.into_iter().map(String::from).collect(),
            rows,
        });
    }
    Ok(())
}

/// Group address records by street name and summarise each street.
///
/// Count is the number of records, position is the mean of the member
/// points and length comes from the street length estimator. Empty input
/// yields an empty aggregation.
///
/// # Errors
///
/// `MissingFields` if any record has an empty street name or a
/// non-finite coordinate.
pub fn aggregate_streets(records: &[AddressRecord], config: &StreetConfig) -> Result<StreetAggregation> {
    validate(records)?;

    let mut groups: BTreeMap<&str, Vec<&AddressRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.street.as_str()).or_default().push(record);
    }
    let groups: Vec<(&str, Vec<&AddressRecord>)> = groups.into_iter().collect();

    let estimated: Vec<(StreetSummary, LengthEstimate)> = groups
        .par_iter()
        .map(|(name, members)| {
            let (lat, lon) = centroid(members.iter().map(|r| (r.lat, r.lon))).unwrap_or_default();
            let estimate = estimate_street_length(members, config);
            let summary = StreetSummary {
                street: name.to_string(),
                count: members.len() as u64,
                lat,
                lon,
                length: estimate.length,
            };
            (summary, estimate)
        })
        .collect();

    let mut aggregation = StreetAggregation::default();
    for (summary, estimate) in estimated {
        // A side street's length still counts the outlier, so only center
        // streets lose information.
        if estimate.kind == StreetKind::Center && !estimate.outliers.is_empty() {
            aggregation.warnings.push(
                PipelineWarning::OutliersDiscarded {
                    street: summary.street.clone(),
                    values: estimate.outliers,
                }
                .logged(),
            );
        }
        aggregation.streets.push(summary);
    }

    log::info!(
        "Aggregated {} addresses into {} streets",
        records.len(),
        aggregation.streets.len()
    );

    Ok(aggregation)
}
