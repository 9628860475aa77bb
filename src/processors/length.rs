//! Street length estimation from house numbering and geometry.
//!
//! A street is a "center" street when its numbers are dense (median gap
//! between consecutive numbers below a threshold): numbering says little
//! about frontage there, so length comes from the geographic extent.
//! Sparse "side" streets use their highest house number as the length.
//! Outlier filtering only feeds the median gap; it never trims that number.

use serde::{Deserialize, Serialize};

use crate::config::StreetConfig;
use crate::core::loaders::AddressRecord;
use crate::core::transforms::{median, quantile, BoundingBox};

/// Numbering classification of a street.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreetKind {
    Center,
    Side,
}

/// Result of analysing a street's house numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberingAnalysis {
    pub kind: StreetKind,
    /// Numbers that survived outlier filtering, ascending.
    pub kept: Vec<u32>,
    /// Values removed as outliers (at most one distinct value).
    pub outliers: Vec<u32>,
    /// Median gap between consecutive kept numbers, if defined.
    pub median_gap: Option<f64>,
}

/// Length estimate for one street.
#[derive(Debug, Clone, PartialEq)]
pub struct LengthEstimate {
    pub kind: StreetKind,
    pub length: u64,
    pub outliers: Vec<u32>,
}

/// Single-outlier IQR detector.
///
/// Flags values outside `[Q1 - f*IQR, Q3 + f*IQR]`, but only when exactly
/// one value falls outside; otherwise nothing is flagged. `sorted` must be
/// ascending.
pub fn detect_outliers(sorted: &[f64], iqr_factor: f64) -> Option<f64> {
    let q1 = quantile(sorted, 0.25)?;
    let q3 = quantile(sorted, 0.75)?;
    let iqr = q3 - q1;
    let lower = q1 - iqr_factor * iqr;
    let upper = q3 + iqr_factor * iqr;

    let mut outside = sorted.iter().filter(|&&v| v < lower || v > upper);
    match (outside.next(), outside.next()) {
        (Some(&v), None) => Some(v),
        _ => None,
    }
}

/// Filter outliers from a street's numbers and classify it.
///
/// Missing numbers are ignored. An undefined median gap (fewer than two
/// numbers) classifies the street as `Side`.
pub fn classify_numbers(numbers: &[u32], config: &StreetConfig) -> NumberingAnalysis {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();

    let as_f64: Vec<f64> = sorted.iter().map(|&n| n as f64).collect();
    let outliers: Vec<u32> = match detect_outliers(&as_f64, config.iqr_factor) {
        Some(v) => vec![v as u32],
        None => Vec::new(),
    };

    let kept: Vec<u32> = sorted
        .into_iter()
        .filter(|n| !outliers.contains(n))
        .collect();

    let gaps: Vec<f64> = kept.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let median_gap = median(&gaps);

    let kind = match median_gap {
        Some(gap) if gap < config.center_gap_threshold => StreetKind::Center,
        _ => StreetKind::Side,
    };

    NumberingAnalysis {
        kind,
        kept,
        outliers,
        median_gap,
    }
}

/// Estimate the length of one street from all of its address records.
///
/// - `Center`: haversine distance between the (min lat, min lon) and
///   (max lat, max lon) corners, in meters, truncated.
/// - `Side`: highest house number, outliers included. A street without
///   any house number falls back to the geometric length.
pub fn estimate_street_length(records: &[&AddressRecord], config: &StreetConfig) -> LengthEstimate {
    let numbers: Vec<u32> = records.iter().filter_map(|r| r.number).collect();
    let analysis = classify_numbers(&numbers, config);

    let geometric = || {
        BoundingBox::from_points(records.iter().map(|r| (r.lat, r.lon)))
            .map_or(0, |b| b.diagonal_m() as u64)
    };

    let length = match analysis.kind {
        StreetKind::Center => geometric(),
        StreetKind::Side => match numbers.iter().max() {
            Some(&max) => max as u64,
            None => geometric(),
        },
    };

    LengthEstimate {
        kind: analysis.kind,
        length,
        outliers: analysis.outliers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn street(numbers: &[Option<u32>]) -> Vec<AddressRecord> {
        numbers
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                AddressRecord::new(
                    "Rue Test",
                    n,
                    "34000",
                    "Montpellier",
                    43.600 + i as f64 * 0.001,
                    3.870 + i as f64 * 0.001,
                )
            })
            .collect()
    }

    #[test]
    fn test_single_extreme_outlier_is_removed() {
        let analysis = classify_numbers(&[1, 3, 5, 7, 9, 1000], &StreetConfig::default());
        assert_eq!(analysis.outliers, vec![1000]);
        assert_eq!(analysis.kept, vec![1, 3, 5, 7, 9]);
        assert_eq!(analysis.median_gap, Some(2.0));
        assert_eq!(analysis.kind, StreetKind::Center);
    }

    #[test]
    fn test_two_extreme_values_are_both_kept() {
        let numbers = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 1000, 2000];
        let analysis = classify_numbers(&numbers, &StreetConfig::default());
        assert!(analysis.outliers.is_empty());
        assert_eq!(analysis.kept.len(), numbers.len());
        assert!(analysis.kept.contains(&1000));
        assert!(analysis.kept.contains(&2000));
    }

    #[test]
    fn test_detect_outliers_identical_values() {
        assert_eq!(detect_outliers(&[5.0, 5.0, 5.0], 5.0), None);
        assert_eq!(detect_outliers(&[], 5.0), None);
    }

    #[test]
    fn test_sparse_numbering_is_side() {
        let analysis = classify_numbers(&[40, 2, 20, 10], &StreetConfig::default());
        assert_eq!(analysis.median_gap, Some(10.0));
        assert_eq!(analysis.kind, StreetKind::Side);
    }

    #[test]
    fn test_side_length_is_max_number() {
        let records = street(&[Some(2), Some(10), Some(20), Some(40)]);
        let refs: Vec<&AddressRecord> = records.iter().collect();
        let estimate = estimate_street_length(&refs, &StreetConfig::default());
        assert_eq!(estimate.kind, StreetKind::Side);
        assert_eq!(estimate.length, 40);
    }

    #[test]
    fn test_side_length_keeps_outlier_number() {
        let records = street(&[Some(10), Some(20), Some(30), Some(40), Some(50), Some(5000)]);
        let refs: Vec<&AddressRecord> = records.iter().collect();
        let estimate = estimate_street_length(&refs, &StreetConfig::default());
        assert_eq!(estimate.kind, StreetKind::Side);
        assert_eq!(estimate.outliers, vec![5000]);
        assert_eq!(estimate.length, 5000);
    }

    #[test]
    fn test_center_length_is_geometric() {
        let records = street(&[Some(1), Some(2), Some(3), Some(4)]);
        let refs: Vec<&AddressRecord> = records.iter().collect();
        let estimate = estimate_street_length(&refs, &StreetConfig::default());
        assert_eq!(estimate.kind, StreetKind::Center);

        let expected = crate::core::transforms::haversine(43.600, 3.870, 43.603, 3.873) as u64;
        assert_eq!(estimate.length, expected);
        assert!(estimate.length > 300 && estimate.length < 500);
    }

    #[test]
    fn test_single_address_does_not_fail() {
        let records = street(&[Some(17)]);
        let refs: Vec<&AddressRecord> = records.iter().collect();
        let estimate = estimate_street_length(&refs, &StreetConfig::default());
        assert_eq!(estimate.kind, StreetKind::Side);
        assert_eq!(estimate.length, 17);
    }

    #[test]
    fn test_street_without_numbers_uses_geometry() {
        let records = street(&[None, None]);
        let refs: Vec<&AddressRecord> = records.iter().collect();
        let estimate = estimate_street_length(&refs, &StreetConfig::default());
        assert_eq!(estimate.kind, StreetKind::Side);
        assert!(estimate.length > 0);
    }

    #[test]
    fn test_identical_numbers_are_center() {
        let analysis = classify_numbers(&[5, 5, 5], &StreetConfig::default());
        assert!(analysis.outliers.is_empty());
        assert_eq!(analysis.median_gap, Some(0.0));
        assert_eq!(analysis.kind, StreetKind::Center);
    }

    #[test]
    fn test_estimation_is_idempotent() {
        let records = street(&[Some(1), Some(3), Some(5), Some(7), Some(9), Some(1000)]);
        let refs: Vec<&AddressRecord> = records.iter().collect();
        let first = estimate_street_length(&refs, &StreetConfig::default());
        let second = estimate_street_length(&refs, &StreetConfig::default());
        assert_eq!(first, second);
    }
}
