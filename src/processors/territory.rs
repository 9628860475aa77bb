//! Territory partitioning: the end-to-end pipeline from address records to
//! circuits.
//!
//! aggregate streets -> cluster (constrained or weighted) -> propagate
//! clusters back to every address. Each stage returns new values; warnings
//! raised along the way are collected into the result.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::assignment::{propagate, AnnotatedAddress, AssignmentError, ClusterAssignment, ClusterStats};
use super::constrained::{balanced_spatial_clustering, ConstrainedError, ConstrainedParams};
use super::duplication::SizeBounds;
use super::streets::{aggregate_streets, ClusteredStreet, StreetError};
use super::warnings::PipelineWarning;
use super::weighted::{weighted_spatial_clustering, WeightedError, WeightedParams};
use crate::config::{
    CircuitConfig, CircuitStyle, ClusteringMethod, PipelineConfig, StreetConfig, Strategy, UnknownMethod,
};
use crate::core::loaders::{
    filter_city, load_address_table, validate_department, AddressProvider, AddressRecord, LoaderError,
};
use crate::core::writers::{write_addresses_csv, write_clustered_streets_csv, write_json, WriteError};

/// Errors raised by the partitioning pipeline.
#[derive(Debug, Error)]
pub enum TerritoryError {
    #[error(transparent)]
    InvalidMethod(#[from] UnknownMethod),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot form {clusters} circuits from {streets} streets")]
    TooFewStreets { streets: usize, clusters: usize },

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Street(#[from] StreetError),

    #[error(transparent)]
    Constrained(#[from] ConstrainedError),

    #[error(transparent)]
    Weighted(#[from] WeightedError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Result type for the partitioning pipeline.
pub type Result<T> = std::result::Result<T, TerritoryError>;

/// Everything a partition run produces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionResult {
    /// Input records in input order, each with its circuit id.
    pub addresses: Vec<AnnotatedAddress>,
    /// Street summaries with their circuit id, sorted by street name.
    pub streets: Vec<ClusteredStreet>,
    pub stats: ClusterStats,
    /// Replica size bounds, for the balanced methods.
    pub bounds: Option<SizeBounds>,
    /// Circuits whose total ended outside `bounds`; empty when balanced.
    pub out_of_bounds: Vec<usize>,
    pub warnings: Vec<PipelineWarning>,
}

/// Partition a city's address records into `circuits.n_circuits` circuits.
///
/// Empty input is not an error: the result is empty and carries an
/// `EmptyInput` warning.
///
/// # Errors
///
/// - `InvalidConfig` when the circuit settings are out of range
/// - `TooFewStreets` when there are fewer distinct streets than circuits
/// - schema errors from aggregation, and engine errors such as
///   `Constrained(Infeasible)`
pub fn partition(
    records: &[AddressRecord],
    circuits: &CircuitConfig,
    streets_config: &StreetConfig,
) -> Result<PartitionResult> {
    circuits.validate().map_err(TerritoryError::InvalidConfig)?;

    if records.is_empty() {
        return Ok(PartitionResult {
            warnings: vec![PipelineWarning::EmptyInput.logged()],
            ..PartitionResult::default()
        });
    }

    let aggregation = aggregate_streets(records, streets_config)?;
    let mut warnings = aggregation.warnings;
    let streets = aggregation.streets;

    let k = circuits.n_circuits;
    if streets.len() < k {
        return Err(TerritoryError::TooFewStreets {
            streets: streets.len(),
            clusters: k,
        });
    }

    log::info!(
        "Partitioning {} addresses on {} streets into {} circuits with {}",
        records.len(),
        streets.len(),
        k,
        circuits.method
    );

    let (clustered, stats, bounds, out_of_bounds) = match circuits.method.strategy() {
        Strategy::Constrained(metric) => {
            let outcome = balanced_spatial_clustering(&streets, metric, &ConstrainedParams::from(circuits))?;
            warnings.extend(outcome.warnings);
            (outcome.streets, outcome.stats, Some(outcome.bounds), outcome.out_of_bounds)
        }
        Strategy::Weighted(metric) => {
            let outcome = weighted_spatial_clustering(&streets, metric, &WeightedParams::from(circuits))?;
            warnings.extend(outcome.warnings);
            (outcome.streets, outcome.stats, None, Vec::new())
        }
    };

    let assignment = ClusterAssignment::from_streets(&clustered);
    let addresses = propagate(records, &assignment)?;

    for (id, totals) in stats.iter() {
        log::info!(
            "{}: {} addresses, length {}",
            circuits.style(id).name,
            totals.count,
            totals.length
        );
    }

    Ok(PartitionResult {
        addresses,
        streets: clustered,
        stats,
        bounds,
        out_of_bounds,
        warnings,
    })
}

fn default_method() -> String {
    ClusteringMethod::default().as_str().to_string()
}

/// A partition request as received from a client: city, department,
/// circuit count, method name and circuit colors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub city_name: String,
    pub dep_code: String,
    pub cluster_nbr: usize,
    #[serde(default = "default_method")]
    pub clustering_method: String,
    #[serde(default)]
    pub cluster_colors: Vec<String>,
}

impl PartitionRequest {
    /// Circuit settings for this request on top of `base`.
    ///
    /// The method name is parsed first, so an unknown method fails before
    /// anything else is looked at.
    pub fn to_config(&self, base: &CircuitConfig) -> Result<CircuitConfig> {
        let method: ClusteringMethod = self.clustering_method.parse()?;
        let styles = self
            .cluster_colors
            .iter()
            .enumerate()
            .map(|(i, color)| CircuitStyle {
                name: format!("Cluster {}", i + 1),
                color: Some(color.clone()),
            })
            .collect();

        let config = CircuitConfig {
            n_circuits: self.cluster_nbr,
            method,
            styles,
            ..base.clone()
        };
        config.validate().map_err(TerritoryError::InvalidConfig)?;
        Ok(config)
    }

    /// Fetch the city's addresses from `provider` and partition them.
    pub fn run<P: AddressProvider + ?Sized>(&self, provider: &P, config: &PipelineConfig) -> Result<PartitionResult> {
        let circuits = self.to_config(&config.circuits)?;
        let department = validate_department(&self.dep_code)?;
        let records = provider.addresses(&self.city_name, &department);
        partition(&records, &circuits, &config.streets)
    }
}

/// Paths written by [`write_partition`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFiles {
    pub addresses: PathBuf,
    pub streets: PathBuf,
    pub report: PathBuf,
}

/// Stats, bounds and warnings of a run, as written to `report.json`.
#[derive(Debug, Serialize)]
struct Report<'a> {
    stats: &'a ClusterStats,
    bounds: Option<&'a SizeBounds>,
    out_of_bounds: &'a [usize],
    warnings: &'a [PipelineWarning],
}

/// Write `addresses.csv`, `streets.csv` and `report.json` into `output_dir`.
pub fn write_partition(result: &PartitionResult, output_dir: &Path, delimiter: u8) -> Result<OutputFiles> {
    let files = OutputFiles {
        addresses: output_dir.join("addresses.csv"),
        streets: output_dir.join("streets.csv"),
        report: output_dir.join("report.json"),
    };

    write_addresses_csv(&files.addresses, &result.addresses, delimiter)?;
    write_clustered_streets_csv(&files.streets, &result.streets, delimiter)?;
    write_json(
        &files.report,
        &Report {
            stats: &result.stats,
            bounds: result.bounds.as_ref(),
            out_of_bounds: &result.out_of_bounds,
            warnings: &result.warnings,
        },
    )?;

    log::info!("Wrote partition outputs to {}", output_dir.display());
    Ok(files)
}

/// Load an address CSV, optionally keep one city, partition it and write
/// the outputs.
pub fn process_address_file(
    input: &Path,
    output_dir: &Path,
    city: Option<&str>,
    config: &PipelineConfig,
) -> Result<(OutputFiles, PartitionResult)> {
    let mut records = load_address_table(input, &config.data)?;
    if let Some(city) = city {
        records = filter_city(records, city);
    }

    let result = partition(&records, &config.circuits, &config.streets)?;
    let delimiter = u8::try_from(config.data.delimiter)
        .map_err(|_| TerritoryError::Loader(LoaderError::InvalidDelimiter(config.data.delimiter)))?;
    let files = write_partition(&result, output_dir, delimiter)?;
    Ok((files, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use crate::core::loaders::CsvDirectoryProvider;
    use std::cell::Cell;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::tempdir;

    /// `n` addresses numbered 10, 20, .. along a short north-south street,
    /// so its estimated length is `10 * n`.
    fn street(name: &str, n: u32, lat: f64, lon: f64) -> Vec<AddressRecord> {
        (1..=n)
            .map(|i| AddressRecord::new(name, Some(10 * i), "34000", "Montpellier", lat + i as f64 * 1e-5, lon))
            .collect()
    }

    fn city() -> Vec<AddressRecord> {
        let mut records = Vec::new();
        for i in 0..12 {
            let lat = 43.60 + (i % 4) as f64 * 0.01;
            let lon = 3.85 + (i / 4) as f64 * 0.01;
            records.extend(street(&format!("Rue {}", i), 1 + (i % 3) as u32, lat, lon));
        }
        records
    }

    fn config(k: usize, method: ClusteringMethod) -> CircuitConfig {
        CircuitConfig::new(k, method)
    }

    struct CountingProvider {
        calls: Cell<usize>,
        records: Vec<AddressRecord>,
    }

    impl AddressProvider for CountingProvider {
        fn addresses(&self, _city: &str, _department: &str) -> Vec<AddressRecord> {
            self.calls.set(self.calls.get() + 1);
            self.records.clone()
        }
    }

    #[test]
    fn test_every_method_partitions_all_addresses() {
        let records = city();
        for method in ClusteringMethod::ALL {
            let result = partition(&records, &config(3, method), &StreetConfig::default()).unwrap();

            assert_eq!(result.addresses.len(), records.len(), "{}", method);
            let total: u64 = result.stats.iter().map(|(_, t)| t.count).sum();
            assert_eq!(total, records.len() as u64, "{}", method);

            let ids: BTreeSet<usize> = result.addresses.iter().map(|a| a.cluster).collect();
            assert_eq!(ids, (0..3).collect::<BTreeSet<_>>(), "{}", method);
            assert_eq!(result.stats.len(), 3);
        }
    }

    #[test]
    fn test_addresses_follow_their_street() {
        let records = city();
        let result =
            partition(&records, &config(2, ClusteringMethod::BalancedLength), &StreetConfig::default()).unwrap();
        for address in &result.addresses {
            let street = result
                .streets
                .iter()
                .find(|s| s.summary.street == address.record.street)
                .unwrap();
            assert_eq!(street.cluster, address.cluster);
        }
    }

    #[test]
    fn test_balanced_count_within_bounds() {
        // One address per street: replicas never split, so folded totals
        // equal the constrained sizes.
        let records: Vec<AddressRecord> = (0..12)
            .map(|i| {
                AddressRecord::new(
                    format!("Rue {}", i),
                    Some(1),
                    "34000",
                    "Montpellier",
                    43.6 + (i % 3) as f64 * 0.02,
                    3.8 + (i % 5) as f64 * 0.01,
                )
            })
            .collect();
        let result =
            partition(&records, &config(3, ClusteringMethod::BalancedCount), &StreetConfig::default()).unwrap();

        let bounds = result.bounds.unwrap();
        assert_eq!((bounds.min, bounds.max), (3, 4));
        for (id, totals) in result.stats.iter() {
            assert!(bounds.contains(totals.count), "cluster {} has {}", id, totals.count);
        }
    }

    #[test]
    fn test_three_equal_streets() {
        let mut records = street("Rue A", 10, 43.60, 3.80);
        records.extend(street("Rue B", 10, 43.70, 3.90));
        records.extend(street("Rue C", 10, 43.50, 4.00));

        let result =
            partition(&records, &config(3, ClusteringMethod::BalancedCount), &StreetConfig::default()).unwrap();

        for id in 0..3 {
            assert_eq!(result.stats.get(id).map(|t| t.count), Some(10));
        }
        let ids: BTreeSet<usize> = result.streets.iter().map(|s| s.cluster).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_single_circuit() {
        let records = city();
        for method in ClusteringMethod::ALL {
            let result = partition(&records, &config(1, method), &StreetConfig::default()).unwrap();
            assert!(result.addresses.iter().all(|a| a.cluster == 0));
            let totals = result.stats.get(0).unwrap();
            assert_eq!(totals.count, records.len() as u64);
            let length: u64 = result.streets.iter().map(|s| s.summary.length).sum();
            assert_eq!(totals.length, length);
        }

        // Single-address streets without a number have a zero length.
        let records = vec![
            AddressRecord::new("Place A", None, "34000", "Montpellier", 43.60, 3.80),
            AddressRecord::new("Place B", None, "34000", "Montpellier", 43.70, 3.90),
        ];
        for method in ClusteringMethod::ALL {
            let result = partition(&records, &config(1, method), &StreetConfig::default()).unwrap();
            assert!(result.addresses.iter().all(|a| a.cluster == 0), "{}", method);
            assert_eq!(result.stats.get(0).map(|t| (t.count, t.length)), Some((2, 0)), "{}", method);
            assert!(result.out_of_bounds.is_empty());
        }
    }

    #[test]
    fn test_zero_length_city_still_uses_every_circuit() {
        let records = vec![
            AddressRecord::new("Place A", None, "34000", "Montpellier", 43.60, 3.80),
            AddressRecord::new("Place B", None, "34000", "Montpellier", 43.70, 3.90),
        ];
        let result =
            partition(&records, &config(2, ClusteringMethod::BalancedLength), &StreetConfig::default()).unwrap();
        let ids: BTreeSet<usize> = result.addresses.iter().map(|a| a.cluster).collect();
        assert_eq!(ids, (0..2).collect::<BTreeSet<_>>());
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, PipelineWarning::MetricAllZero { .. })));
    }

    #[test]
    fn test_multi_address_streets_stay_within_bounds() {
        // Streets of 1, 2 and 3 addresses: folding moves whole streets, and
        // the rebalanced circuits still respect the count bounds.
        let records = city();
        let mut circuits = config(3, ClusteringMethod::BalancedCount);
        circuits.tolerance = 0.25;
        let result = partition(&records, &circuits, &StreetConfig::default()).unwrap();

        let bounds = result.bounds.unwrap();
        assert_eq!((bounds.min, bounds.max), (6, 10));
        assert!(result.out_of_bounds.is_empty());
        for (id, totals) in result.stats.iter() {
            assert!(bounds.contains(totals.count), "circuit {} has {}", id, totals.count);
        }
    }

    #[test]
    fn test_empty_city() {
        let result =
            partition(&[], &config(3, ClusteringMethod::BalancedCount), &StreetConfig::default()).unwrap();
        assert!(result.addresses.is_empty());
        assert!(result.stats.is_empty());
        assert_eq!(result.warnings, vec![PipelineWarning::EmptyInput]);
    }

    #[test]
    fn test_bogus_method_fails_before_any_work() {
        let provider = CountingProvider {
            calls: Cell::new(0),
            records: city(),
        };
        let request = PartitionRequest {
            city_name: "Montpellier".to_string(),
            dep_code: "34".to_string(),
            cluster_nbr: 3,
            clustering_method: "bogus".to_string(),
            cluster_colors: Vec::new(),
        };

        match request.run(&provider, &PipelineConfig::default()) {
            Err(TerritoryError::InvalidMethod(UnknownMethod(name))) => assert_eq!(name, "bogus"),
            other => panic!("expected InvalidMethod, got {:?}", other.map(|r| r.stats)),
        }
        assert_eq!(provider.calls.get(), 0);
    }

    #[test]
    fn test_too_few_streets() {
        let records = street("Rue A", 4, 43.6, 3.8);
        assert!(matches!(
            partition(&records, &config(2, ClusteringMethod::KMeans), &StreetConfig::default()),
            Err(TerritoryError::TooFewStreets {
                streets: 1,
                clusters: 2
            })
        ));
    }

    #[test]
    fn test_invalid_config() {
        let mut circuits = config(2, ClusteringMethod::BalancedCount);
        circuits.tolerance = 2.0;
        assert!(matches!(
            partition(&city(), &circuits, &StreetConfig::default()),
            Err(TerritoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_request_builds_styles() {
        let request = PartitionRequest {
            city_name: "Montpellier".to_string(),
            dep_code: "34".to_string(),
            cluster_nbr: 2,
            clustering_method: "balanced_length".to_string(),
            cluster_colors: vec!["#ff0000".to_string(), "#00ff00".to_string()],
        };
        let circuits = request.to_config(&CircuitConfig::default()).unwrap();
        assert_eq!(circuits.method, ClusteringMethod::BalancedLength);
        assert_eq!(circuits.n_circuits, 2);
        assert_eq!(circuits.style(1).color.as_deref(), Some("#00ff00"));
        assert_eq!(circuits.seed, 42);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{"city_name": "Sète", "dep_code": "34", "cluster_nbr": 4}"#;
        let request: PartitionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.clustering_method, "kmeans");
        assert!(request.cluster_colors.is_empty());
    }

    #[test]
    fn test_request_through_directory_provider() {
        let dir = tempdir().unwrap();
        let mut csv = String::from("nom_voie;numero;rep;code_postal;nom_commune;lat;lon\n");
        for (street, lat) in [("Rue A", 43.60), ("Rue B", 43.70)] {
            for n in 1..=3 {
                csv.push_str(&format!("{};{};;34000;Montpellier;{};3.8\n", street, n, lat));
            }
        }
        csv.push_str("Rue Z;1;;34200;Sète;43.4;3.7\n");
        fs::write(dir.path().join("adresses-34.csv"), csv).unwrap();

        let provider = CsvDirectoryProvider::new(dir.path(), DataConfig::default());
        let request = PartitionRequest {
            city_name: "Montpellier".to_string(),
            dep_code: "34".to_string(),
            cluster_nbr: 2,
            clustering_method: "balanced_count".to_string(),
            cluster_colors: Vec::new(),
        };
        let result = request.run(&provider, &PipelineConfig::default()).unwrap();
        assert_eq!(result.addresses.len(), 6);
        assert_eq!(result.stats.get(0).map(|t| t.count), Some(3));
        assert_eq!(result.stats.get(1).map(|t| t.count), Some(3));

        // Unknown department data is an empty city, not an error.
        let missing = PartitionRequest {
            dep_code: "30".to_string(),
            ..request
        };
        let result = missing.run(&provider, &PipelineConfig::default()).unwrap();
        assert!(result.addresses.is_empty());
    }

    #[test]
    fn test_process_address_file_writes_outputs() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("adresses-34.csv");
        let mut csv = String::from("nom_voie;numero;rep;code_postal;nom_commune;lat;lon\n");
        for (street, lat) in [("Rue A", 43.60), ("Rue B", 43.70), ("Rue C", 43.80)] {
            for n in 1..=2 {
                csv.push_str(&format!("{};{};;34000;Montpellier;{};3.8\n", street, n, lat));
            }
        }
        fs::write(&input, csv).unwrap();

        let mut config = PipelineConfig::default();
        config.circuits = config_with(3);
        let out = dir.path().join("out");
        let (files, result) = process_address_file(&input, &out, Some("Montpellier"), &config).unwrap();

        assert_eq!(result.addresses.len(), 6);
        let addresses = fs::read_to_string(&files.addresses).unwrap();
        assert_eq!(addresses.lines().count(), 7);
        let streets = fs::read_to_string(&files.streets).unwrap();
        assert_eq!(streets.lines().count(), 4);
        let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&files.report).unwrap()).unwrap();
        assert_eq!(report["stats"]["2"]["count"], 2);
        assert!(report["warnings"].as_array().unwrap().is_empty());
        assert!(report["out_of_bounds"].as_array().unwrap().is_empty());
    }

    fn config_with(k: usize) -> CircuitConfig {
        config(k, ClusteringMethod::BalancedCount)
    }
}
