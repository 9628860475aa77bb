//! Configuration types for the circuit pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Street quantity whose per-circuit sum is balanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMetric {
    /// Number of addresses on the street.
    Count,
    /// Estimated street length.
    Length,
}

impl fmt::Display for BalanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceMetric::Count => write!(f, "count"),
            BalanceMetric::Length => write!(f, "length"),
        }
    }
}

/// Clustering method selector.
///
/// Balanced methods run the constrained engine, the others run the
/// weighted engine (unweighted for plain `kmeans`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClusteringMethod {
    #[default]
    #[serde(rename = "kmeans")]
    KMeans,
    #[serde(rename = "balanced_count")]
    BalancedCount,
    #[serde(rename = "balanced_length")]
    BalancedLength,
    #[serde(rename = "weighted_count")]
    WeightedCount,
    #[serde(rename = "weighted_length")]
    WeightedLength,
}

/// Engine a method resolves to, with its metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Hard size bounds on the replicated metric.
    Constrained(BalanceMetric),
    /// Centroid clustering, optionally weighted by a metric.
    Weighted(Option<BalanceMetric>),
}

impl ClusteringMethod {
    pub const ALL: [ClusteringMethod; 5] = [
        ClusteringMethod::KMeans,
        ClusteringMethod::BalancedCount,
        ClusteringMethod::BalancedLength,
        ClusteringMethod::WeightedCount,
        ClusteringMethod::WeightedLength,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusteringMethod::KMeans => "kmeans",
            ClusteringMethod::BalancedCount => "balanced_count",
            ClusteringMethod::BalancedLength => "balanced_length",
            ClusteringMethod::WeightedCount => "weighted_count",
            ClusteringMethod::WeightedLength => "weighted_length",
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            ClusteringMethod::KMeans => Strategy::Weighted(None),
            ClusteringMethod::BalancedCount => Strategy::Constrained(BalanceMetric::Count),
            ClusteringMethod::BalancedLength => Strategy::Constrained(BalanceMetric::Length),
            ClusteringMethod::WeightedCount => Strategy::Weighted(Some(BalanceMetric::Count)),
            ClusteringMethod::WeightedLength => Strategy::Weighted(Some(BalanceMetric::Length)),
        }
    }
}

impl fmt::Display for ClusteringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised clustering method name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown clustering method '{0}' (expected one of: kmeans, balanced_count, balanced_length, weighted_count, weighted_length)")]
pub struct UnknownMethod(pub String);

impl FromStr for ClusteringMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClusteringMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// How a street whose replicas landed in several clusters is folded back
/// to a single cluster id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldPolicy {
    /// Cluster holding the most replicas, lowest id on ties.
    #[default]
    Majority,
    /// Label of the first replica, replicas ordered by cluster id.
    First,
}

/// Display attributes of one circuit. Not used by the algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStyle {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Configuration for circuit partitioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Number of circuits to produce
    #[serde(default = "default_n_circuits")]
    pub n_circuits: usize,

    /// Clustering method
    #[serde(default)]
    pub method: ClusteringMethod,

    /// Allowed fractional deviation from the ideal split (balanced methods only)
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Random seed for centre initialisation
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Restarts of the constrained engine
    #[serde(default = "default_n_init")]
    pub n_init: usize,

    /// Maximum iterations per run
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Convergence tolerance, relative to the data variance
    #[serde(default = "default_tol")]
    pub tol: f64,

    /// Replica fold-back policy (balanced methods only)
    #[serde(default)]
    pub fold_policy: FoldPolicy,

    /// Per-circuit display names and colors
    #[serde(default)]
    pub styles: Vec<CircuitStyle>,
}

fn default_n_circuits() -> usize {
    1
}

fn default_tolerance() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_n_init() -> usize {
    10
}

fn default_max_iter() -> usize {
    300
}

fn default_tol() -> f64 {
    1e-4
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            n_circuits: default_n_circuits(),
            method: ClusteringMethod::default(),
            tolerance: default_tolerance(),
            seed: default_seed(),
            n_init: default_n_init(),
            max_iter: default_max_iter(),
            tol: default_tol(),
            fold_policy: FoldPolicy::default(),
            styles: Vec::new(),
        }
    }
}

impl CircuitConfig {
    /// Shorthand for a config with `n` circuits and the given method.
    pub fn new(n_circuits: usize, method: ClusteringMethod) -> Self {
        Self {
            n_circuits,
            method,
            ..Self::default()
        }
    }

    /// Display style of circuit `i`, falling back to "Cluster {i+1}".
    pub fn style(&self, i: usize) -> CircuitStyle {
        self.styles.get(i).cloned().unwrap_or_else(|| CircuitStyle {
            name: format!("Cluster {}", i + 1),
            color: None,
        })
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_circuits == 0 {
            return Err("n_circuits must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.tolerance) {
            return Err(format!(
                "tolerance must lie in [0, 1], got {}",
                self.tolerance
            ));
        }
        if self.n_init == 0 {
            return Err("n_init must be at least 1".to_string());
        }
        if self.max_iter == 0 {
            return Err("max_iter must be at least 1".to_string());
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(format!("tol must be a non-negative number, got {}", self.tol));
        }
        Ok(())
    }
}

/// Column names of the address table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    #[serde(default = "default_street_column")]
    pub street: String,
    #[serde(default = "default_number_column")]
    pub number: String,
    #[serde(default = "default_suffix_column")]
    pub suffix: String,
    #[serde(default = "default_postal_code_column")]
    pub postal_code: String,
    #[serde(default = "default_city_column")]
    pub city: String,
    #[serde(default = "default_lat_column")]
    pub lat: String,
    #[serde(default = "default_lon_column")]
    pub lon: String,
}

fn default_street_column() -> String {
    "nom_voie".to_string()
}

fn default_number_column() -> String {
    "numero".to_string()
}

fn default_suffix_column() -> String {
    "rep".to_string()
}

fn default_postal_code_column() -> String {
    "code_postal".to_string()
}

fn default_city_column() -> String {
    "nom_commune".to_string()
}

fn default_lat_column() -> String {
    "lat".to_string()
}

fn default_lon_column() -> String {
    "lon".to_string()
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            street: default_street_column(),
            number: default_number_column(),
            suffix: default_suffix_column(),
            postal_code: default_postal_code_column(),
            city: default_city_column(),
            lat: default_lat_column(),
            lon: default_lon_column(),
        }
    }
}

/// Configuration for reading address tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Field delimiter of the address CSV
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    #[serde(default)]
    pub columns: ColumnConfig,
}

fn default_delimiter() -> char {
    ';'
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            columns: ColumnConfig::default(),
        }
    }
}

/// Parameters of the street length estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreetConfig {
    /// IQR multiplier for the single-outlier detector
    #[serde(default = "default_iqr_factor")]
    pub iqr_factor: f64,

    /// Median number gap below which a street is a center street
    #[serde(default = "default_center_gap_threshold")]
    pub center_gap_threshold: f64,
}

fn default_iqr_factor() -> f64 {
    5.0
}

fn default_center_gap_threshold() -> f64 {
    3.0
}

impl Default for StreetConfig {
    fn default() -> Self {
        Self {
            iqr_factor: default_iqr_factor(),
            center_gap_threshold: default_center_gap_threshold(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub circuits: CircuitConfig,

    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub streets: StreetConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_circuit_config() {
        let config = CircuitConfig::default();
        assert_eq!(config.n_circuits, 1);
        assert_eq!(config.method, ClusteringMethod::KMeans);
        assert_eq!(config.tolerance, 0.1);
        assert_eq!(config.seed, 42);
        assert_eq!(config.n_init, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.data.delimiter, ';');
        assert_eq!(config.data.columns.street, "nom_voie");
        assert_eq!(config.streets.iqr_factor, 5.0);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(
            "balanced_length".parse::<ClusteringMethod>(),
            Ok(ClusteringMethod::BalancedLength)
        );
        assert_eq!("kmeans".parse::<ClusteringMethod>(), Ok(ClusteringMethod::KMeans));
        assert_eq!(
            "bogus".parse::<ClusteringMethod>(),
            Err(UnknownMethod("bogus".to_string()))
        );
        for method in ClusteringMethod::ALL {
            assert_eq!(method.as_str().parse::<ClusteringMethod>(), Ok(method));
        }
    }

    #[test]
    fn test_method_strategy() {
        assert_eq!(ClusteringMethod::KMeans.strategy(), Strategy::Weighted(None));
        assert_eq!(
            ClusteringMethod::BalancedCount.strategy(),
            Strategy::Constrained(BalanceMetric::Count)
        );
        assert_eq!(
            ClusteringMethod::WeightedLength.strategy(),
            Strategy::Weighted(Some(BalanceMetric::Length))
        );
    }

    #[test]
    fn test_yaml_partial_config() {
        let yaml = "circuits:\n  n_circuits: 4\n  method: balanced_count\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.circuits.n_circuits, 4);
        assert_eq!(config.circuits.method, ClusteringMethod::BalancedCount);
        assert_eq!(config.circuits.tolerance, 0.1);
        assert_eq!(config.data.columns.lat, "lat");
    }

    #[test]
    fn test_yaml_rejects_unknown_method() {
        let yaml = "circuits:\n  method: bogus\n";
        assert!(serde_yaml::from_str::<PipelineConfig>(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CircuitConfig::new(0, ClusteringMethod::KMeans).validate().is_err());

        let mut config = CircuitConfig::default();
        config.tolerance = 1.5;
        assert!(config.validate().is_err());

        config.tolerance = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_style_fallback() {
        let mut config = CircuitConfig::new(2, ClusteringMethod::KMeans);
        config.styles.push(CircuitStyle {
            name: "North".to_string(),
            color: Some("#ff0000".to_string()),
        });
        assert_eq!(config.style(0).name, "North");
        assert_eq!(config.style(1).name, "Cluster 2");
        assert_eq!(config.style(1).color, None);
    }

    #[test]
    fn test_yaml_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        let mut config = PipelineConfig::default();
        config.circuits.n_circuits = 3;
        config.circuits.fold_policy = FoldPolicy::First;
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.circuits.n_circuits, 3);
        assert_eq!(loaded.circuits.fold_policy, FoldPolicy::First);
    }
}
