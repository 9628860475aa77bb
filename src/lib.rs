//! Balanced territory partitioning of geocoded city addresses.
//!
//! This crate provides tools for:
//! - Loading address tables (national address base CSV layout)
//! - Summarising addresses per street, with a length estimate from house
//!   numbering or geometry
//! - Splitting a city into `k` circuits that balance address count or
//!   street length under a size tolerance (min-cost-flow constrained k-means)
//! - Plain and metric-weighted k-means over streets
//!
//! # Example
//!
//! ```no_run
//! use circuit_pipeline::config::{CircuitConfig, ClusteringMethod, StreetConfig};
//! use circuit_pipeline::core::loaders::load_address_csv;
//! use circuit_pipeline::processors::territory::partition;
//!
//! let records = load_address_csv("adresses-34.csv", &Default::default()).unwrap();
//! let circuits = CircuitConfig::new(4, ClusteringMethod::BalancedLength);
//! let result = partition(&records, &circuits, &StreetConfig::default()).unwrap();
//! println!("{}", result.stats);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;

pub use config::{BalanceMetric, CircuitConfig, ClusteringMethod, DataConfig, PipelineConfig, StreetConfig};
pub use core::loaders::AddressRecord;
pub use processors::territory::{partition, PartitionRequest, PartitionResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
