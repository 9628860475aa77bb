//! Core data types and I/O operations.

pub mod loaders;
pub mod transforms;
pub mod writers;

pub use loaders::{AddressProvider, AddressRecord, CsvDirectoryProvider, LoaderError};
pub use writers::{write_addresses_csv, write_clustered_streets_csv, write_json, write_streets_csv, WriteError};
