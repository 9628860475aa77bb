//! Data loaders for address tables.
//!
//! This module provides:
//! - The `AddressRecord` type, one geocoded address point
//! - Schema-checked CSV parsing of address tables (national address base layout)
//! - City filtering and department-code validation
//! - The `AddressProvider` seam used to fetch one city's addresses

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DataConfig;

/// Errors that can occur during address loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Parse error on line {line}: invalid {field} value '{value}'")]
    ParseError {
        line: u64,
        field: String,
        value: String,
    },

    #[error("Invalid department: {0}. Must be 01-95, 971-989, or 2A/2B.")]
    InvalidDepartment(String),

    #[error("Delimiter must be a single-byte character, got '{0}'")]
    InvalidDelimiter(char),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// One geocoded address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Street name, the grouping key of the street aggregator.
    pub street: String,
    /// House number, absent for named places without numbering.
    pub number: Option<u32>,
    /// Number suffix such as "bis" or "ter".
    pub suffix: Option<String>,
    pub postal_code: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

impl AddressRecord {
    /// Creates a record with no number suffix.
    pub fn new(
        street: impl Into<String>,
        number: Option<u32>,
        postal_code: impl Into<String>,
        city: impl Into<String>,
        lat: f64,
        lon: f64,
    ) -> Self {
        Self {
            street: street.into(),
            number,
            suffix: None,
            postal_code: postal_code.into(),
            city: city.into(),
            lat,
            lon,
        }
    }

    /// Human-readable address line, e.g. `"12 bis, Rue Neuve, 34000 Montpellier"`.
    ///
    /// Absent parts are skipped along with their separators.
    pub fn label(&self) -> String {
        let mut parts = Vec::with_capacity(2);
        if let Some(number) = self.number {
            match self.suffix.as_deref().filter(|s| !s.is_empty()) {
                Some(suffix) => parts.push(format!("{} {}", number, suffix)),
                None => parts.push(number.to_string()),
            }
        }
        if !self.street.is_empty() {
            parts.push(self.street.clone());
        }
        let line = parts.join(", ");
        let locality = format!("{} {}", self.postal_code, self.city);
        format!("{}, {}", line, locality.trim())
            .trim_matches(|c| c == ',' || c == ' ')
            .to_string()
    }
}

/// Column positions resolved from a header row.
struct ColumnIndex {
    street: usize,
    number: usize,
    suffix: Option<usize>,
    postal_code: usize,
    city: usize,
    lat: usize,
    lon: usize,
}

impl ColumnIndex {
    /// Resolve configured column names, collecting every missing one.
    ///
    /// The suffix column is optional; all others are required.
    fn resolve(headers: &csv::StringRecord, config: &DataConfig) -> Result<Self> {
        let positions: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim(), i))
            .collect();

        let cols = &config.columns;
        let mut missing = Vec::new();
        let mut require = |name: &str| match positions.get(name) {
            Some(&i) => i,
            None => {
                missing.push(name.to_string());
                usize::MAX
            }
        };

        let street = require(&cols.street);
        let number = require(&cols.number);
        let postal_code = require(&cols.postal_code);
        let city = require(&cols.city);
        let lat = require(&cols.lat);
        let lon = require(&cols.lon);

        if !missing.is_empty() {
            return Err(LoaderError::MissingColumns(missing));
        }

        Ok(Self {
            street,
            number,
            suffix: positions.get(cols.suffix.as_str()).copied(),
            postal_code,
            city,
            lat,
            lon,
        })
    }
}

fn parse_coordinate(raw: &str, field: &str, line: u64) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LoaderError::ParseError {
            line,
            field: field.to_string(),
            value: raw.to_string(),
        })
}

/// House numbers may be exported as floats ("12.0"); empty means absent.
fn parse_number(raw: &str, line: u64) -> Result<Option<u32>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(Some(n));
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
            Ok(Some(v as u32))
        }
        _ => Err(LoaderError::ParseError {
            line,
            field: "number".to_string(),
            value: raw.to_string(),
        }),
    }
}

fn optional_text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

/// Parse address records from any CSV source.
///
/// # Errors
///
/// Returns `MissingColumns` listing every configured column absent from
/// the header, or `ParseError` for malformed coordinates/numbers.
pub fn read_addresses<R: Read>(source: R, config: &DataConfig) -> Result<Vec<AddressRecord>> {
    if !config.delimiter.is_ascii() {
        return Err(LoaderError::InvalidDelimiter(config.delimiter));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(config.delimiter as u8)
        .from_reader(source);

    let headers = reader.headers()?.clone();
    let idx = ColumnIndex::resolve(&headers, config)?;

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let line = row.position().map_or(0, |p| p.line());
        let field = |i: usize| row.get(i).unwrap_or("");

        records.push(AddressRecord {
            street: field(idx.street).trim().to_string(),
            number: parse_number(field(idx.number), line)?,
            suffix: optional_text(idx.suffix.and_then(|i| row.get(i))),
            postal_code: field(idx.postal_code).trim().to_string(),
            city: field(idx.city).trim().to_string(),
            lat: parse_coordinate(field(idx.lat), "lat", line)?,
            lon: parse_coordinate(field(idx.lon), "lon", line)?,
        });
    }

    Ok(records)
}

/// Load address records from a CSV file.
///
/// # Example
///
/// ```no_run
/// use circuit_pipeline::config::DataConfig;
/// use circuit_pipeline::core::loaders::load_address_csv;
///
/// let records = load_address_csv("adresses-34.csv", &DataConfig::default()).unwrap();
/// println!("{} addresses", records.len());
/// ```
pub fn load_address_csv<P: AsRef<Path>>(path: P, config: &DataConfig) -> Result<Vec<AddressRecord>> {
    let file = File::open(path.as_ref())?;
    read_addresses(BufReader::new(file), config)
}

/// Keep only the records of one city, matched exactly on city name.
pub fn filter_city(records: Vec<AddressRecord>, city: &str) -> Vec<AddressRecord> {
    records.into_iter().filter(|r| r.city == city).collect()
}

/// Normalise a French department code.
///
/// Accepts `2A`/`2B` in any case, `1`-`95` and `971`-`989`; single digits
/// are zero-padded.
pub fn validate_department(code: &str) -> Result<String> {
    let code = code.trim().to_uppercase();
    if code == "2A" || code == "2B" {
        return Ok(code);
    }
    if !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(num) = code.parse::<u32>() {
            if (1..=95).contains(&num) || (971..=989).contains(&num) {
                return Ok(format!("{:0>2}", code));
            }
        }
    }
    log::error!("Invalid department: {}", code);
    Err(LoaderError::InvalidDepartment(code))
}

/// Source of one city's address records.
///
/// Implementations return an empty table when the data is unavailable
/// rather than failing; the pipeline turns that into an empty result.
pub trait AddressProvider {
    fn addresses(&self, city: &str, department: &str) -> Vec<AddressRecord>;
}

/// Provider reading department tables from a local directory.
///
/// A table is `adresses-{dep}.csv.gz` (the national base download, gzip
/// compressed) or, failing that, a plain `adresses-{dep}.csv`.
#[derive(Debug, Clone)]
pub struct CsvDirectoryProvider {
    pub directory: PathBuf,
    pub config: DataConfig,
}

impl CsvDirectoryProvider {
    pub fn new(directory: impl Into<PathBuf>, config: DataConfig) -> Self {
        Self {
            directory: directory.into(),
            config,
        }
    }

    /// Path of the table for a (validated) department code.
    ///
    /// The compressed table wins when both exist. Returns the compressed
    /// name when neither exists.
    pub fn table_path(&self, department: &str) -> Result<PathBuf> {
        let department = validate_department(department)?;
        let compressed = self.directory.join(format!("adresses-{}.csv.gz", department));
        let plain = self.directory.join(format!("adresses-{}.csv", department));
        Ok(if !compressed.exists() && plain.exists() {
            plain
        } else {
            compressed
        })
    }
}

/// Load address records from a gzip-compressed CSV file.
pub fn load_address_csv_gz<P: AsRef<Path>>(path: P, config: &DataConfig) -> Result<Vec<AddressRecord>> {
    let file = File::open(path.as_ref())?;
    read_addresses(GzDecoder::new(BufReader::new(file)), config)
}

/// Load an address table, decompressing it when the name ends in `.gz`.
pub fn load_address_table<P: AsRef<Path>>(path: P, config: &DataConfig) -> Result<Vec<AddressRecord>> {
    let path = path.as_ref();
    if path.extension().is_some_and(|ext| ext == "gz") {
        load_address_csv_gz(path, config)
    } else {
        load_address_csv(path, config)
    }
}

impl AddressProvider for CsvDirectoryProvider {
    fn addresses(&self, city: &str, department: &str) -> Vec<AddressRecord> {
        let path = match self.table_path(department) {
            Ok(path) => path,
            Err(e) => {
                log::error!("Cannot locate address data for {}: {}", department, e);
                return Vec::new();
            }
        };

        if !path.exists() {
            log::error!("Address data file does not exist: {}", path.display());
            return Vec::new();
        }

        match load_address_table(&path, &self.config) {
            Ok(records) => {
                log::info!(
                    "Loaded {} address rows from {}",
                    records.len(),
                    path.display()
                );
                filter_city(records, city)
            }
            Err(e) => {
                log::error!("Failed to read address data {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const HEADER: &str = "id;numero;rep;nom_voie;code_postal;nom_commune;lon;lat";

    fn write_table(rows: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_address_csv() -> Result<()> {
        let file = write_table(&[
            "a1;12;bis;Rue Neuve;34000;Montpellier;3.8767;43.6108",
            "a2;;;Rue Neuve;34000;Montpellier;3.8770;43.6110",
            "a3;7.0;;Avenue de Toulouse;34070;Montpellier;3.8600;43.5900",
        ]);

        let records = load_address_csv(file.path(), &DataConfig::default())?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].street, "Rue Neuve");
        assert_eq!(records[0].number, Some(12));
        assert_eq!(records[0].suffix.as_deref(), Some("bis"));
        assert_eq!(records[0].lat, 43.6108);
        assert_eq!(records[0].lon, 3.8767);
        assert_eq!(records[1].number, None);
        assert_eq!(records[1].suffix, None);
        assert_eq!(records[2].number, Some(7));
        assert_eq!(records[2].postal_code, "34070");

        Ok(())
    }

    #[test]
    fn test_missing_columns_are_all_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "numero;nom_commune;code_postal").unwrap();
        writeln!(file, "1;Montpellier;34000").unwrap();
        file.flush().unwrap();

        match load_address_csv(file.path(), &DataConfig::default()) {
            Err(LoaderError::MissingColumns(cols)) => {
                assert_eq!(cols, vec!["nom_voie", "lat", "lon"]);
            }
            other => panic!("expected MissingColumns, got {:?}", other),
        }
    }

    #[test]
    fn test_suffix_column_is_optional() -> Result<()> {
        let data = "numero,nom_voie,code_postal,nom_commune,lat,lon\n3,Rue A,34000,Montpellier,43.6,3.8\n";
        let mut config = DataConfig::default();
        config.delimiter = ',';
        let records = read_addresses(data.as_bytes(), &config)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].suffix, None);
        Ok(())
    }

    #[test]
    fn test_invalid_coordinate_is_a_parse_error() {
        let file = write_table(&["a1;1;;Rue A;34000;Montpellier;abc;43.6"]);
        match load_address_csv(file.path(), &DataConfig::default()) {
            Err(LoaderError::ParseError { field, value, .. }) => {
                assert_eq!(field, "lon");
                assert_eq!(value, "abc");
            }
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_city() {
        let records = vec![
            AddressRecord::new("Rue A", Some(1), "34000", "Montpellier", 43.6, 3.8),
            AddressRecord::new("Rue B", Some(2), "34500", "Béziers", 43.3, 3.2),
        ];
        let kept = filter_city(records, "Béziers");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].street, "Rue B");
    }

    #[test]
    fn test_address_label() {
        let mut record = AddressRecord::new("Rue Neuve", Some(12), "34000", "Montpellier", 43.6, 3.8);
        assert_eq!(record.label(), "12, Rue Neuve, 34000 Montpellier");

        record.suffix = Some("bis".to_string());
        assert_eq!(record.label(), "12 bis, Rue Neuve, 34000 Montpellier");

        record.number = None;
        assert_eq!(record.label(), "Rue Neuve, 34000 Montpellier");
    }

    #[test]
    fn test_validate_department() {
        assert_eq!(validate_department("34").unwrap(), "34");
        assert_eq!(validate_department("1").unwrap(), "01");
        assert_eq!(validate_department("2a").unwrap(), "2A");
        assert_eq!(validate_department("974").unwrap(), "974");
        assert!(validate_department("96").is_err());
        assert!(validate_department("0").is_err());
        assert!(validate_department("2C").is_err());
        assert!(validate_department("").is_err());
    }

    #[test]
    fn test_provider_returns_empty_when_unavailable() {
        let dir = TempDir::new().unwrap();
        let provider = CsvDirectoryProvider::new(dir.path(), DataConfig::default());
        assert!(provider.addresses("Montpellier", "34").is_empty());
        assert!(provider.addresses("Montpellier", "999").is_empty());
    }

    #[test]
    fn test_provider_filters_city() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adresses-34.csv");
        std::fs::write(
            &path,
            format!(
                "{}\na1;1;;Rue A;34000;Montpellier;3.8;43.6\na2;2;;Rue B;34500;Béziers;3.2;43.3\n",
                HEADER
            ),
        )
        .unwrap();

        let provider = CsvDirectoryProvider::new(dir.path(), DataConfig::default());
        let records = provider.addresses("Montpellier", "34");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].city, "Montpellier");
    }

    fn write_gz_table(path: &Path, rows: &[&str]) {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        writeln!(encoder, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(encoder, "{}", row).unwrap();
        }
        encoder.finish().unwrap();
    }

    #[test]
    fn test_provider_reads_compressed_table() {
        let dir = TempDir::new().unwrap();
        write_gz_table(
            &dir.path().join("adresses-34.csv.gz"),
            &[
                "a1;1;;Rue A;34000;Montpellier;3.8;43.6",
                "a2;3;;Rue A;34000;Montpellier;3.8;43.6",
                "a3;2;;Rue B;34500;Béziers;3.2;43.3",
            ],
        );

        let provider = CsvDirectoryProvider::new(dir.path(), DataConfig::default());
        assert!(provider.table_path("34").unwrap().ends_with("adresses-34.csv.gz"));
        let records = provider.addresses("Montpellier", "34");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].number, Some(3));
    }

    #[test]
    fn test_compressed_table_wins_over_plain() {
        let dir = TempDir::new().unwrap();
        write_gz_table(
            &dir.path().join("adresses-34.csv.gz"),
            &["a1;1;;Rue Gz;34000;Montpellier;3.8;43.6"],
        );
        std::fs::write(
            dir.path().join("adresses-34.csv"),
            format!("{}\na1;1;;Rue Plain;34000;Montpellier;3.8;43.6\n", HEADER),
        )
        .unwrap();

        let provider = CsvDirectoryProvider::new(dir.path(), DataConfig::default());
        let records = provider.addresses("Montpellier", "34");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].street, "Rue Gz");
    }
}
