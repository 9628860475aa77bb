//! Writers for partition outputs.
//!
//! - Annotated addresses as CSV (input columns plus `cluster`)
//! - Street summaries as CSV, optionally with their cluster
//! - Any serializable report (cluster stats, warnings) as pretty JSON

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::processors::assignment::AnnotatedAddress;
use crate::processors::streets::{ClusteredStreet, StreetSummary};

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// JSON serialization error.
    #[error("JSON write error for '{path}': {source}")]
    JsonError {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Opens a CSV writer and writes its header row.
fn csv_writer(path: &Path, delimiter: u8, header: &[&str]) -> Result<csv::Writer<BufWriter<File>>> {
    ensure_parent_dirs(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(create_buffered_writer(path)?);
    writer.write_record(header).map_err(|e| WriteError::CsvError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(writer)
}

fn finish_csv(mut writer: csv::Writer<BufWriter<File>>, path: &Path) -> Result<()> {
    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Write annotated addresses to CSV.
///
/// Columns: `street, number, suffix, postal_code, city, lat, lon, label,
/// cluster`. Absent numbers and suffixes are written as empty fields.
///
/// # Errors
///
/// Returns an error if the file or its parent directories cannot be
/// created, or a row cannot be written.
///
/// # Example
///
/// ```no_run
/// use circuit_pipeline::core::writers::write_addresses_csv;
/// use std::path::Path;
///
/// write_addresses_csv(Path::new("addresses.csv"), &[], b';').unwrap();
/// ```
pub fn write_addresses_csv(path: &Path, addresses: &[AnnotatedAddress], delimiter: u8) -> Result<()> {
    let header = [
        "street",
        "number",
        "suffix",
        "postal_code",
        "city",
        "lat",
        "lon",
        "label",
        "cluster",
    ];
    let mut writer = csv_writer(path, delimiter, &header)?;
    let path_str = path.display().to_string();

    for address in addresses {
        let r = &address.record;
        writer
            .write_record(&[
                r.street.clone(),
                r.number.map(|n| n.to_string()).unwrap_or_default(),
                r.suffix.clone().unwrap_or_default(),
                r.postal_code.clone(),
                r.city.clone(),
                format!("{:.7}", r.lat),
                format!("{:.7}", r.lon),
                r.label(),
                address.cluster.to_string(),
            ])
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    finish_csv(writer, path)
}

fn street_row(summary: &StreetSummary) -> Vec<String> {
    vec![
        summary.street.clone(),
        summary.count.to_string(),
        summary.length.to_string(),
        format!("{:.7}", summary.lat),
        format!("{:.7}", summary.lon),
    ]
}

const STREET_HEADER: [&str; 5] = ["street", "count", "length", "lat", "lon"];

/// Write street summaries to CSV (`street, count, length, lat, lon`).
pub fn write_streets_csv(path: &Path, streets: &[StreetSummary], delimiter: u8) -> Result<()> {
    let mut writer = csv_writer(path, delimiter, &STREET_HEADER)?;
    let path_str = path.display().to_string();

    for street in streets {
        writer
            .write_record(street_row(street))
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    finish_csv(writer, path)
}

/// Write clustered street summaries to CSV, with a trailing `cluster` column.
pub fn write_clustered_streets_csv(path: &Path, streets: &[ClusteredStreet], delimiter: u8) -> Result<()> {
    let mut header = STREET_HEADER.to_vec();
    header.push("cluster");
    let mut writer = csv_writer(path, delimiter, &header)?;
    let path_str = path.display().to_string();

    for street in streets {
        let mut row = street_row(&street.summary);
        row.push(street.cluster.to_string());
        writer.write_record(row).map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;
    }

    finish_csv(writer, path)
}

/// Write any serializable value as pretty-printed JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();

    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| WriteError::JsonError {
        path: path_str.clone(),
        source: e,
    })?;
    writeln!(writer).map_err(|e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    })?;
    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })
}
