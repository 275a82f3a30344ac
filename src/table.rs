//! CSV table persistence for pipeline artifacts.
//!
//! Reads validate the header against the table's column contract before any
//! row is decoded. Writes go to a hidden sibling file which is renamed into
//! place once complete, so a reader sees either the old table or the new one.
//! Paths ending in `.gz` are transparently gzip-compressed.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::PipelineError;

/// A row type with a fixed, named column contract.
///
/// `COLUMNS` lists the columns a reader requires. For tables the pipeline
/// writes itself it is the full header in serialization order.
pub trait Table: Serialize + DeserializeOwned {
    const NAME: &'static str;
    const COLUMNS: &'static [&'static str];
}

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if is_gzip(path) {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Fails with [`PipelineError::MissingColumn`] naming the first absent column.
pub fn check_columns<T: Table>(headers: &StringRecord) -> Result<(), PipelineError> {
    for column in T::COLUMNS {
        if !headers.iter().any(|h| h == *column) {
            return Err(PipelineError::MissingColumn {
                table: T::NAME,
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

/// Loads every row of a table, validating its header first.
pub fn read_table<T: Table>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .from_reader(open_reader(path)?);

    let headers = rdr.headers()?.clone();
    check_columns::<T>(&headers)?;

    let mut rows = Vec::new();
    for (i, result) in rdr.deserialize().enumerate() {
        // +2: one for the header, one for 1-based line numbers
        let row: T = result.with_context(|| format!("{} line {}", path.display(), i + 2))?;
        rows.push(row);
    }

    debug!(table = T::NAME, rows = rows.len(), path = %path.display(), "Table loaded");
    Ok(rows)
}

fn write_rows<W: Write, T: Table>(sink: W, rows: &[T]) -> Result<W> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(sink);

    // serde only emits a header alongside the first row
    if rows.is_empty() {
        writer.write_record(T::COLUMNS)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow!("flushing {} writer: {}", T::NAME, e.error()))
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    path.with_file_name(format!(".{name}.partial"))
}

/// Writes a complete table, replacing any existing file atomically.
pub fn write_table<T: Table>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let staging = staging_path(path);
    let file = File::create(&staging)
        .with_context(|| format!("creating {}", staging.display()))?;

    if is_gzip(path) {
        let encoder = write_rows(
            GzEncoder::new(BufWriter::new(file), Compression::default()),
            rows,
        )?;
        encoder.finish()?.flush()?;
    } else {
        write_rows(BufWriter::new(file), rows)?.flush()?;
    }

    fs::rename(&staging, path)
        .with_context(|| format!("moving {} into place", path.display()))?;

    debug!(table = T::NAME, rows = rows.len(), path = %path.display(), "Table written");
    Ok(())
}

/// Serializes a value as pretty JSON with the same write-then-rename policy.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = staging_path(path);
    fs::write(&staging, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&staging, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::env;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: Option<f64>,
    }

    impl Table for Reading {
        const NAME: &'static str = "readings";
        const COLUMNS: &'static [&'static str] = &["sensor", "value"];
    }

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("bus_stress_table_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_gzip_table_reads_back() {
        let path = temp_path("readings.csv.gz");
        let rows = vec![
            Reading { sensor: "a".into(), value: Some(1.5) },
            Reading { sensor: "b".into(), value: None },
        ];

        write_table(&path, &rows).unwrap();
        let loaded: Vec<Reading> = read_table(&path).unwrap();
        assert_eq!(loaded, rows);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_column_is_named() {
        let path = temp_path("bad.csv");
        fs::write(&path, "sensor,other\na,1\n").unwrap();

        let err = read_table::<Reading>(&path).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MissingColumn { table, column }) => {
                assert_eq!(*table, "readings");
                assert_eq!(column, "value");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_extra_columns_are_ignored() {
        let path = temp_path("extra.csv");
        fs::write(&path, "legacy,sensor,value\nx,a,2\n").unwrap();

        let loaded: Vec<Reading> = read_table(&path).unwrap();
        assert_eq!(loaded, vec![Reading { sensor: "a".into(), value: Some(2.0) }]);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_empty_table_keeps_header_and_no_staging_file() {
        let path = temp_path("empty.csv");
        write_table::<Reading>(&path, &[]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), "sensor,value");
        assert!(!staging_path(&path).exists());

        fs::remove_file(&path).unwrap();
    }
}
