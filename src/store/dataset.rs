//! The cumulative feature dataset: a single CSV of positional feature rows.

use crate::core::features::{FeatureRow, FeatureSchema};
use crate::error::{DatasetError, SchemaMismatchError};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Streams feature rows into a dataset file.
///
/// Rows go to a staging file next to the dataset. [`DatasetWriter::finish`]
/// moves it into place; a writer dropped before that leaves the previous
/// dataset untouched.
pub struct DatasetWriter {
    writer: csv::Writer<File>,
    schema: FeatureSchema,
    path: PathBuf,
    staging: PathBuf,
    rows_written: usize,
    committed: bool,
}

impl DatasetWriter {
    /// Start a new dataset that replaces `path` on finish.
    pub fn create(path: &Path, schema: FeatureSchema) -> Result<Self, DatasetError> {
        ensure_parent(path)?;
        let staging = staging_path(path);
        let mut writer = csv::Writer::from_path(&staging).map_err(|source| DatasetError::Csv {
            path: staging.clone(),
            source,
        })?;
        writer
            .write_record(schema.header())
            .map_err(|source| DatasetError::Csv {
                path: staging.clone(),
                source,
            })?;

        Ok(Self::staged(writer, schema, path, staging))
    }

    /// Continue an existing dataset.
    ///
    /// The existing header must describe the same layout as `schema`. A
    /// missing or empty file is created as if by [`DatasetWriter::create`].
    pub fn append(path: &Path, schema: FeatureSchema) -> Result<Self, DatasetError> {
        let has_content = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if !has_content {
            return Self::create(path, schema);
        }

        let existing = read_schema(path)?;
        if existing != schema {
            return Err(SchemaMismatchError::new(
                format!("existing dataset {}", path.display()),
                existing.width(),
                schema.width(),
            )
            .into());
        }

        let staging = staging_path(path);
        std::fs::copy(path, &staging).map_err(|source| DatasetError::Io {
            path: staging.clone(),
            source,
        })?;
        let file = OpenOptions::new()
            .append(true)
            .open(&staging)
            .map_err(|source| DatasetError::Io {
                path: staging.clone(),
                source,
            })?;
        let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        Ok(Self::staged(writer, schema, path, staging))
    }

    fn staged(writer: csv::Writer<File>, schema: FeatureSchema, path: &Path, staging: PathBuf) -> Self {
        Self {
            writer,
            schema,
            path: path.to_path_buf(),
            staging,
            rows_written: 0,
            committed: false,
        }
    }

    pub fn schema(&self) -> FeatureSchema {
        self.schema
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn write_row(&mut self, row: &FeatureRow) -> Result<(), DatasetError> {
        self.schema.check_width("dataset row", row.width())?;
        self.writer
            .write_record(row.to_values().iter().map(|v| v.to_string()))
            .map_err(|source| DatasetError::Csv {
                path: self.staging.clone(),
                source,
            })?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and move the staged file into place; returns how many rows
    /// this writer added.
    pub fn finish(mut self) -> Result<usize, DatasetError> {
        self.writer.flush().map_err(|source| DatasetError::Io {
            path: self.staging.clone(),
            source,
        })?;
        std::fs::rename(&self.staging, &self.path).map_err(|source| DatasetError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.committed = true;
        Ok(self.rows_written)
    }
}

impl Drop for DatasetWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

/// `features.csv` stages as `features.csv.tmp`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// A loaded dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    /// Rows discarded for empty or non-numeric values
    pub dropped: usize,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.rows.iter().filter(|r| r.label() == 1).count()
    }
}

/// Read a dataset, dropping rows that have empty or non-numeric values.
///
/// A row whose width differs from the header is a schema mismatch and
/// fails the whole load.
pub fn load_dataset(path: &Path) -> Result<Dataset, DatasetError> {
    let file = File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let schema = schema_from_reader(path, &mut reader)?;

    let mut rows = Vec::new();
    let mut dropped = 0;
    for (index, result) in reader.records().enumerate() {
        let record = result.map_err(|source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        if record.len() != schema.width() {
            return Err(SchemaMismatchError::new(
                format!("dataset row {}", index + 1),
                schema.width(),
                record.len(),
            )
            .into());
        }

        let values: Option<Vec<f32>> = record
            .iter()
            .map(|field| field.trim().parse::<f32>().ok().filter(|v| v.is_finite()))
            .collect();
        match values {
            Some(values) => rows.push(FeatureRow::from_values(&schema, &values)?),
            None => {
                tracing::debug!("Dropping incomplete dataset row {}", index + 1);
                dropped += 1;
            }
        }
    }

    if dropped > 0 {
        tracing::warn!("Dropped {} incomplete rows from {:?}", dropped, path);
    }

    Ok(Dataset {
        schema,
        rows,
        dropped,
    })
}

/// Read only the header of a dataset.
pub fn read_schema(path: &Path) -> Result<FeatureSchema, DatasetError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    schema_from_reader(path, &mut reader)
}

fn schema_from_reader<R: std::io::Read>(
    path: &Path,
    reader: &mut csv::Reader<R>,
) -> Result<FeatureSchema, DatasetError> {
    let header = reader.headers().map_err(|source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    })?;
    let columns: Vec<&str> = header.iter().collect();
    FeatureSchema::from_header(&columns).map_err(|source| DatasetError::Header {
        path: path.to_path_buf(),
        source,
    })
}

fn ensure_parent(path: &Path) -> Result<(), DatasetError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|source| DatasetError::Io {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}
