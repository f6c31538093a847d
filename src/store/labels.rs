//! Per-day, per-policy labeled-pair files.
//!
//! Each (day, policy) unit lands in `{A|B}_model_YYYYMMDD.csv` under the
//! labels root. Files are written whole through a temporary name, so a unit
//! that fails halfway leaves nothing behind.

use crate::core::types::{DayId, LabeledPair};
use crate::core::windowing::AlignmentPolicy;
use crate::error::IngestionError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";
const TIME_FORMAT_SECONDS: &str = "%Y-%m-%d %H:%M:%S";

/// Row layout of a labeled file.
#[derive(Debug, Serialize, Deserialize)]
struct LabelRecord {
    filename: String,
    img_time: String,
    label_time: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    precipitation: Option<f64>,
}

impl From<&LabeledPair> for LabelRecord {
    fn from(pair: &LabeledPair) -> Self {
        Self {
            filename: pair.image_filename.clone(),
            img_time: pair.image_time.format(TIME_FORMAT).to_string(),
            label_time: pair.label_time.format(TIME_FORMAT).to_string(),
            temperature: pair.temperature,
            humidity: pair.humidity,
            pressure: None,
            precipitation: pair.precipitation_mm,
        }
    }
}

/// A labeled file found under the labels root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFile {
    pub day: DayId,
    pub policy: AlignmentPolicy,
    pub path: PathBuf,
}

/// Directory of labeled files.
#[derive(Debug, Clone)]
pub struct LabelStore {
    root: PathBuf,
}

impl LabelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, day: DayId, policy: AlignmentPolicy) -> PathBuf {
        self.root.join(label_file_name(day, policy))
    }

    pub fn exists(&self, day: DayId, policy: AlignmentPolicy) -> bool {
        self.path_for(day, policy).exists()
    }

    /// Write the pairs of one unit, replacing any previous file.
    pub fn write(
        &self,
        day: DayId,
        policy: AlignmentPolicy,
        pairs: &[LabeledPair],
    ) -> Result<PathBuf, IngestionError> {
        let path = self.path_for(day, policy);
        let tmp = path.with_extension("csv.tmp");
        let io_err = |source| IngestionError::Io {
            path: tmp.clone(),
            source,
        };

        std::fs::create_dir_all(&self.root).map_err(|source| IngestionError::Io {
            path: self.root.clone(),
            source,
        })?;

        {
            let mut writer = csv::Writer::from_path(&tmp).map_err(|source| IngestionError::Csv {
                path: tmp.clone(),
                source,
            })?;
            for pair in pairs {
                writer
                    .serialize(LabelRecord::from(pair))
                    .map_err(|source| IngestionError::Csv {
                        path: tmp.clone(),
                        source,
                    })?;
            }
            writer.flush().map_err(io_err)?;
        }

        std::fs::rename(&tmp, &path).map_err(|source| IngestionError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// List labeled files, sorted by file name.
    pub fn list(&self) -> Result<Vec<LabelFile>, IngestionError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| IngestionError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut files: Vec<LabelFile> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let (policy, day) = parse_label_file_name(name.to_str()?)?;
                Some(LabelFile {
                    day,
                    policy,
                    path: e.path(),
                })
            })
            .collect();
        files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(files)
    }
}

pub fn label_file_name(day: DayId, policy: AlignmentPolicy) -> String {
    format!("{}_model_{day}.csv", policy.tag())
}

/// Inverse of [`label_file_name`].
pub fn parse_label_file_name(name: &str) -> Option<(AlignmentPolicy, DayId)> {
    let stem = name.strip_suffix(".csv")?;
    let (tag, day) = stem.split_once("_model_")?;
    let policy = match tag {
        "A" => AlignmentPolicy::Forward,
        "B" => AlignmentPolicy::Centered,
        _ => return None,
    };
    Some((policy, day.parse().ok()?))
}

/// Read every pair of a labeled file.
pub fn read_labels(path: &Path) -> Result<Vec<LabeledPair>, IngestionError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| IngestionError::Csv {
        path: path.to_path_buf(),
        source,
    })?;

    let mut pairs = Vec::new();
    for result in reader.deserialize::<LabelRecord>() {
        let record = result.map_err(|source| IngestionError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        pairs.push(LabeledPair {
            image_filename: record.filename,
            image_time: parse_label_time(&record.img_time)?,
            label_time: parse_label_time(&record.label_time)?,
            temperature: record.temperature,
            humidity: record.humidity,
            pressure: record.pressure,
            precipitation_mm: record.precipitation,
        });
    }
    Ok(pairs)
}

fn parse_label_time(value: &str) -> Result<NaiveDateTime, IngestionError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT_SECONDS)
        .or_else(|_| NaiveDateTime::parse_from_str(value, TIME_FORMAT))
        .map_err(|e| IngestionError::MalformedTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ImageRecord, WeatherObservation};
    use chrono::NaiveDate;

    fn sample_pairs() -> Vec<LabeledPair> {
        let t = NaiveDate::from_ymd_opt(2025, 7, 15)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let obs = WeatherObservation::at(t)
            .with_precipitation(0.5)
            .with_climate(24.1, 88.0);
        vec![
            LabeledPair::new(&obs, &ImageRecord::new("202507151001.jpg", t + chrono::Duration::minutes(1))),
            LabeledPair::new(&obs, &ImageRecord::new("202507151008.jpg", t + chrono::Duration::minutes(8))),
        ]
    }

    #[test]
    fn test_file_names() {
        let day: DayId = "20250715".parse().unwrap();
        assert_eq!(label_file_name(day, AlignmentPolicy::Forward), "A_model_20250715.csv");
        assert_eq!(
            parse_label_file_name("B_model_20250715.csv"),
            Some((AlignmentPolicy::Centered, day))
        );
        assert_eq!(parse_label_file_name("C_model_20250715.csv"), None);
        assert_eq!(parse_label_file_name("A_model_2025.csv"), None);
        assert_eq!(parse_label_file_name("features_dataset.csv"), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LabelStore::new(dir.path().join("labels"));
        let day: DayId = "20250715".parse().unwrap();
        let pairs = sample_pairs();

        let path = store.write(day, AlignmentPolicy::Forward, &pairs).unwrap();
        assert!(store.exists(day, AlignmentPolicy::Forward));
        assert!(!store.exists(day, AlignmentPolicy::Centered));

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "filename,img_time,label_time,temperature,humidity,pressure,precipitation"
        ));
        assert!(header.contains("2025-07-15 10:01,2025-07-15 10:00,24.1,88.0,,0.5"));

        let back = read_labels(&path).unwrap();
        assert_eq!(back, pairs);
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        let pairs = sample_pairs();
        for day in ["20250716", "20250715"] {
            for policy in AlignmentPolicy::ALL {
                store.write(day.parse().unwrap(), policy, &pairs).unwrap();
            }
        }
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let names: Vec<String> = store
            .list()
            .unwrap()
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "A_model_20250715.csv",
                "A_model_20250716.csv",
                "B_model_20250715.csv",
                "B_model_20250716.csv"
            ]
        );
    }
}
