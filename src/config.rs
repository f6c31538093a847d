//! Configuration for the rain nowcasting pipeline.

use crate::core::windowing::AlignmentPolicy;
use crate::embedding::ThumbnailSize;
use crate::error::ConfigError;
use crate::model::{AdapterSpec, TrainingConfig};
use crate::predict::{DEFAULT_HORIZONS, RAIN_PROBABILITY_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Holds one `YYYYMMDD` directory of sky images per day
    pub image_root: PathBuf,

    /// Holds one `YYYYMMDD.csv` station table per day
    pub weather_root: PathBuf,

    /// Where labeled files are written and read back
    pub labels_root: PathBuf,

    /// Cumulative feature dataset
    pub dataset_path: PathBuf,

    /// Trained model artifact
    pub model_path: PathBuf,

    /// Path for run summaries
    pub data_path: PathBuf,

    /// Policies the label stage produces
    pub policies: Vec<AlignmentPolicy>,

    /// Thumbnail the bundled embedder reduces images to
    pub thumbnail: ThumbnailSize,

    /// How embeddings are laid out for the network
    pub adapter: AdapterSpec,

    pub training: TrainingConfig,

    /// Forecast horizons in minutes
    pub horizons: Vec<u32>,

    /// Probability at or above which rain is reported
    pub threshold: f64,

    /// Threads used by the label stage
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rain-nowcast");

        Self {
            image_root: data_dir.join("images"),
            weather_root: data_dir.join("weather"),
            labels_root: data_dir.join("labels"),
            dataset_path: data_dir.join("features.csv"),
            model_path: data_dir.join("model.json"),
            data_path: data_dir.join("runs"),
            policies: AlignmentPolicy::ALL.to_vec(),
            thumbnail: ThumbnailSize::default(),
            adapter: AdapterSpec::default(),
            training: TrainingConfig::default(),
            horizons: DEFAULT_HORIZONS.to_vec(),
            threshold: RAIN_PROBABILITY_THRESHOLD,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get().min(4)),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rain-nowcast")
            .join("config.json")
    }

    /// Ensure the output directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [&self.labels_root, &self.data_path] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.policies.is_empty() {
            return invalid("at least one alignment policy is required".to_string());
        }
        if self.horizons.is_empty() || self.horizons.contains(&0) {
            return invalid("horizons must be a non-empty list of positive minutes".to_string());
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid(format!("threshold {} is outside [0, 1]", self.threshold));
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }

        let embedding_width = (self.thumbnail.width * self.thumbnail.height) as usize;
        let adapter_width = self.adapter.build().input_len();
        if embedding_width != adapter_width {
            return invalid(format!(
                "thumbnail {}x{} yields {} values but the adapter expects {}",
                self.thumbnail.width, self.thumbnail.height, embedding_width, adapter_width
            ));
        }

        let training = &self.training;
        if !(training.validation_fraction > 0.0 && training.validation_fraction < 1.0) {
            return invalid(format!(
                "validation_fraction {} must lie strictly between 0 and 1",
                training.validation_fraction
            ));
        }
        if training.batch_size == 0 || training.max_epochs == 0 || training.conv_filters == 0 {
            return invalid("batch_size, max_epochs and conv_filters must be positive".to_string());
        }
        if training.learning_rate.is_nan() || training.learning_rate <= 0.0 {
            return invalid(format!("learning_rate {} must be positive", training.learning_rate));
        }

        Ok(())
    }
}

/// Parse policies from a comma-separated string such as `A,B`.
pub fn parse_policies(s: &str) -> Result<Vec<AlignmentPolicy>, String> {
    let mut policies = Vec::new();
    for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token.eq_ignore_ascii_case("all") {
            return Ok(AlignmentPolicy::ALL.to_vec());
        }
        let policy: AlignmentPolicy = token.parse()?;
        if !policies.contains(&policy) {
            policies.push(policy);
        }
    }
    if policies.is_empty() {
        return Err("no alignment policy given".to_string());
    }
    Ok(policies)
}

/// Parse horizons in minutes from a comma-separated string such as `5,10,30`.
pub fn parse_horizons(s: &str) -> Result<Vec<u32>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| match t.parse::<u32>() {
            Ok(0) => Err("horizon must be positive".to_string()),
            Ok(minutes) => Ok(minutes),
            Err(e) => Err(format!("invalid horizon '{t}': {e}")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.policies, AlignmentPolicy::ALL);
        assert_eq!(config.horizons, [5, 10, 15, 20, 25, 30]);
        assert_eq!(config.threshold, 0.5);
        assert!(config.workers >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(parse_policies("A").unwrap(), [AlignmentPolicy::Forward]);
        assert_eq!(parse_policies("b, a, b").unwrap(), [AlignmentPolicy::Centered, AlignmentPolicy::Forward]);
        assert_eq!(parse_policies("all").unwrap(), AlignmentPolicy::ALL);
        assert!(parse_policies("").is_err());
        assert!(parse_policies("A,Z").is_err());
    }

    #[test]
    fn test_horizon_parsing() {
        assert_eq!(parse_horizons("5,10, 30").unwrap(), [5, 10, 30]);
        assert!(parse_horizons("5,0").is_err());
        assert!(parse_horizons("soon").is_err());
    }

    #[test]
    fn test_mismatched_thumbnail_and_adapter() {
        let config = Config {
            thumbnail: ThumbnailSize { width: 8, height: 4 },
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            adapter: AdapterSpec::Grid { height: 4, width: 8 },
            ..config
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            image_root: PathBuf::from("/data/sky"),
            horizons: vec![10, 20],
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"threshold": 0.7, "policies": ["B"]}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.threshold, 0.7);
        assert_eq!(config.policies, [AlignmentPolicy::Centered]);
        assert_eq!(config.horizons, DEFAULT_HORIZONS);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"threshold": 3.0}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(&dir.path().join("absent.json")).unwrap(), Config::default());
    }
}
