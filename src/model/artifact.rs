//! JSON persistence of a trained [`DualHeadModel`].

use super::network::Network;
use super::training::TrainingReport;
use super::{AdapterSpec, DualHeadModel, ScalarScaler};
use crate::error::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Bumped whenever the artifact layout changes incompatibly.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// On-disk form of a model.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub model_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub crate_version: String,
    pub adapter: AdapterSpec,
    pub scaler: ScalarScaler,
    pub training: Option<TrainingReport>,
    pub network: Network,
}

impl DualHeadModel {
    /// Write the model to `path`, replacing any previous artifact.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let artifact = ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_id: Uuid::new_v4(),
            created_at: Utc::now(),
            crate_version: crate::VERSION.to_string(),
            adapter: self.adapter.spec(),
            scaler: self.scaler,
            training: self.report.clone(),
            network: self.network.clone(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ModelError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let json = serde_json::to_vec(&artifact).map_err(|source| ModelError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Saved model {} to {:?}", artifact.model_id, path);
        Ok(())
    }

    /// Load a model written by [`DualHeadModel::save`].
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::ArtifactMissing(path.to_path_buf()));
        }

        let bytes = std::fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let artifact: ModelArtifact = serde_json::from_slice(&bytes).map_err(|source| ModelError::Format {
            path: path.to_path_buf(),
            source,
        })?;

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::Version {
                expected: ARTIFACT_FORMAT_VERSION,
                found: artifact.format_version,
            });
        }

        tracing::debug!(
            "Loaded model {} created {} by version {}",
            artifact.model_id,
            artifact.created_at,
            artifact.crate_version
        );

        let model = DualHeadModel::new(artifact.adapter.build(), artifact.scaler, artifact.network)?;
        Ok(match artifact.training {
            Some(report) => model.with_report(report),
            None => model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GridAdapter;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model() -> DualHeadModel {
        let mut rng = StdRng::seed_from_u64(5);
        let scaler = ScalarScaler {
            mean: [22.0, 70.0],
            std: [3.0, 12.0],
        };
        DualHeadModel::new(Box::new(GridAdapter::new(2, 3)), scaler, Network::new(1, 2, &[4], &mut rng)).unwrap()
    }

    #[test]
    fn test_save_load_reproduces_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("rain.json");
        let original = model();
        original.save(&path).unwrap();

        let loaded = DualHeadModel::load(&path).unwrap();
        assert_eq!(loaded.adapter().spec(), original.adapter().spec());
        assert_eq!(loaded.scaler(), original.scaler());

        let embedding = [0.1, 0.4, 0.9, 0.3, 0.0, 0.7];
        assert_eq!(
            loaded.predict(&embedding, [25.0, 81.0]).unwrap(),
            original.predict(&embedding, [25.0, 81.0]).unwrap()
        );
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let err = DualHeadModel::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ModelError::ArtifactMissing(_)));
    }

    #[test]
    fn test_rejects_other_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rain.json");
        model().save(&path).unwrap();

        let mut json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        json["format_version"] = serde_json::json!(99);
        std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let err = DualHeadModel::load(&path).unwrap_err();
        assert!(matches!(err, ModelError::Version { found: 99, .. }));
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rain.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(DualHeadModel::load(&path).unwrap_err(), ModelError::Format { .. }));
    }
}
