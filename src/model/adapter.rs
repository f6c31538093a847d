//! Reshaping of flat embeddings into the network's spatial input.

use crate::error::SchemaMismatchError;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Turns a flat embedding into a `(time_steps, height, width, channels)` tensor.
///
/// The model stores the adapter's [`AdapterSpec`] in its artifact so the same
/// reshaping is applied at inference time.
pub trait InputAdapter: Send + Sync + fmt::Debug {
    /// Embedding length this adapter accepts.
    fn input_len(&self) -> usize;

    /// Shape of the tensor produced by [`InputAdapter::adapt`].
    fn shape(&self) -> [usize; 4];

    fn adapt(&self, embedding: &[f32]) -> Result<Array4<f32>, SchemaMismatchError>;

    fn spec(&self) -> AdapterSpec;
}

/// Serializable description of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    Grid { height: usize, width: usize },
}

impl AdapterSpec {
    pub fn build(&self) -> Box<dyn InputAdapter> {
        match *self {
            AdapterSpec::Grid { height, width } => Box::new(GridAdapter::new(height, width)),
        }
    }
}

impl Default for AdapterSpec {
    /// 32×64 single-channel grid for 2048-wide embeddings.
    fn default() -> Self {
        AdapterSpec::Grid {
            height: 32,
            width: 64,
        }
    }
}

/// Lays the embedding out row-major on a one-step, one-channel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridAdapter {
    height: usize,
    width: usize,
}

impl GridAdapter {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

impl InputAdapter for GridAdapter {
    fn input_len(&self) -> usize {
        self.height * self.width
    }

    fn shape(&self) -> [usize; 4] {
        [1, self.height, self.width, 1]
    }

    fn adapt(&self, embedding: &[f32]) -> Result<Array4<f32>, SchemaMismatchError> {
        let mismatch = || SchemaMismatchError::new("model input", self.input_len(), embedding.len());
        if embedding.len() != self.input_len() {
            return Err(mismatch());
        }
        Array4::from_shape_vec((1, self.height, self.width, 1), embedding.to_vec()).map_err(|_| mismatch())
    }

    fn spec(&self) -> AdapterSpec {
        AdapterSpec::Grid {
            height: self.height,
            width: self.width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid_shape() {
        let adapter = AdapterSpec::default().build();
        assert_eq!(adapter.input_len(), 2048);
        assert_eq!(adapter.shape(), [1, 32, 64, 1]);
    }

    #[test]
    fn test_grid_is_row_major() {
        let adapter = GridAdapter::new(2, 3);
        let grid = adapter.adapt(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(grid.shape(), &[1, 2, 3, 1]);
        assert_eq!(grid[[0, 0, 2, 0]], 2.0);
        assert_eq!(grid[[0, 1, 0, 0]], 3.0);
    }

    #[test]
    fn test_grid_rejects_wrong_length() {
        let adapter = GridAdapter::new(32, 64);
        let err = adapter.adapt(&vec![0.0; 2050]).unwrap_err();
        assert_eq!(err.expected, 2048);
        assert_eq!(err.found, 2050);
    }

    #[test]
    fn test_spec_serde() {
        let spec = AdapterSpec::Grid { height: 4, width: 8 };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"kind":"grid","height":4,"width":8}"#);
        let back: AdapterSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.build().spec(), spec);
    }
}
