//! Image embedding providers.
//!
//! The pipeline only needs "image in, fixed-length vector out". Any visual
//! backbone can sit behind [`EmbeddingProvider`]; the crate bundles
//! [`ThumbnailEmbedder`], a grayscale downsample, so the whole pipeline runs
//! without external weights.

use crate::error::EmbeddingError;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maps an image file to a fixed-length vector.
///
/// Implementations must be stateless between calls so one handle can be
/// shared by reference across workers.
pub trait EmbeddingProvider: Send + Sync {
    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Embed the image at `path`.
    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError>;
}

/// Size of the thumbnail the bundled provider reduces an image to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ThumbnailSize {
    /// 64×32 gives the 2048-wide embedding the default grid adapter expects.
    fn default() -> Self {
        Self {
            width: 64,
            height: 32,
        }
    }
}

/// Resizes an image to a small grayscale thumbnail and returns its pixels,
/// row-major and scaled to `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailEmbedder {
    size: ThumbnailSize,
}

impl ThumbnailEmbedder {
    pub fn new(size: ThumbnailSize) -> Self {
        Self { size }
    }
}

impl EmbeddingProvider for ThumbnailEmbedder {
    fn dimension(&self) -> usize {
        (self.size.width * self.size.height) as usize
    }

    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let img = image::open(path).map_err(|e| EmbeddingError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let thumb = img
            .resize_exact(self.size.width, self.size.height, FilterType::Triangle)
            .to_luma8();

        Ok(thumb.as_raw().iter().map(|&p| p as f32 / 255.0).collect())
    }
}
