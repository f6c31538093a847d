//! Feature rows: one per labeled pair, with a fixed positional layout.
//!
//! A row is `embedding ++ [temperature, humidity] ++ [precipitation, rain_mm, label]`.
//! Every producer and consumer slices rows by these offsets, never by column
//! name, so training and inference see the same layout.

use crate::core::types::{LabeledPair, ScalarWeather};
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingError, HeaderError, SchemaMismatchError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Scalar weather columns, in row order.
pub const SCALAR_COLUMNS: [&str; 2] = ["temperature", "humidity"];

/// Target columns, in row order. `rain_mm` duplicates `precipitation`.
pub const TARGET_COLUMNS: [&str; 3] = ["precipitation", "rain_mm", "label"];

/// Column layout for a given embedding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSchema {
    embedding_width: usize,
}

impl FeatureSchema {
    pub fn new(embedding_width: usize) -> Self {
        Self { embedding_width }
    }

    pub fn embedding_width(&self) -> usize {
        self.embedding_width
    }

    /// Offset of the first scalar column.
    pub fn scalar_offset(&self) -> usize {
        self.embedding_width
    }

    /// Offset of the first target column.
    pub fn target_offset(&self) -> usize {
        self.embedding_width + SCALAR_COLUMNS.len()
    }

    /// Width of model inputs (everything before the targets).
    pub fn input_width(&self) -> usize {
        self.target_offset()
    }

    /// Total row width.
    pub fn width(&self) -> usize {
        self.target_offset() + TARGET_COLUMNS.len()
    }

    /// Header written at the top of a dataset file.
    pub fn header(&self) -> Vec<String> {
        (0..self.embedding_width)
            .map(|i| i.to_string())
            .chain(SCALAR_COLUMNS.iter().map(|s| s.to_string()))
            .chain(TARGET_COLUMNS.iter().map(|s| s.to_string()))
            .collect()
    }

    /// Recover the schema from a dataset header, checking the named tail.
    pub fn from_header<S: AsRef<str>>(header: &[S]) -> Result<Self, HeaderError> {
        let named = SCALAR_COLUMNS.len() + TARGET_COLUMNS.len();
        if header.len() <= named {
            return Err(HeaderError::TooFewColumns {
                found: header.len(),
                required: named + 1,
            });
        }
        let schema = Self::new(header.len() - named);

        let tail: Vec<&str> = header[schema.scalar_offset()..]
            .iter()
            .map(|s| s.as_ref().trim())
            .collect();
        let expected: Vec<&str> = SCALAR_COLUMNS.iter().chain(TARGET_COLUMNS.iter()).copied().collect();
        if tail != expected {
            return Err(HeaderError::UnexpectedColumns {
                found: tail.iter().map(|s| s.to_string()).collect(),
                expected: expected.iter().map(|s| s.to_string()).collect(),
            });
        }
        Ok(schema)
    }

    pub fn check_width(&self, context: impl Into<String>, found: usize) -> Result<(), SchemaMismatchError> {
        if found == self.width() {
            Ok(())
        } else {
            Err(SchemaMismatchError::new(context, self.width(), found))
        }
    }
}

/// One labeled training example.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    embedding: Arc<[f32]>,
    scalars: [f32; 2],
    precipitation_mm: f32,
    label: u8,
}

impl FeatureRow {
    /// Build a row; the label is derived as `precipitation_mm > 0`.
    pub fn new(embedding: Arc<[f32]>, weather: ScalarWeather, precipitation_mm: f64) -> Self {
        Self {
            embedding,
            scalars: weather.to_array(),
            precipitation_mm: precipitation_mm as f32,
            label: u8::from(precipitation_mm > 0.0),
        }
    }

    /// Rebuild a row from its positional values.
    ///
    /// The stored label column is not trusted; it is re-derived from the
    /// precipitation column so the label invariant always holds.
    pub fn from_values(schema: &FeatureSchema, values: &[f32]) -> Result<Self, SchemaMismatchError> {
        schema.check_width("feature row", values.len())?;
        let s = schema.scalar_offset();
        let t = schema.target_offset();
        let precipitation_mm = values[t];
        Ok(Self {
            embedding: Arc::from(&values[..s]),
            scalars: [values[s], values[s + 1]],
            precipitation_mm,
            label: u8::from(precipitation_mm > 0.0),
        })
    }

    /// Positional values in schema order.
    pub fn to_values(&self) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.width());
        values.extend_from_slice(&self.embedding);
        values.extend_from_slice(&self.scalars);
        values.push(self.precipitation_mm);
        values.push(self.precipitation_mm);
        values.push(self.label as f32);
        values
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub fn scalars(&self) -> [f32; 2] {
        self.scalars
    }

    pub fn precipitation_mm(&self) -> f32 {
        self.precipitation_mm
    }

    pub fn label(&self) -> u8 {
        self.label
    }

    pub fn width(&self) -> usize {
        self.embedding.len() + SCALAR_COLUMNS.len() + TARGET_COLUMNS.len()
    }
}

/// Memoizes embeddings per image path, failures included.
///
/// Under the centered policy one image can back several pairs; the provider
/// still runs once for it and a corrupt file is logged once.
pub struct EmbeddingCache<'a> {
    provider: &'a dyn EmbeddingProvider,
    entries: HashMap<PathBuf, Result<Arc<[f32]>, Arc<EmbeddingError>>>,
    provider_calls: usize,
}

impl<'a> EmbeddingCache<'a> {
    pub fn new(provider: &'a dyn EmbeddingProvider) -> Self {
        Self {
            provider,
            entries: HashMap::new(),
            provider_calls: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Number of times the provider has actually been invoked.
    pub fn provider_calls(&self) -> usize {
        self.provider_calls
    }

    pub fn get(&mut self, path: &Path) -> Result<Arc<[f32]>, Arc<EmbeddingError>> {
        if let Some(entry) = self.entries.get(path) {
            return entry.clone();
        }

        self.provider_calls += 1;
        let expected = self.provider.dimension();
        let entry: Result<Arc<[f32]>, Arc<EmbeddingError>> = match self.provider.embed(path) {
            Ok(v) if v.len() == expected => Ok(Arc::from(v)),
            Ok(v) => Err(Arc::new(EmbeddingError::Dimension {
                path: path.to_path_buf(),
                expected,
                found: v.len(),
            })),
            Err(e) => Err(Arc::new(e)),
        };
        if let Err(ref e) = entry {
            tracing::warn!("Skipping image: {e}");
        }

        self.entries.insert(path.to_path_buf(), entry.clone());
        entry
    }
}

/// Why a labeled pair produced no row.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// A scalar or target field is empty in the labeled file
    #[error("missing {field}")]
    Incomplete { field: &'static str },

    /// The image could not be embedded
    #[error("{0}")]
    Embedding(Arc<EmbeddingError>),
}

/// Build the feature row for one labeled pair.
///
/// The row width follows the cache's provider dimension; a provider that
/// returns a vector of any other length is an embedding failure for this
/// image only.
pub fn assemble(
    pair: &LabeledPair,
    image_path: &Path,
    cache: &mut EmbeddingCache<'_>,
) -> Result<FeatureRow, AssemblyError> {
    let temperature = pair
        .temperature
        .ok_or(AssemblyError::Incomplete { field: "temperature" })?;
    let humidity = pair
        .humidity
        .ok_or(AssemblyError::Incomplete { field: "humidity" })?;
    let precipitation = pair
        .precipitation_mm
        .ok_or(AssemblyError::Incomplete { field: "precipitation" })?;

    let embedding = cache.get(image_path).map_err(AssemblyError::Embedding)?;

    Ok(FeatureRow::new(
        embedding,
        ScalarWeather::new(temperature, humidity),
        precipitation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ImageRecord, WeatherObservation};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        width: usize,
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for FixedProvider {
        fn dimension(&self) -> usize {
            self.width
        }

        fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if path.to_string_lossy().contains("corrupt") {
                return Err(EmbeddingError::Unreadable {
                    path: path.to_path_buf(),
                    reason: "bad header".to_string(),
                });
            }
            Ok(vec![0.25; self.width])
        }
    }

    fn provider(width: usize) -> FixedProvider {
        FixedProvider {
            width,
            calls: AtomicUsize::new(0),
        }
    }

    fn pair(precipitation: Option<f64>) -> LabeledPair {
        let t = NaiveDate::from_ymd_opt(2025, 7, 15)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let mut obs = WeatherObservation::at(t).with_climate(25.0, 80.0);
        obs.precipitation_mm = precipitation;
        LabeledPair::new(&obs, &ImageRecord::new("202507151001.jpg", t))
    }

    #[test]
    fn test_schema_offsets() {
        let schema = FeatureSchema::new(2048);
        assert_eq!(schema.scalar_offset(), 2048);
        assert_eq!(schema.target_offset(), 2050);
        assert_eq!(schema.width(), 2048 + 2 + 3);

        let header = schema.header();
        assert_eq!(header[0], "0");
        assert_eq!(header[2047], "2047");
        assert_eq!(&header[2048..], ["temperature", "humidity", "precipitation", "rain_mm", "label"]);
    }

    #[test]
    fn test_schema_from_header() {
        let schema = FeatureSchema::new(4);
        let recovered = FeatureSchema::from_header(&schema.header()).unwrap();
        assert_eq!(recovered, schema);

        let bad = ["0", "1", "humidity", "temperature", "precipitation", "rain_mm", "label"];
        assert!(matches!(
            FeatureSchema::from_header(&bad),
            Err(HeaderError::UnexpectedColumns { .. })
        ));
        assert_eq!(
            FeatureSchema::from_header(&["label"]),
            Err(HeaderError::TooFewColumns { found: 1, required: 6 })
        );
    }

    #[test]
    fn test_label_follows_precipitation() {
        let emb: Arc<[f32]> = Arc::from(vec![0.0f32; 4]);
        let weather = ScalarWeather::new(20.0, 60.0);
        assert_eq!(FeatureRow::new(emb.clone(), weather, 0.0).label(), 0);
        assert_eq!(FeatureRow::new(emb.clone(), weather, 0.5).label(), 1);
        assert_eq!(FeatureRow::new(emb, weather, 0.01).label(), 1);
    }

    #[test]
    fn test_row_values_layout() {
        let schema = FeatureSchema::new(3);
        let row = FeatureRow::new(Arc::from(vec![1.0f32, 2.0, 3.0]), ScalarWeather::new(21.5, 70.0), 1.5);
        let values = row.to_values();
        assert_eq!(values.len(), schema.width());
        assert_eq!(values, vec![1.0, 2.0, 3.0, 21.5, 70.0, 1.5, 1.5, 1.0]);

        let back = FeatureRow::from_values(&schema, &values).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_from_values_rederives_label() {
        let schema = FeatureSchema::new(1);
        let row = FeatureRow::from_values(&schema, &[0.0, 20.0, 50.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(row.label(), 0);
    }

    #[test]
    fn test_from_values_rejects_wrong_width() {
        let schema = FeatureSchema::new(4);
        let err = FeatureRow::from_values(&schema, &[0.0; 8]).unwrap_err();
        assert_eq!(err.expected, 9);
        assert_eq!(err.found, 8);
    }

    #[test]
    fn test_assemble_builds_row() {
        let provider = provider(4);
        let mut cache = EmbeddingCache::new(&provider);
        let schema = FeatureSchema::new(4);

        let row = assemble(&pair(Some(0.5)), Path::new("img/a.jpg"), &mut cache).unwrap();
        assert_eq!(row.width(), schema.width());
        assert_eq!(row.scalars(), [25.0, 80.0]);
        assert_eq!(row.label(), 1);
    }

    #[test]
    fn test_cache_embeds_each_image_once() {
        let provider = provider(4);
        let mut cache = EmbeddingCache::new(&provider);

        for _ in 0..3 {
            assemble(&pair(Some(0.0)), Path::new("img/a.jpg"), &mut cache).unwrap();
        }
        for _ in 0..2 {
            let err = assemble(&pair(Some(0.0)), Path::new("img/corrupt.jpg"), &mut cache);
            assert!(matches!(err, Err(AssemblyError::Embedding(_))));
        }

        assert_eq!(provider.calls.load(Ordering::Relaxed), 2);
        assert_eq!(cache.provider_calls(), 2);
    }

    #[test]
    fn test_assemble_skips_incomplete_pairs() {
        let provider = provider(4);
        let mut cache = EmbeddingCache::new(&provider);

        let err = assemble(&pair(None), Path::new("img/a.jpg"), &mut cache).unwrap_err();
        assert!(matches!(err, AssemblyError::Incomplete { field: "precipitation" }));
        assert_eq!(cache.provider_calls(), 0);
    }

    struct ShortProvider;

    impl EmbeddingProvider for ShortProvider {
        fn dimension(&self) -> usize {
            4
        }

        fn embed(&self, _path: &Path) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.5; 3])
        }
    }

    #[test]
    fn test_wrong_length_embedding_skips_the_image() {
        let provider = ShortProvider;
        let mut cache = EmbeddingCache::new(&provider);

        let err = assemble(&pair(Some(0.0)), Path::new("img/a.jpg"), &mut cache).unwrap_err();
        match err {
            AssemblyError::Embedding(e) => assert!(matches!(
                *e,
                EmbeddingError::Dimension { expected: 4, found: 3, .. }
            )),
            other => panic!("unexpected {other:?}"),
        }
    }
}
