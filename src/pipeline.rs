//! Pipeline stages behind the CLI commands.
//!
//! Each stage takes explicit inputs (day lists, roots, handles) and records
//! its per-unit outcomes in a [`RunSummary`]. Unit-scoped failures are
//! logged once and skipped; schema mismatches abort the stage.

use crate::core::features::{assemble, AssemblyError, EmbeddingCache, FeatureRow, FeatureSchema};
use crate::core::types::{DayId, ImageRecord};
use crate::core::windowing::{align, AlignmentPolicy};
use crate::embedding::EmbeddingProvider;
use crate::error::{IngestionError, PipelineError, SchemaMismatchError};
use crate::model::training::train_validation_split;
use crate::model::{evaluate, train, AdapterSpec, DualHeadModel, EvaluationReport, TrainingConfig};
use crate::store::{load_dataset, read_labels, read_weather_csv, weather_path, DatasetWriter, LabelStore};
use crate::summary::{Category, Outcome, RunSummary};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Inputs of the label-building stage.
#[derive(Debug, Clone)]
pub struct LabelJob {
    /// Holds one `YYYYMMDD` directory of images per day
    pub image_root: PathBuf,
    /// Holds one `YYYYMMDD.csv` weather table per day
    pub weather_root: PathBuf,
    pub policies: Vec<AlignmentPolicy>,
    /// Rewrite labeled files that already exist
    pub overwrite: bool,
    pub workers: usize,
}

/// What happened to one (day, policy) unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    Written {
        policy: AlignmentPolicy,
        path: PathBuf,
        pairs: usize,
    },
    /// Alignment produced nothing; no file was written
    NoPairs { policy: AlignmentPolicy },
    /// A labeled file already existed and was left alone
    Kept { policy: AlignmentPolicy, path: PathBuf },
}

/// Result of labeling one day.
#[derive(Debug)]
pub struct DayOutcome {
    pub day: DayId,
    pub result: Result<Vec<PolicyOutcome>, IngestionError>,
}

/// Align every day and write the labeled files.
///
/// Days are spread over `job.workers` threads. Outcomes come back sorted by
/// day whatever the scheduling.
pub fn build_labels(days: &[DayId], job: &LabelJob, store: &LabelStore, summary: &RunSummary) -> Vec<DayOutcome> {
    let workers = job.workers.clamp(1, days.len().max(1));
    let (day_tx, day_rx) = crossbeam_channel::bounded::<DayId>(days.len().max(1));
    let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<DayOutcome>();

    for &day in days {
        // The receiver is alive and the channel holds every day.
        let _ = day_tx.send(day);
    }
    drop(day_tx);

    info!("Labeling {} days with {} workers", days.len(), workers);
    std::thread::scope(|scope| {
        for worker in 0..workers {
            let day_rx = day_rx.clone();
            let outcome_tx = outcome_tx.clone();
            scope.spawn(move || {
                for day in day_rx.iter() {
                    let result = label_day(day, job, store, summary);
                    if outcome_tx.send(DayOutcome { day, result }).is_err() {
                        break;
                    }
                }
                debug!("Label worker {} finished", worker);
            });
        }
    });
    drop(outcome_tx);

    let mut outcomes: Vec<DayOutcome> = outcome_rx.iter().collect();
    outcomes.sort_by_key(|o| o.day);

    for outcome in &outcomes {
        match &outcome.result {
            Ok(_) => summary.record(Category::Days, Outcome::Succeeded),
            Err(e) => {
                warn!("Skipping day {}: {}", outcome.day, e);
                summary.record(Category::Days, Outcome::Skipped);
            }
        }
    }
    outcomes
}

/// Align one day under every requested policy.
pub fn label_day(
    day: DayId,
    job: &LabelJob,
    store: &LabelStore,
    summary: &RunSummary,
) -> Result<Vec<PolicyOutcome>, IngestionError> {
    let mut outcomes = Vec::new();
    let mut pending = Vec::new();
    for &policy in &job.policies {
        if !job.overwrite && store.exists(day, policy) {
            debug!("{} policy {} already labeled", day, policy);
            outcomes.push(PolicyOutcome::Kept {
                policy,
                path: store.path_for(day, policy),
            });
        } else {
            pending.push(policy);
        }
    }
    if pending.is_empty() {
        return Ok(outcomes);
    }

    let observations = read_weather_csv(&weather_path(&job.weather_root, day), day)?;
    let images = list_day_images(&job.image_root.join(day.to_string()), summary)?;
    debug!(
        "{}: {} observations, {} images",
        day,
        observations.len(),
        images.len()
    );

    for policy in pending {
        let pairs = align(day, &observations, &images, policy);
        if pairs.is_empty() {
            info!("{} policy {}: no images matched any observation", day, policy);
            outcomes.push(PolicyOutcome::NoPairs { policy });
            continue;
        }

        let path = store.write(day, policy, &pairs)?;
        summary.record_many(Category::LabeledPairs, Outcome::Succeeded, pairs.len() as u64);
        info!("{} policy {}: {} pairs -> {:?}", day, policy, pairs.len(), path);
        outcomes.push(PolicyOutcome::Written {
            policy,
            path,
            pairs: pairs.len(),
        });
    }

    Ok(outcomes)
}

/// Image records of one day directory, sorted by file name.
///
/// Non-image files are ignored; image files whose names do not parse (or
/// are not UTF-8) are skipped and counted.
pub fn list_day_images(dir: &Path, summary: &RunSummary) -> Result<Vec<ImageRecord>, IngestionError> {
    let entries = std::fs::read_dir(dir).map_err(|source| IngestionError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if ImageRecord::is_image_file(&name) => names.push(name),
            Ok(_) => {}
            Err(raw) => {
                if ImageRecord::is_image_file(&raw.to_string_lossy()) {
                    warn!("Skipping image {:?}: file name is not valid UTF-8", entry.path());
                    summary.record(Category::ImageFiles, Outcome::Skipped);
                }
            }
        }
    }
    names.sort();

    let mut records = Vec::with_capacity(names.len());
    for name in names {
        match ImageRecord::from_filename(&name) {
            Ok(record) => {
                summary.record(Category::ImageFiles, Outcome::Succeeded);
                records.push(record);
            }
            Err(e) => {
                warn!("Skipping image {:?}: {}", dir.join(&name), e);
                summary.record(Category::ImageFiles, Outcome::Skipped);
            }
        }
    }
    Ok(records)
}

/// Inputs of the feature-building stage.
#[derive(Debug, Clone)]
pub struct FeatureJob {
    pub image_root: PathBuf,
    pub output: PathBuf,
    /// Only read labeled files of this policy; `None` reads all
    pub policy: Option<AlignmentPolicy>,
    /// Add to an existing dataset instead of replacing it
    pub append: bool,
}

/// Totals of a feature-building run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureReport {
    pub output: PathBuf,
    pub files: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
    pub images_embedded: usize,
}

/// Turn labeled files into dataset rows.
///
/// The dataset at `job.output` is only replaced once every row is written;
/// a failed run leaves it as it was.
pub fn build_features(
    store: &LabelStore,
    job: &FeatureJob,
    embedder: &dyn EmbeddingProvider,
    summary: &RunSummary,
) -> Result<FeatureReport, PipelineError> {
    let files: Vec<_> = store
        .list()?
        .into_iter()
        .filter(|f| job.policy.map_or(true, |p| p == f.policy))
        .collect();
    info!("Building features from {} labeled files", files.len());

    let schema = FeatureSchema::new(embedder.dimension());
    let mut writer = if job.append {
        DatasetWriter::append(&job.output, schema)?
    } else {
        DatasetWriter::create(&job.output, schema)?
    };
    let mut cache = EmbeddingCache::new(embedder);

    let mut rows_skipped = 0;
    for file in &files {
        let pairs = match read_labels(&file.path) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("Skipping labeled file {:?}: {}", file.path, e);
                summary.record(Category::Days, Outcome::Skipped);
                continue;
            }
        };
        summary.record(Category::Days, Outcome::Succeeded);

        let day_dir = job.image_root.join(file.day.to_string());
        for pair in &pairs {
            let image_path = day_dir.join(&pair.image_filename);
            match assemble(pair, &image_path, &mut cache) {
                Ok(row) => {
                    writer.write_row(&row)?;
                    summary.record(Category::FeatureRows, Outcome::Succeeded);
                }
                Err(AssemblyError::Incomplete { field }) => {
                    debug!("Skipping {} ({}): missing {}", pair.image_filename, file.day, field);
                    rows_skipped += 1;
                    summary.record(Category::FeatureRows, Outcome::Skipped);
                }
                // Reported once by the cache.
                Err(AssemblyError::Embedding(_)) => {
                    rows_skipped += 1;
                    summary.record(Category::FeatureRows, Outcome::Skipped);
                }
            }
        }
    }

    let rows_written = writer.finish()?;
    info!(
        "Wrote {} rows to {:?} ({} skipped, {} images embedded)",
        rows_written,
        job.output,
        rows_skipped,
        cache.provider_calls()
    );

    Ok(FeatureReport {
        output: job.output.clone(),
        files: files.len(),
        rows_written,
        rows_skipped,
        images_embedded: cache.provider_calls(),
    })
}

/// Train on a dataset file and save the model.
pub fn train_from_dataset(
    dataset: &Path,
    model_path: &Path,
    adapter: AdapterSpec,
    config: &TrainingConfig,
    summary: &RunSummary,
) -> Result<DualHeadModel, PipelineError> {
    let data = load_dataset(dataset)?;
    summary.record_many(Category::FeatureRows, Outcome::Succeeded, data.len() as u64);
    summary.record_many(Category::FeatureRows, Outcome::Skipped, data.dropped as u64);
    info!(
        "Loaded {} rows from {:?} ({} rainy, {} dropped)",
        data.len(),
        dataset,
        data.positives(),
        data.dropped
    );

    let adapter = adapter.build();
    if adapter.input_len() != data.schema.embedding_width() {
        return Err(SchemaMismatchError::new(
            "model input adapter",
            adapter.input_len(),
            data.schema.embedding_width(),
        )
        .into());
    }

    let model = train(&data.rows, adapter, config)?;
    model.save(model_path)?;
    Ok(model)
}

/// Which rows an evaluation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationSet {
    /// The validation partition recorded at training time
    Holdout,
    All,
}

/// Score a saved model against a dataset.
pub fn evaluate_saved_model(
    dataset: &Path,
    model_path: &Path,
    set: EvaluationSet,
    threshold: f64,
) -> Result<EvaluationReport, PipelineError> {
    let model = DualHeadModel::load(model_path)?;
    let data = load_dataset(dataset)?;
    if data.schema != model.schema() {
        return Err(SchemaMismatchError::new(
            format!("dataset {}", dataset.display()),
            model.schema().width(),
            data.schema.width(),
        )
        .into());
    }

    let rows: Vec<FeatureRow> = match (set, model.report()) {
        (EvaluationSet::Holdout, Some(report)) => {
            if report.train_rows + report.validation_rows != data.len() {
                warn!(
                    "Dataset has {} rows but the model was trained on {}; holdout rows differ",
                    data.len(),
                    report.train_rows + report.validation_rows
                );
            }
            train_validation_split(data.len(), report.validation_fraction, report.seed)
                .validation
                .iter()
                .map(|&i| data.rows[i].clone())
                .collect()
        }
        (EvaluationSet::Holdout, None) => {
            warn!("Model carries no training report; evaluating on every row");
            data.rows
        }
        (EvaluationSet::All, _) => data.rows,
    };

    Ok(evaluate(&model, &rows, threshold)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbeddingError;
    use std::io::Write;

    struct Flat;

    impl EmbeddingProvider for Flat {
        fn dimension(&self) -> usize {
            4
        }

        fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
            if !path.exists() {
                return Err(EmbeddingError::Unreadable {
                    path: path.to_path_buf(),
                    reason: "missing".to_string(),
                });
            }
            Ok(vec![0.5; 4])
        }
    }

    fn day() -> DayId {
        "20250715".parse().unwrap()
    }

    fn setup(root: &Path) -> LabelJob {
        let image_dir = root.join("images").join("20250715");
        std::fs::create_dir_all(&image_dir).unwrap();
        for name in ["202507151001.jpg", "202507151008.jpg", "202507151012.jpg", "cam.jpg", "notes.txt"] {
            std::fs::write(image_dir.join(name), b"x").unwrap();
        }

        let weather_root = root.join("weather");
        std::fs::create_dir_all(&weather_root).unwrap();
        let mut f = std::fs::File::create(weather_path(&weather_root, day())).unwrap();
        f.write_all(
            b"time,precip,temp,hum,wind,dir\n\
              10:00,0.5,24.1,88,2.0,N\n\
              10:10,--,24.0,87,1.5,N\n",
        )
        .unwrap();

        LabelJob {
            image_root: root.join("images"),
            weather_root,
            policies: AlignmentPolicy::ALL.to_vec(),
            overwrite: false,
            workers: 2,
        }
    }

    #[test]
    fn test_list_day_images_filters_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let job = setup(dir.path());
        let summary = RunSummary::new("test");

        let images = list_day_images(&job.image_root.join("20250715"), &summary).unwrap();
        let names: Vec<&str> = images.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, ["202507151001.jpg", "202507151008.jpg", "202507151012.jpg"]);
        assert_eq!(summary.succeeded(Category::ImageFiles), 3);
        assert_eq!(summary.skipped(Category::ImageFiles), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_image_name_is_counted() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let job = setup(dir.path());
        let day_dir = job.image_root.join("20250715");
        std::fs::remove_file(day_dir.join("cam.jpg")).unwrap();
        std::fs::write(day_dir.join(OsStr::from_bytes(b"2025071510\xff.jpg")), b"x").unwrap();
        let summary = RunSummary::new("test");

        let images = list_day_images(&day_dir, &summary).unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(summary.skipped(Category::ImageFiles), 1);
    }

    #[test]
    fn test_build_labels_writes_each_policy() {
        let dir = tempfile::tempdir().unwrap();
        let job = setup(dir.path());
        let store = LabelStore::new(dir.path().join("labels"));
        let summary = RunSummary::new("labels");

        let outcomes = build_labels(&[day()], &job, &store, &summary);
        assert_eq!(outcomes.len(), 1);
        let written = outcomes[0].result.as_ref().unwrap();
        assert_eq!(written.len(), 2);
        assert!(matches!(
            &written[0],
            PolicyOutcome::Written { policy: AlignmentPolicy::Forward, pairs: 3, .. }
        ));
        // Centered: 10:01 under 10:00, 10:08 and 10:12 under 10:10.
        assert!(matches!(
            &written[1],
            PolicyOutcome::Written { policy: AlignmentPolicy::Centered, pairs: 3, .. }
        ));
        assert_eq!(summary.succeeded(Category::Days), 1);
        assert_eq!(summary.succeeded(Category::LabeledPairs), 6);
    }

    #[test]
    fn test_existing_labels_are_kept_unless_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = setup(dir.path());
        let store = LabelStore::new(dir.path().join("labels"));

        build_labels(&[day()], &job, &store, &RunSummary::new("labels"));
        let again = build_labels(&[day()], &job, &store, &RunSummary::new("labels"));
        let outcomes = again[0].result.as_ref().unwrap();
        assert!(outcomes.iter().all(|o| matches!(o, PolicyOutcome::Kept { .. })));

        job.overwrite = true;
        let forced = build_labels(&[day()], &job, &store, &RunSummary::new("labels"));
        let outcomes = forced[0].result.as_ref().unwrap();
        assert!(outcomes.iter().all(|o| matches!(o, PolicyOutcome::Written { .. })));
    }

    #[test]
    fn test_missing_weather_skips_only_that_day() {
        let dir = tempfile::tempdir().unwrap();
        let job = setup(dir.path());
        let store = LabelStore::new(dir.path().join("labels"));
        let summary = RunSummary::new("labels");

        let other: DayId = "20250716".parse().unwrap();
        let outcomes = build_labels(&[other, day()], &job, &store, &summary);
        assert_eq!(outcomes[0].day, day());
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(IngestionError::Io { .. })));
        assert_eq!(summary.skipped(Category::Days), 1);
    }

    #[test]
    fn test_build_features_counts_missing_images() {
        let dir = tempfile::tempdir().unwrap();
        let job = setup(dir.path());
        let store = LabelStore::new(dir.path().join("labels"));
        build_labels(&[day()], &job, &store, &RunSummary::new("labels"));
        std::fs::remove_file(job.image_root.join("20250715").join("202507151012.jpg")).unwrap();

        let feature_job = FeatureJob {
            image_root: job.image_root.clone(),
            output: dir.path().join("features.csv"),
            policy: Some(AlignmentPolicy::Forward),
            append: false,
        };
        let summary = RunSummary::new("features");
        let report = build_features(&store, &feature_job, &Flat, &summary).unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(summary.skipped(Category::FeatureRows), 1);

        let data = load_dataset(&feature_job.output).unwrap();
        assert_eq!(data.len(), 2);
        // 10:01 and 10:08 carry 0.5 mm; 10:12 (dry) was the missing image.
        assert_eq!(data.positives(), 2);
    }

    #[test]
    fn test_failed_rebuild_keeps_existing_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let job = setup(dir.path());
        let store = LabelStore::new(dir.path().join("labels"));
        build_labels(&[day()], &job, &store, &RunSummary::new("labels"));

        let mut feature_job = FeatureJob {
            image_root: job.image_root.clone(),
            output: dir.path().join("features.csv"),
            policy: Some(AlignmentPolicy::Forward),
            append: false,
        };
        build_features(&store, &feature_job, &Flat, &RunSummary::new("features")).unwrap();

        let missing = LabelStore::new(dir.path().join("no-such-labels"));
        let err = build_features(&missing, &feature_job, &Flat, &RunSummary::new("features")).unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(IngestionError::Io { .. })));
        assert_eq!(load_dataset(&feature_job.output).unwrap().len(), 3);

        feature_job.append = true;
        build_features(&missing, &feature_job, &Flat, &RunSummary::new("features")).unwrap_err();
        assert_eq!(load_dataset(&feature_job.output).unwrap().len(), 3);
        assert!(!dir.path().join("features.csv.tmp").exists());
    }
}
