//! rain-nowcast CLI
//!
//! Builds labeled data from sky images and station tables, trains the
//! forecaster and runs multi-horizon predictions.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rain_nowcast::{
    config::{parse_horizons, parse_policies, Config},
    core::DayId,
    model::TrainingReport,
    pipeline::{self, EvaluationSet, FeatureJob, LabelJob, PolicyOutcome},
    store::LabelStore,
    summary::{RunSummary, SummaryStats},
    DualHeadModel, MultiHorizonPredictor, ScalarWeather, ThumbnailEmbedder, VERSION,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rain-nowcast")]
#[command(version = VERSION)]
#[command(about = "Sky-camera rain nowcasting", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair images with weather observations and write labeled files
    Labels {
        /// First day to process (YYYYMMDD); defaults to every day found
        #[arg(long)]
        start: Option<DayId>,

        /// Last day to process (YYYYMMDD), inclusive
        #[arg(long)]
        end: Option<DayId>,

        /// Alignment policies to produce (A, B or all)
        #[arg(long)]
        policies: Option<String>,

        /// Rewrite labeled files that already exist
        #[arg(long)]
        overwrite: bool,

        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Embed labeled images into the feature dataset
    Features {
        /// Only use labeled files of this policy
        #[arg(long)]
        policy: Option<String>,

        /// Add rows to the existing dataset instead of replacing it
        #[arg(long)]
        append: bool,

        /// Dataset file to write
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Train the forecaster on the feature dataset
    Train {
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Where to save the model
        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Score a trained model against the feature dataset
    Evaluate {
        #[arg(long)]
        dataset: Option<PathBuf>,

        #[arg(long)]
        model: Option<PathBuf>,

        /// Score every row instead of the held-out validation rows
        #[arg(long)]
        all: bool,

        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Forecast rain from the current image and weather
    Predict {
        /// Current sky image
        #[arg(long)]
        image: PathBuf,

        /// Current temperature (°C)
        #[arg(long, allow_hyphen_values = true)]
        temperature: f64,

        /// Current relative humidity (%)
        #[arg(long)]
        humidity: f64,

        /// Horizons in minutes, comma-separated
        #[arg(long)]
        horizons: Option<String>,

        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long)]
        threshold: Option<f64>,

        /// Print forecasts as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the last run summary
    Status,

    /// Show configuration
    Config {
        /// Write the current (or default) configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    if let Err(e) = run(cli.command, &config_path) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_from(config_path).with_context(|| format!("loading {}", config_path.display()))?;

    match command {
        Commands::Labels {
            start,
            end,
            policies,
            overwrite,
            workers,
        } => cmd_labels(&config, start, end, policies.as_deref(), overwrite, workers),
        Commands::Features { policy, append, output } => cmd_features(&config, policy.as_deref(), append, output),
        Commands::Train {
            dataset,
            model,
            epochs,
            seed,
        } => cmd_train(&config, dataset, model, epochs, seed),
        Commands::Evaluate {
            dataset,
            model,
            all,
            threshold,
        } => cmd_evaluate(&config, dataset, model, all, threshold),
        Commands::Predict {
            image,
            temperature,
            humidity,
            horizons,
            model,
            threshold,
            json,
        } => cmd_predict(
            &config,
            &image,
            ScalarWeather::new(temperature, humidity),
            horizons.as_deref(),
            model,
            threshold,
            json,
        ),
        Commands::Status => {
            cmd_status(&config);
            Ok(())
        }
        Commands::Config { init } => cmd_config(&config, config_path, init),
    }
}

fn new_summary(config: &Config, command: &str) -> RunSummary {
    RunSummary::with_persistence(command, config.data_path.join("last_run.json"))
}

fn finish(summary: &RunSummary) {
    println!();
    println!("{}", summary.summary());
    if let Err(e) = summary.save() {
        eprintln!("Warning: Could not save run summary: {e}");
    }
}

/// Day directories under the image root, sorted.
fn discover_days(image_root: &Path) -> anyhow::Result<Vec<DayId>> {
    let entries = std::fs::read_dir(image_root).with_context(|| format!("listing {}", image_root.display()))?;
    let mut days: Vec<DayId> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().and_then(|name| name.parse().ok()))
        .collect();
    days.sort();
    Ok(days)
}

fn cmd_labels(
    config: &Config,
    start: Option<DayId>,
    end: Option<DayId>,
    policies: Option<&str>,
    overwrite: bool,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let policies = match policies {
        Some(s) => parse_policies(s).map_err(anyhow::Error::msg)?,
        None => config.policies.clone(),
    };

    let days = match (start, end) {
        (Some(start), Some(end)) => {
            if end < start {
                bail!("end day {end} is before start day {start}");
            }
            DayId::range(start, end)
        }
        (Some(day), None) | (None, Some(day)) => vec![day],
        (None, None) => discover_days(&config.image_root)?,
    };
    if days.is_empty() {
        println!("No days to process under {}", config.image_root.display());
        return Ok(());
    }

    config.ensure_directories().context("creating output directories")?;
    let job = LabelJob {
        image_root: config.image_root.clone(),
        weather_root: config.weather_root.clone(),
        policies,
        overwrite,
        workers: workers.unwrap_or(config.workers).max(1),
    };
    let store = LabelStore::new(&config.labels_root);
    let summary = new_summary(config, "labels");

    let outcomes = pipeline::build_labels(&days, &job, &store, &summary);
    for outcome in &outcomes {
        match &outcome.result {
            Ok(results) => {
                for result in results {
                    match result {
                        PolicyOutcome::Written { policy, path, pairs } => {
                            println!("{} [{}] {} pairs -> {}", outcome.day, policy, pairs, path.display())
                        }
                        PolicyOutcome::NoPairs { policy } => println!("{} [{}] no pairs", outcome.day, policy),
                        PolicyOutcome::Kept { policy, path } => {
                            println!("{} [{}] kept {}", outcome.day, policy, path.display())
                        }
                    }
                }
            }
            Err(e) => println!("{} skipped: {}", outcome.day, e),
        }
    }

    finish(&summary);
    Ok(())
}

fn cmd_features(config: &Config, policy: Option<&str>, append: bool, output: Option<PathBuf>) -> anyhow::Result<()> {
    let policy = policy.map(str::parse).transpose().map_err(anyhow::Error::msg)?;
    let job = FeatureJob {
        image_root: config.image_root.clone(),
        output: output.unwrap_or_else(|| config.dataset_path.clone()),
        policy,
        append,
    };
    let store = LabelStore::new(&config.labels_root);
    let embedder = ThumbnailEmbedder::new(config.thumbnail);
    let summary = new_summary(config, "features");

    let report = pipeline::build_features(&store, &job, &embedder, &summary)?;
    println!(
        "Wrote {} rows from {} labeled files to {}",
        report.rows_written,
        report.files,
        report.output.display()
    );

    finish(&summary);
    Ok(())
}

fn cmd_train(
    config: &Config,
    dataset: Option<PathBuf>,
    model_path: Option<PathBuf>,
    epochs: Option<usize>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let dataset = dataset.unwrap_or_else(|| config.dataset_path.clone());
    let model_path = model_path.unwrap_or_else(|| config.model_path.clone());
    let mut training = config.training.clone();
    if let Some(epochs) = epochs {
        training.max_epochs = epochs.max(1);
    }
    if let Some(seed) = seed {
        training.seed = seed;
    }

    let summary = new_summary(config, "train");
    let model = pipeline::train_from_dataset(&dataset, &model_path, config.adapter, &training, &summary)?;

    if let Some(report) = model.report() {
        print_training_report(report);
    }
    println!("Model saved to {}", model_path.display());

    finish(&summary);
    Ok(())
}

fn print_training_report(report: &TrainingReport) {
    println!("Training");
    println!("========");
    println!("  Rows: {} train, {} validation", report.train_rows, report.validation_rows);
    println!("  Epochs run: {}", report.epochs_run);
    match report.best_val_loss {
        Some(loss) => println!("  Best validation loss: {:.4} (epoch {})", loss, report.best_epoch),
        None => println!("  Best validation loss: n/a"),
    }
    if report.stopped_early {
        println!("  Stopped early");
    }
}

fn cmd_evaluate(
    config: &Config,
    dataset: Option<PathBuf>,
    model_path: Option<PathBuf>,
    all: bool,
    threshold: Option<f64>,
) -> anyhow::Result<()> {
    let dataset = dataset.unwrap_or_else(|| config.dataset_path.clone());
    let model_path = model_path.unwrap_or_else(|| config.model_path.clone());
    let set = if all { EvaluationSet::All } else { EvaluationSet::Holdout };

    let report = pipeline::evaluate_saved_model(&dataset, &model_path, set, threshold.unwrap_or(config.threshold))?;
    println!("{report}");
    Ok(())
}

fn cmd_predict(
    config: &Config,
    image: &Path,
    weather: ScalarWeather,
    horizons: Option<&str>,
    model_path: Option<PathBuf>,
    threshold: Option<f64>,
    json: bool,
) -> anyhow::Result<()> {
    let horizons = match horizons {
        Some(s) => parse_horizons(s).map_err(anyhow::Error::msg)?,
        None => config.horizons.clone(),
    };
    let model_path = model_path.unwrap_or_else(|| config.model_path.clone());
    let model = DualHeadModel::load(&model_path)?;
    let embedder = ThumbnailEmbedder::new(config.thumbnail);
    let predictor =
        MultiHorizonPredictor::new(&model, &embedder).with_threshold(threshold.unwrap_or(config.threshold));

    let forecasts = predictor.predict_horizons(image, weather, &horizons)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&forecasts)?);
    } else {
        println!("Forecast for {}", image.display());
        for forecast in &forecasts {
            println!("  {forecast}");
        }
    }
    Ok(())
}

fn cmd_status(config: &Config) {
    println!("rain-nowcast status");
    println!("===================");
    println!();
    println!("Images:   {}", config.image_root.display());
    println!("Weather:  {}", config.weather_root.display());
    println!("Labels:   {}", config.labels_root.display());
    println!(
        "Dataset:  {}{}",
        config.dataset_path.display(),
        if config.dataset_path.exists() { "" } else { " (missing)" }
    );
    println!(
        "Model:    {}{}",
        config.model_path.display(),
        if config.model_path.exists() { "" } else { " (missing)" }
    );
    println!();

    let stats_path = config.data_path.join("last_run.json");
    let stats = std::fs::read_to_string(&stats_path)
        .ok()
        .and_then(|content| serde_json::from_str::<SummaryStats>(&content).ok());
    match stats {
        Some(stats) => {
            println!("Last run: {} ({}) at {}", stats.command, stats.run_id, stats.finished_at);
            for c in &stats.categories {
                println!("  {:<14} {:>7} succeeded, {:>5} skipped", c.category.label(), c.succeeded, c.skipped);
            }
        }
        None => println!("No previous run found."),
    }
}

fn cmd_config(config: &Config, config_path: &Path, init: bool) -> anyhow::Result<()> {
    if init {
        config.save_to(config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", config_path);
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
