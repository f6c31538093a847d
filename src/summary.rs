//! Per-run accounting of processed and skipped units.
//!
//! Counters are atomics so scoped workers can share one `&RunSummary`
//! without locking. The summary is printed at the end of every command and
//! persisted as JSON next to the other run data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Kind of unit a counter tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Days,
    ImageFiles,
    LabeledPairs,
    FeatureRows,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Days,
        Category::ImageFiles,
        Category::LabeledPairs,
        Category::FeatureRows,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Days => "Days",
            Category::ImageFiles => "Image files",
            Category::LabeledPairs => "Labeled pairs",
            Category::FeatureRows => "Feature rows",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a unit went through or was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Skipped,
}

/// Counters for one command invocation.
#[derive(Debug)]
pub struct RunSummary {
    run_id: Uuid,
    command: String,
    started_at: DateTime<Utc>,
    /// Indexed by category, then outcome
    counters: [[AtomicU64; 2]; 4],
    persist_path: Option<PathBuf>,
}

impl RunSummary {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            command: command.into(),
            started_at: Utc::now(),
            counters: Default::default(),
            persist_path: None,
        }
    }

    /// Summary that [`RunSummary::save`] writes to `path`.
    pub fn with_persistence(command: impl Into<String>, path: PathBuf) -> Self {
        let mut summary = Self::new(command);
        summary.persist_path = Some(path);
        summary
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record(&self, category: Category, outcome: Outcome) {
        self.record_many(category, outcome, 1);
    }

    pub fn record_many(&self, category: Category, outcome: Outcome, count: u64) {
        let slot = match outcome {
            Outcome::Succeeded => 0,
            Outcome::Skipped => 1,
        };
        self.counters[category.index()][slot].fetch_add(count, Ordering::Relaxed);
    }

    pub fn succeeded(&self, category: Category) -> u64 {
        self.counters[category.index()][0].load(Ordering::Relaxed)
    }

    pub fn skipped(&self, category: Category) -> u64 {
        self.counters[category.index()][1].load(Ordering::Relaxed)
    }

    /// Snapshot of every counter.
    pub fn stats(&self) -> SummaryStats {
        let finished_at = Utc::now();
        SummaryStats {
            run_id: self.run_id,
            command: self.command.clone(),
            started_at: self.started_at,
            finished_at,
            duration_secs: (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            categories: Category::ALL
                .iter()
                .map(|&category| CategoryStats {
                    category,
                    succeeded: self.succeeded(category),
                    skipped: self.skipped(category),
                })
                .filter(|c| c.succeeded + c.skipped > 0)
                .collect(),
        }
    }

    /// Human-readable summary for the end of a command.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "Run {} ({}), {:.1}s",
            stats.run_id, stats.command, stats.duration_secs
        );
        if stats.categories.is_empty() {
            out.push_str("\n  Nothing processed");
        }
        for c in &stats.categories {
            out.push_str(&format!(
                "\n  {:<14} {:>7} succeeded, {:>5} skipped",
                c.category.label(),
                c.succeeded,
                c.skipped
            ));
        }
        out
    }

    /// Write the snapshot to the persistence path, if one was set.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&self.stats()).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }
}

/// Counts for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: Category,
    pub succeeded: u64,
    pub skipped: u64,
}

/// Serializable snapshot of a [`RunSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStats {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub categories: Vec<CategoryStats>,
}
