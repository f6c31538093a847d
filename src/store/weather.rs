//! Reader for the per-day station tables.
//!
//! One file per day, `YYYYMMDD.csv`, with a header row followed by
//! positional columns: time-of-day, precipitation, temperature, humidity,
//! wind speed, wind direction. Fields are read as bytes so legacy encodings
//! in the header or the direction column do not break ingestion.

use crate::core::types::{DayId, WeatherObservation};
use crate::error::IngestionError;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::path::{Path, PathBuf};

/// Number of positional columns every data row must carry.
pub const WEATHER_COLUMNS: usize = 6;

/// Location of a day's weather table under `root`.
pub fn weather_path(root: &Path, day: DayId) -> PathBuf {
    root.join(format!("{day}.csv"))
}

/// Read all observations of `day` from the table at `path`.
pub fn read_weather_csv(path: &Path, day: DayId) -> Result<Vec<WeatherObservation>, IngestionError> {
    let file = std::fs::File::open(path).map_err(|source| IngestionError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let mut observations = Vec::new();
    for result in reader.byte_records() {
        let record = result.map_err(|source| IngestionError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.iter().all(|f| f.iter().all(u8::is_ascii_whitespace)) {
            continue;
        }
        if record.len() < WEATHER_COLUMNS {
            return Err(IngestionError::MissingColumn {
                path: path.to_path_buf(),
                line,
                expected: WEATHER_COLUMNS,
                found: record.len(),
            });
        }

        let field = |i: usize| String::from_utf8_lossy(&record[i]).trim().to_string();
        let measure = |i: usize, name: &'static str, absent: Option<f64>| {
            parse_measure(&field(i), absent).ok_or_else(|| IngestionError::MalformedValue {
                path: path.to_path_buf(),
                line,
                field: name,
                value: field(i),
            })
        };

        let observed_at = parse_time_of_day(day, &field(0))?;
        let direction = field(5);

        observations.push(WeatherObservation {
            observed_at,
            // "--" in the precipitation column means nothing fell.
            precipitation_mm: measure(1, "precipitation", Some(0.0))?,
            temperature: measure(2, "temperature", None)?,
            humidity: measure(3, "humidity", None)?,
            wind_speed: measure(4, "wind speed", None)?,
            wind_direction: if direction.is_empty() { None } else { Some(direction) },
        });
    }

    if observations.is_empty() {
        return Err(IngestionError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(observations)
}

/// Parse `HH:MM` on `day`. `24:00` rolls over to midnight of the next day.
pub fn parse_time_of_day(day: DayId, value: &str) -> Result<NaiveDateTime, IngestionError> {
    let malformed = |reason: &str| IngestionError::MalformedTimestamp {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let (h, m) = value.split_once(':').ok_or_else(|| malformed("expected HH:MM"))?;
    let hour: u32 = h.trim().parse().map_err(|_| malformed("hour is not a number"))?;
    let minute: u32 = m.trim().parse().map_err(|_| malformed("minute is not a number"))?;

    if hour == 24 && minute == 0 {
        return Ok(day.date().and_time(NaiveTime::MIN) + Duration::days(1));
    }

    let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| malformed("out of range"))?;
    Ok(day.date().and_time(time))
}

/// Parse a station measurement.
///
/// Returns `Some(None)` for the station's "no value" marks, `Some(Some(v))`
/// for numbers (quality suffixes stripped), `None` when the text is garbage.
/// `absent` is what the "--" mark stands for in this column.
fn parse_measure(raw: &str, absent: Option<f64>) -> Option<Option<f64>> {
    let text = raw.trim_end_matches(&[')', ']', '#', ' '][..]).trim();
    match text {
        "" | "///" => Some(None),
        "--" => Some(absent),
        // Non-ASCII marks (e.g. the station's "missing" cross) carry no value.
        t if !t.is_ascii() => Some(None),
        t => t.parse::<f64>().ok().filter(|v| v.is_finite()).map(Some),
    }
}
