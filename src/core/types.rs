//! Record types flowing through the alignment pipeline.
//!
//! These types are immutable once built: a weather observation is read once
//! per day, an image record is derived from its filename, and a labeled pair
//! is the product of one observation window and one image.

use crate::error::IngestionError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Image extensions accepted when scanning a day directory.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// A calendar day, written `YYYYMMDD` in file and directory names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayId(NaiveDate);

impl DayId {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// All days from `start` to `end`, both included. Empty if `end < start`.
    pub fn range(start: DayId, end: DayId) -> Vec<DayId> {
        start
            .0
            .iter_days()
            .take_while(|d| *d <= end.0)
            .map(DayId)
            .collect()
    }
}

impl fmt::Display for DayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl FromStr for DayId {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = parse_digits(s, 8)?;
        let date = NaiveDate::from_ymd_opt(
            digits[0..4].iter().fold(0, |acc, d| acc * 10 + *d as i32),
            two_digits(&digits[4..6]),
            two_digits(&digits[6..8]),
        )
        .ok_or_else(|| malformed(s, "not a calendar date"))?;
        Ok(Self(date))
    }
}

/// A camera image identified by its capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// File name within the day directory
    pub filename: String,
    /// Capture time parsed from the file's base name
    pub captured_at: NaiveDateTime,
}

impl ImageRecord {
    pub fn new(filename: impl Into<String>, captured_at: NaiveDateTime) -> Self {
        Self {
            filename: filename.into(),
            captured_at,
        }
    }

    /// Build a record from a file name whose base name is a `YYYYMMDDHHMM`
    /// (or `YYYYMMDDHHMMSS`) token.
    pub fn from_filename(filename: &str) -> Result<Self, IngestionError> {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| malformed(filename, "no base name"))?;
        let captured_at = parse_capture_token(stem)?;
        Ok(Self::new(filename, captured_at))
    }

    pub fn is_image_file(filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
            .unwrap_or(false)
    }
}

/// Parse a fixed-width capture token.
pub fn parse_capture_token(token: &str) -> Result<NaiveDateTime, IngestionError> {
    let digits = match token.len() {
        12 | 14 => parse_digits(token, token.len())?,
        _ => return Err(malformed(token, "expected YYYYMMDDHHMM")),
    };
    let year = digits[0..4].iter().fold(0, |acc, d| acc * 10 + *d as i32);
    let date = NaiveDate::from_ymd_opt(year, two_digits(&digits[4..6]), two_digits(&digits[6..8]))
        .ok_or_else(|| malformed(token, "not a calendar date"))?;
    let second = if digits.len() == 14 {
        two_digits(&digits[12..14])
    } else {
        0
    };
    date.and_hms_opt(two_digits(&digits[8..10]), two_digits(&digits[10..12]), second)
        .ok_or_else(|| malformed(token, "not a time of day"))
}

fn parse_digits(s: &str, len: usize) -> Result<Vec<u8>, IngestionError> {
    if s.len() != len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(s, &format!("expected {len} digits")));
    }
    Ok(s.bytes().map(|b| b - b'0').collect())
}

fn two_digits(d: &[u8]) -> u32 {
    (d[0] as u32) * 10 + d[1] as u32
}

fn malformed(value: &str, reason: &str) -> IngestionError {
    IngestionError::MalformedTimestamp {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// One row of a station's 10-minute weather table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub observed_at: NaiveDateTime,
    pub precipitation_mm: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<String>,
}

impl WeatherObservation {
    /// Observation with only a timestamp; used by tests and builders.
    pub fn at(observed_at: NaiveDateTime) -> Self {
        Self {
            observed_at,
            precipitation_mm: None,
            temperature: None,
            humidity: None,
            wind_speed: None,
            wind_direction: None,
        }
    }

    pub fn with_precipitation(mut self, mm: f64) -> Self {
        self.precipitation_mm = Some(mm);
        self
    }

    pub fn with_climate(mut self, temperature: f64, humidity: f64) -> Self {
        self.temperature = Some(temperature);
        self.humidity = Some(humidity);
        self
    }
}

/// The scalar weather features the model consumes, in schema order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarWeather {
    pub temperature: f64,
    pub humidity: f64,
}

impl ScalarWeather {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
        }
    }

    pub fn to_array(self) -> [f32; 2] {
        [self.temperature as f32, self.humidity as f32]
    }
}

/// An image matched to the observation whose window contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPair {
    pub image_filename: String,
    pub image_time: NaiveDateTime,
    pub label_time: NaiveDateTime,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    /// Reserved column, never populated by the station source
    pub pressure: Option<f64>,
    pub precipitation_mm: Option<f64>,
}

impl LabeledPair {
    pub fn new(observation: &WeatherObservation, image: &ImageRecord) -> Self {
        Self {
            image_filename: image.filename.clone(),
            image_time: image.captured_at,
            label_time: observation.observed_at,
            temperature: observation.temperature,
            humidity: observation.humidity,
            pressure: None,
            precipitation_mm: observation.precipitation_mm,
        }
    }
}
