//! Temporal alignment of camera images to weather observations.
//!
//! The station reports every 10 minutes while the camera fires on its own
//! schedule. Each observation claims the images that fall inside a window
//! around its timestamp; the window shape depends on the alignment policy.

use crate::core::types::{DayId, ImageRecord, LabeledPair, WeatherObservation};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cadence of the station table; both policies cover one cadence slot.
pub const WINDOW_WIDTH_MINUTES: i64 = 10;

/// Rule for placing the alignment window around an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlignmentPolicy {
    /// Policy A: `[t, t+9min]`. Windows of consecutive observations tile the day.
    #[serde(rename = "A")]
    Forward,
    /// Policy B: `[t-5min, t+4min]`. Centered on the observation.
    #[serde(rename = "B")]
    Centered,
}

impl AlignmentPolicy {
    pub const ALL: [AlignmentPolicy; 2] = [AlignmentPolicy::Forward, AlignmentPolicy::Centered];

    /// Single-letter tag used in labeled file names.
    pub fn tag(&self) -> &'static str {
        match self {
            AlignmentPolicy::Forward => "A",
            AlignmentPolicy::Centered => "B",
        }
    }

    /// Offsets of the window bounds from the observation time, in minutes.
    fn offsets(&self) -> (i64, i64) {
        match self {
            AlignmentPolicy::Forward => (0, WINDOW_WIDTH_MINUTES - 1),
            AlignmentPolicy::Centered => (-WINDOW_WIDTH_MINUTES / 2, WINDOW_WIDTH_MINUTES / 2 - 1),
        }
    }
}

impl fmt::Display for AlignmentPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for AlignmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "forward" => Ok(AlignmentPolicy::Forward),
            "b" | "centered" | "centred" => Ok(AlignmentPolicy::Centered),
            other => Err(format!("unknown alignment policy '{other}' (expected A or B)")),
        }
    }
}

/// Closed interval of capture times claimed by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentWindow {
    /// First capture time included
    pub start: NaiveDateTime,
    /// Last capture time included
    pub end: NaiveDateTime,
}

impl AlignmentWindow {
    /// Window the policy places around an observation at `observed_at`.
    pub fn for_observation(policy: AlignmentPolicy, observed_at: NaiveDateTime) -> Self {
        let (before, after) = policy.offsets();
        Self {
            start: observed_at + Duration::minutes(before),
            end: observed_at + Duration::minutes(after),
        }
    }

    /// Check if a timestamp falls within this window (both ends included).
    pub fn contains(&self, timestamp: NaiveDateTime) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Check whether two windows share any instant.
    pub fn overlaps(&self, other: &AlignmentWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Match images to observations for one calendar day.
///
/// Observations and images from other days are ignored. Pairs come out in
/// observation order, then in the order images were supplied. Under the
/// centered policy an image can appear under two observations.
pub fn align(
    day: DayId,
    observations: &[WeatherObservation],
    images: &[ImageRecord],
    policy: AlignmentPolicy,
) -> Vec<LabeledPair> {
    let date = day.date();
    let day_images: Vec<&ImageRecord> = images
        .iter()
        .filter(|img| img.captured_at.date() == date)
        .collect();

    let mut pairs = Vec::new();
    for observation in observations
        .iter()
        .filter(|obs| obs.observed_at.date() == date)
    {
        let window = AlignmentWindow::for_observation(policy, observation.observed_at);
        pairs.extend(
            day_images
                .iter()
                .filter(|img| window.contains(img.captured_at))
                .map(|img| LabeledPair::new(observation, img)),
        );
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 15)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn day() -> DayId {
        "20250715".parse().unwrap()
    }

    #[test]
    fn test_forward_window_bounds() {
        let window = AlignmentWindow::for_observation(AlignmentPolicy::Forward, at(10, 0, 0));
        assert_eq!(window.start, at(10, 0, 0));
        assert_eq!(window.end, at(10, 9, 0));

        assert!(window.contains(at(10, 0, 0)));
        assert!(window.contains(at(10, 9, 0)));
        assert!(!window.contains(at(10, 9, 30)));
        assert!(!window.contains(at(9, 59, 59)));
    }

    #[test]
    fn test_forward_windows_tile_without_overlap() {
        let first = AlignmentWindow::for_observation(AlignmentPolicy::Forward, at(10, 0, 0));
        let second = AlignmentWindow::for_observation(AlignmentPolicy::Forward, at(10, 10, 0));
        assert_eq!(second.start, at(10, 10, 0));
        assert_eq!(second.end, at(10, 19, 0));
        assert!(!first.overlaps(&second));
        assert_eq!(second.start - first.start, Duration::minutes(WINDOW_WIDTH_MINUTES));
    }

    #[test]
    fn test_centered_window_is_symmetric() {
        let window = AlignmentWindow::for_observation(AlignmentPolicy::Centered, at(10, 0, 0));
        assert_eq!(window.start, at(9, 55, 0));
        assert_eq!(window.end, at(10, 4, 0));
        // Ten one-minute slots: 9:55 through 10:04.
        assert_eq!(
            (window.end - window.start).num_minutes() + 1,
            WINDOW_WIDTH_MINUTES
        );
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("A".parse::<AlignmentPolicy>().unwrap(), AlignmentPolicy::Forward);
        assert_eq!("b".parse::<AlignmentPolicy>().unwrap(), AlignmentPolicy::Centered);
        assert_eq!("centered".parse::<AlignmentPolicy>().unwrap(), AlignmentPolicy::Centered);
        assert!("C".parse::<AlignmentPolicy>().is_err());
        assert_eq!(AlignmentPolicy::Forward.to_string(), "A");
    }

    #[test]
    fn test_align_forward_scenario() {
        let observations = vec![WeatherObservation::at(at(10, 0, 0))
            .with_precipitation(0.5)
            .with_climate(24.1, 88.0)];
        let images = vec![
            ImageRecord::new("202507151001.jpg", at(10, 1, 0)),
            ImageRecord::new("202507151008.jpg", at(10, 8, 0)),
            ImageRecord::new("20250715100930.jpg", at(10, 9, 30)),
        ];

        let pairs = align(day(), &observations, &images, AlignmentPolicy::Forward);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].image_filename, "202507151001.jpg");
        assert_eq!(pairs[1].image_filename, "202507151008.jpg");
        assert!(pairs.iter().all(|p| p.label_time == at(10, 0, 0)));
        assert!(pairs.iter().all(|p| p.precipitation_mm == Some(0.5)));
    }

    #[test]
    fn test_align_no_images_in_window() {
        let observations = vec![WeatherObservation::at(at(12, 0, 0)).with_precipitation(0.0)];
        let images = vec![ImageRecord::new("202507151030.jpg", at(10, 30, 0))];

        let pairs = align(day(), &observations, &images, AlignmentPolicy::Forward);
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_centered_policy_can_share_images() {
        // Irregular station spacing makes centered windows overlap.
        let observations = vec![
            WeatherObservation::at(at(10, 0, 0)),
            WeatherObservation::at(at(10, 5, 0)),
        ];
        let images = vec![
            ImageRecord::new("202507150958.jpg", at(9, 58, 0)),
            ImageRecord::new("202507151002.jpg", at(10, 2, 0)),
            ImageRecord::new("202507151007.jpg", at(10, 7, 0)),
        ];

        let centered = align(day(), &observations, &images, AlignmentPolicy::Centered);
        let names: Vec<(&str, NaiveDateTime)> = centered
            .iter()
            .map(|p| (p.image_filename.as_str(), p.label_time))
            .collect();
        assert_eq!(
            names,
            vec![
                ("202507150958.jpg", at(10, 0, 0)),
                ("202507151002.jpg", at(10, 0, 0)),
                ("202507151002.jpg", at(10, 5, 0)),
                ("202507151007.jpg", at(10, 5, 0)),
            ]
        );
    }

    #[test]
    fn test_forward_policy_assigns_each_image_once_at_cadence() {
        let observations: Vec<_> = (0..3)
            .map(|i| WeatherObservation::at(at(10, i * 10, 0)))
            .collect();
        let images: Vec<_> = (0..30)
            .map(|m| ImageRecord::new(format!("2025071510{m:02}.jpg"), at(10, m, 0)))
            .collect();

        let pairs = align(day(), &observations, &images, AlignmentPolicy::Forward);
        assert_eq!(pairs.len(), images.len());
    }

    #[test]
    fn test_align_ignores_other_days() {
        let other_day = NaiveDate::from_ymd_opt(2025, 7, 16)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let observations = vec![
            WeatherObservation::at(at(10, 0, 0)),
            WeatherObservation::at(other_day),
        ];
        let images = vec![
            ImageRecord::new("202507151002.jpg", at(10, 2, 0)),
            ImageRecord::new("202507161002.jpg", other_day + Duration::minutes(2)),
        ];

        let pairs = align(day(), &observations, &images, AlignmentPolicy::Forward);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].image_filename, "202507151002.jpg");
    }

    #[test]
    fn test_align_is_deterministic() {
        let observations: Vec<_> = (0..6)
            .map(|i| WeatherObservation::at(at(9, i * 10, 0)))
            .collect();
        let images: Vec<_> = (0..60)
            .map(|m| ImageRecord::new(format!("2025071509{m:02}.jpg"), at(9, m, 0)))
            .collect();

        for policy in AlignmentPolicy::ALL {
            let first = align(day(), &observations, &images, policy);
            let second = align(day(), &observations, &images, policy);
            assert_eq!(first, second);
        }
    }
}
