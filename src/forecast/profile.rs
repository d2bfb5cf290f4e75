//! Heuristic building load profile
//!
//! Multipliers applied to a baseline load: time of day, weekend and
//! extreme-temperature adjustments. Hours and weekdays are evaluated in the
//! building's local timezone.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;

const MORNING_FACTOR: f64 = 1.2;
const BUSINESS_FACTOR: f64 = 1.4;
const EVENING_FACTOR: f64 = 1.1;
const NIGHT_FACTOR: f64 = 0.6;
const WEEKEND_FACTOR: f64 = 0.7;
const EXTREME_TEMPERATURE_FACTOR: f64 = 1.15;
const HOT_ABOVE_C: f64 = 25.0;
const COLD_BELOW_C: f64 = 10.0;

/// 06-09 morning ramp, 09-17 business hours, 17-20 evening, otherwise night.
pub fn time_of_day_factor(hour: u32) -> f64 {
    match hour {
        6..=8 => MORNING_FACTOR,
        9..=16 => BUSINESS_FACTOR,
        17..=19 => EVENING_FACTOR,
        _ => NIGHT_FACTOR,
    }
}

pub fn weekend_factor(weekday: Weekday) -> f64 {
    match weekday {
        Weekday::Sat | Weekday::Sun => WEEKEND_FACTOR,
        _ => 1.0,
    }
}

pub fn temperature_factor(temperature_c: Option<f64>) -> f64 {
    match temperature_c {
        Some(t) if t > HOT_ABOVE_C || t < COLD_BELOW_C => EXTREME_TEMPERATURE_FACTOR,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadProfile {
    tz: Tz,
}

impl LoadProfile {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Combined multiplier for one hour
    pub fn factor(&self, at: DateTime<Utc>, temperature_c: Option<f64>) -> f64 {
        let local = at.with_timezone(&self.tz);
        time_of_day_factor(local.hour())
            * weekend_factor(local.weekday())
            * temperature_factor(temperature_c)
    }
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}

/// Round to two decimals
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// First whole hour strictly after `now`
pub fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let start = secs - secs.rem_euclid(3600) + 3600;
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}
