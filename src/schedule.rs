// MIT License - Copyright (c) 2026 Peter Wright
// Time-of-day lighting schedule

use std::fmt;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::{LightsError, Result};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Wall-clock time of a schedule entry.
///
/// Accepts a TOML local time (`07:30:00`), an integer `HHMM` (`730`) or an
/// ISO time string (`"07:30"`, `"07:30:00"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(pub NaiveTime);

impl TimeOfDay {
    pub fn from_hhmm(value: u64) -> Result<Self> {
        let (hour, minute) = (value / 100, value % 100);
        u32::try_from(hour)
            .ok()
            .and_then(|hour| NaiveTime::from_hms_opt(hour, minute as u32, 0))
            .map(Self)
            .ok_or_else(|| LightsError::config(format!("invalid HHMM time: {value}")))
    }

    pub fn parse(s: &str) -> Result<Self> {
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map(Self)
            .map_err(|_| LightsError::config(format!("invalid time of day: {s}")))
    }

    fn seconds(&self) -> f64 {
        f64::from(self.0.num_seconds_from_midnight())
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TimeVisitor;

        impl<'de> Visitor<'de> for TimeVisitor {
            type Value = TimeOfDay;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a local time, an HHMM integer or an ISO time string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<TimeOfDay, E> {
                TimeOfDay::from_hhmm(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<TimeOfDay, E> {
                let v = u64::try_from(v).map_err(|_| E::custom(format!("invalid HHMM time: {v}")))?;
                self.visit_u64(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<TimeOfDay, E> {
                TimeOfDay::parse(v).map_err(E::custom)
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> std::result::Result<TimeOfDay, A::Error> {
                let datetime =
                    toml::value::Datetime::deserialize(de::value::MapAccessDeserializer::new(map))?;
                if datetime.date.is_some() || datetime.offset.is_some() {
                    return Err(de::Error::custom(format!("expected a local time, got {datetime}")));
                }
                let time = datetime
                    .time
                    .ok_or_else(|| de::Error::custom("missing time of day"))?;
                NaiveTime::from_hms_opt(time.hour.into(), time.minute.into(), time.second.into())
                    .map(TimeOfDay)
                    .ok_or_else(|| de::Error::custom(format!("invalid time of day: {datetime}")))
            }
        }

        deserializer.deserialize_any(TimeVisitor)
    }
}

/// Parse a transition such as `"30s"`, `"10m"` or `"1h"`.
pub fn parse_transition(s: &str) -> Result<Duration> {
    let invalid = || LightsError::config(format!("invalid transition: {s}"));
    let trimmed = s.trim();
    let unit = trimmed.chars().last().ok_or_else(invalid)?;
    let amount: u64 = trimmed[..trimmed.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        _ => return Err(invalid()),
    };
    let seconds = amount.checked_mul(scale).ok_or_else(invalid)?;
    Ok(Duration::from_secs(seconds))
}

fn deserialize_transition<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_transition(&raw).map_err(de::Error::custom)
}

/// One point of the daily schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduleEntry {
    pub time: TimeOfDay,
    /// Percentage, 0-100.
    pub brightness: u8,
    /// Kelvin.
    pub temperature: u32,
    /// How long before `time` the fade towards this entry starts.
    #[serde(deserialize_with = "deserialize_transition")]
    pub transition: Duration,
}

/// Target lighting at one moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lighting {
    /// Brightness as a fraction, 0.0-1.0.
    pub brightness: f64,
    /// Kelvin.
    pub temperature: u32,
}

/// A validated schedule, sorted by time of day and treated as cyclic across midnight.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new(mut entries: Vec<ScheduleEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(LightsError::config("schedule has no entries"));
        }
        entries.sort_by_key(|e| e.time);

        for pair in entries.windows(2) {
            if pair[0].time == pair[1].time {
                return Err(LightsError::config(format!(
                    "schedule has two entries at {}",
                    pair[0].time.0
                )));
            }
        }
        for entry in &entries {
            if entry.brightness > 100 {
                return Err(LightsError::config(format!(
                    "brightness {}% at {} is above 100%",
                    entry.brightness, entry.time.0
                )));
            }
            if entry.temperature == 0 {
                return Err(LightsError::config(format!(
                    "temperature at {} must be positive",
                    entry.time.0
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Interpolated lighting at `now`.
    ///
    /// Between two entries the value holds at the earlier one until the later
    /// entry's transition window opens, then fades linearly so it arrives
    /// exactly at the later entry's time.
    pub fn lighting_at(&self, now: NaiveTime) -> Lighting {
        let now = f64::from(now.num_seconds_from_midnight());
        let n = self.entries.len();

        for (i, next) in self.entries.iter().enumerate() {
            let (prev, prev_at) = if i == 0 {
                let last = &self.entries[n - 1];
                (last, last.time.seconds() - SECONDS_PER_DAY)
            } else {
                let prev = &self.entries[i - 1];
                (prev, prev.time.seconds())
            };
            let next_at = next.time.seconds();
            if now >= prev_at && now <= next_at {
                return interpolate(prev, next, next_at - now);
            }
        }

        // Past the last entry: fade towards the first entry of the next day.
        let first = &self.entries[0];
        let last = &self.entries[n - 1];
        interpolate(last, first, first.time.seconds() + SECONDS_PER_DAY - now)
    }
}

fn interpolate(prev: &ScheduleEntry, next: &ScheduleEntry, remaining_secs: f64) -> Lighting {
    let window = next.transition.as_secs_f64();
    let fraction = if window > 0.0 {
        (1.0 - remaining_secs / window).clamp(0.0, 1.0)
    } else if remaining_secs <= 0.0 {
        1.0
    } else {
        0.0
    };

    let from = f64::from(prev.brightness) / 100.0;
    let to = f64::from(next.brightness) / 100.0;
    let temperature = f64::from(prev.temperature)
        + (f64::from(next.temperature) - f64::from(prev.temperature)) * fraction;

    Lighting {
        brightness: from + (to - from) * fraction,
        temperature: temperature.round() as u32,
    }
}
