//! Solar event arithmetic — sunrise, sunset, and twilight times from
//! geographic coordinates.
//!
//! Times come from the standard low-precision solar position equations
//! (Meeus). Accuracy is on the order of a minute, which is plenty for
//! scheduling household rules. Events that the sun never reaches on a
//! given date (polar day/night) are reported as `None`; the scheduler
//! substitutes its end-of-day fallback for those.

use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// The fixed solar event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AstroEvent {
    SolarNoon,
    Nadir,
    Sunrise,
    Sunset,
    SunriseEnd,
    SunsetStart,
    Dawn,
    Dusk,
    NauticalDawn,
    NauticalDusk,
    NightEnd,
    Night,
    GoldenHourEnd,
    GoldenHour,
}

/// Every event, in vocabulary order. Used for case-insensitive name
/// normalization.
pub const ALL_EVENTS: [AstroEvent; 14] = [
    AstroEvent::SolarNoon,
    AstroEvent::Nadir,
    AstroEvent::Sunrise,
    AstroEvent::Sunset,
    AstroEvent::SunriseEnd,
    AstroEvent::SunsetStart,
    AstroEvent::Dawn,
    AstroEvent::Dusk,
    AstroEvent::NauticalDawn,
    AstroEvent::NauticalDusk,
    AstroEvent::NightEnd,
    AstroEvent::Night,
    AstroEvent::GoldenHourEnd,
    AstroEvent::GoldenHour,
];

impl AstroEvent {
    /// The camelCase name as written in rule scripts.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::SolarNoon => "solarNoon",
            Self::Nadir => "nadir",
            Self::Sunrise => "sunrise",
            Self::Sunset => "sunset",
            Self::SunriseEnd => "sunriseEnd",
            Self::SunsetStart => "sunsetStart",
            Self::Dawn => "dawn",
            Self::Dusk => "dusk",
            Self::NauticalDawn => "nauticalDawn",
            Self::NauticalDusk => "nauticalDusk",
            Self::NightEnd => "nightEnd",
            Self::Night => "night",
            Self::GoldenHourEnd => "goldenHourEnd",
            Self::GoldenHour => "goldenHour",
        }
    }

    /// Events whose no-occurrence fallback is 23:59:59 instead of
    /// 23:59:58, so "end" events keep firing fractionally before the
    /// generic ones on fallback days.
    #[must_use]
    pub fn is_end_of_day(self) -> bool {
        matches!(
            self,
            Self::SunriseEnd | Self::GoldenHourEnd | Self::Sunset | Self::NightEnd | Self::NauticalDusk
        )
    }
}

impl fmt::Display for AstroEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AstroEvent {
    type Err = ScheduleError;

    /// Case-insensitive match against the fixed vocabulary.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_EVENTS
            .into_iter()
            .find(|event| event.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ScheduleError::UnknownAstroEvent(s.to_string()))
    }
}

/// Event times for one date. `None` when the sun never crosses the
/// event's altitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunTimes {
    pub solar_noon: Option<DateTime<Utc>>,
    pub nadir: Option<DateTime<Utc>>,
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
    pub sunrise_end: Option<DateTime<Utc>>,
    pub sunset_start: Option<DateTime<Utc>>,
    pub dawn: Option<DateTime<Utc>>,
    pub dusk: Option<DateTime<Utc>>,
    pub nautical_dawn: Option<DateTime<Utc>>,
    pub nautical_dusk: Option<DateTime<Utc>>,
    pub night_end: Option<DateTime<Utc>>,
    pub night: Option<DateTime<Utc>>,
    pub golden_hour_end: Option<DateTime<Utc>>,
    pub golden_hour: Option<DateTime<Utc>>,
}

impl SunTimes {
    /// The computed time of one event.
    #[must_use]
    pub fn get(&self, event: AstroEvent) -> Option<DateTime<Utc>> {
        match event {
            AstroEvent::SolarNoon => self.solar_noon,
            AstroEvent::Nadir => self.nadir,
            AstroEvent::Sunrise => self.sunrise,
            AstroEvent::Sunset => self.sunset,
            AstroEvent::SunriseEnd => self.sunrise_end,
            AstroEvent::SunsetStart => self.sunset_start,
            AstroEvent::Dawn => self.dawn,
            AstroEvent::Dusk => self.dusk,
            AstroEvent::NauticalDawn => self.nautical_dawn,
            AstroEvent::NauticalDusk => self.nautical_dusk,
            AstroEvent::NightEnd => self.night_end,
            AstroEvent::Night => self.night,
            AstroEvent::GoldenHourEnd => self.golden_hour_end,
            AstroEvent::GoldenHour => self.golden_hour,
        }
    }
}

const MILLIS_PER_DAY: f64 = 86_400_000.0;
const J1970: f64 = 2_440_588.0;
const J2000: f64 = 2_451_545.0;
const J0: f64 = 0.0009;

fn to_days(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / MILLIS_PER_DAY - 0.5 + J1970 - J2000
}

fn from_julian(j: f64) -> Option<DateTime<Utc>> {
    if !j.is_finite() {
        return None;
    }
    let millis = (j + 0.5 - J1970) * MILLIS_PER_DAY;
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn solar_mean_anomaly(d: f64) -> f64 {
    (357.5291 + 0.985_600_28 * d).to_radians()
}

fn ecliptic_longitude(m: f64) -> f64 {
    // Equation of center plus perihelion of the Earth.
    let center = (1.9148 * m.sin() + 0.02 * (2.0 * m).sin() + 0.0003 * (3.0 * m).sin()).to_radians();
    m + center + 102.9372_f64.to_radians() + std::f64::consts::PI
}

fn declination(l: f64) -> f64 {
    let obliquity = 23.4397_f64.to_radians();
    (l.sin() * obliquity.sin()).asin()
}

/// NaN when the sun never reaches altitude `h` at this latitude.
fn hour_angle(h: f64, phi: f64, dec: f64) -> f64 {
    ((h.sin() - phi.sin() * dec.sin()) / (phi.cos() * dec.cos())).acos()
}

fn julian_cycle(d: f64, lw: f64) -> f64 {
    (d - J0 - lw / TAU).round()
}

fn approx_transit(ht: f64, lw: f64, n: f64) -> f64 {
    J0 + (ht + lw) / TAU + n
}

fn solar_transit(ds: f64, m: f64, l: f64) -> f64 {
    J2000 + ds + 0.0053 * m.sin() - 0.0069 * (2.0 * l).sin()
}

/// Compute every solar event for the date of `at` (the solar transit
/// nearest to it) at the given coordinates.
#[must_use]
pub fn sun_times(at: DateTime<Utc>, latitude: f64, longitude: f64) -> SunTimes {
    let lw = -longitude.to_radians();
    let phi = latitude.to_radians();

    let d = to_days(at);
    let n = julian_cycle(d, lw);
    let ds = approx_transit(0.0, lw, n);
    let m = solar_mean_anomaly(ds);
    let l = ecliptic_longitude(m);
    let dec = declination(l);
    let j_noon = solar_transit(ds, m, l);

    // Morning/evening pair for one sun altitude, in degrees.
    let pair = |angle: f64| {
        let w = hour_angle(angle.to_radians(), phi, dec);
        if !w.is_finite() {
            return (None, None);
        }
        let j_set = solar_transit(approx_transit(w, lw, n), m, l);
        let j_rise = j_noon - (j_set - j_noon);
        (from_julian(j_rise), from_julian(j_set))
    };

    let (sunrise, sunset) = pair(-0.833);
    let (sunrise_end, sunset_start) = pair(-0.3);
    let (dawn, dusk) = pair(-6.0);
    let (nautical_dawn, nautical_dusk) = pair(-12.0);
    let (night_end, night) = pair(-18.0);
    let (golden_hour_end, golden_hour) = pair(6.0);

    SunTimes {
        solar_noon: from_julian(j_noon),
        nadir: from_julian(j_noon - 0.5),
        sunrise,
        sunset,
        sunrise_end,
        sunset_start,
        dawn,
        dusk,
        nautical_dawn,
        nautical_dusk,
        night_end,
        night,
        golden_hour_end,
        golden_hour,
    }
}
