//! Time-weighted averaging of station reports over a ride interval.
//!
//! Each variable is reduced independently: the series is linearly
//! interpolated at both interval ends, then integrated with the trapezoidal
//! rule over the interval and divided by its length. A variable is null
//! unless at least two finite samples bracket the whole interval; nothing
//! is ever extrapolated.
//!
//! Wind is averaged as east/north components so that 359° and 1° average to
//! north instead of south.

use chrono::{DateTime, Utc};

use crate::db::models::{AveragedWeather, WeatherObservation};
use crate::errors::AverageError;
use crate::helpers::finite;
use crate::services::metar::{rain_index, snow_index};

/// Temperature lapse rate (°C per metre of ascent).
const LAPSE_RATE_C_PER_M: f64 = 6.4 / 1000.0;
/// Scale factor of the barometric formula (m per kelvin).
const BAROMETRIC_SCALE_M_PER_K: f64 = 29.263;
const KELVIN_OFFSET: f64 = 273.15;

/// Elevations used to move station readings to the ride's altitude.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AltitudeCorrection {
    pub station_elevation_m: Option<f64>,
    pub target_elevation_m: Option<f64>,
}

impl AltitudeCorrection {
    /// Target minus station elevation; zero when either is unknown.
    pub fn delta_m(&self) -> f64 {
        match (self.station_elevation_m, self.target_elevation_m) {
            (Some(station), Some(target)) if station.is_finite() && target.is_finite() => {
                target - station
            }
            _ => 0.0,
        }
    }
}

/// Station temperature moved `delta_m` metres up (or down).
pub fn corrected_temperature(temperature_c: f64, delta_m: f64) -> f64 {
    temperature_c - delta_m * LAPSE_RATE_C_PER_M
}

/// Station pressure moved `delta_m` metres up (or down), using the station
/// temperature for the scale height.
pub fn corrected_pressure(pressure_hpa: f64, temperature_c: f64, delta_m: f64) -> f64 {
    pressure_hpa * (-delta_m / ((temperature_c + KELVIN_OFFSET) * BAROMETRIC_SCALE_M_PER_K)).exp()
}

/// Saturation vapour pressure (hPa) over water.
fn vapour_pressure_hpa(temperature_c: f64) -> f64 {
    6.1121 * ((18.678 - temperature_c / 234.5) * (temperature_c / (257.14 + temperature_c))).exp()
}

/// Relative humidity as a fraction, from temperature and dew point.
pub fn relative_humidity(temperature_c: f64, dew_point_c: f64) -> f64 {
    vapour_pressure_hpa(dew_point_c) / vapour_pressure_hpa(temperature_c)
}

/// A finite reading, seconds after the interval start.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    t: f64,
    value: f64,
}

/// Value at `t`. `samples` are sorted and must bracket `t`.
fn interpolate(samples: &[Sample], t: f64) -> f64 {
    let next_idx = samples.partition_point(|s| s.t < t);
    let Some(next) = samples.get(next_idx) else {
        return samples[samples.len() - 1].value;
    };
    if next.t == t || next_idx == 0 {
        return next.value;
    }
    let prev = samples[next_idx - 1];
    let span = next.t - prev.t;
    if span <= 0.0 {
        return prev.value;
    }
    let weight = (t - prev.t) / span;
    prev.value + weight * (next.value - prev.value)
}

/// Trapezoidal mean of `samples` over `[0, duration]`, or `None` when the
/// samples do not bracket the interval.
fn time_weighted_mean(samples: &[Sample], duration: f64) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let (first, last) = (samples[0], samples[samples.len() - 1]);
    if first.t > 0.0 || last.t < duration {
        return None;
    }

    let mut points = Vec::with_capacity(samples.len() + 2);
    points.push(Sample {
        t: 0.0,
        value: interpolate(samples, 0.0),
    });
    points.extend(samples.iter().filter(|s| s.t > 0.0 && s.t < duration).copied());
    points.push(Sample {
        t: duration,
        value: interpolate(samples, duration),
    });

    let integral: f64 = points
        .windows(2)
        .map(|w| (w[1].t - w[0].t) * (w[0].value + w[1].value) / 2.0)
        .sum();
    Some(integral / duration)
}

/// Finite values of one variable, timed relative to `start`.
fn series(
    sorted: &[&WeatherObservation],
    start: DateTime<Utc>,
    extract: &dyn Fn(&WeatherObservation) -> Option<f64>,
) -> Vec<Sample> {
    sorted
        .iter()
        .filter_map(|o| {
            let value = finite(extract(o))?;
            let t = (o.report_time - start).num_milliseconds() as f64 / 1000.0;
            Some(Sample { t, value })
        })
        .collect()
}

/// Average every variable of `observations` over `[interval_start, interval_end]`.
///
/// Observations may arrive in any order. Only an empty observation set or
/// an empty interval is an error; missing coverage of a single variable
/// leaves that field null.
pub fn average(
    observations: &[WeatherObservation],
    interval_start: DateTime<Utc>,
    interval_end: DateTime<Utc>,
    correction: AltitudeCorrection,
) -> Result<AveragedWeather, AverageError> {
    let first = observations.first().ok_or(AverageError::NoObservations)?;
    if interval_end <= interval_start {
        return Err(AverageError::EmptyInterval);
    }
    let duration = (interval_end - interval_start).num_milliseconds() as f64 / 1000.0;
    let delta_m = correction.delta_m();

    let mut sorted: Vec<&WeatherObservation> = observations.iter().collect();
    sorted.sort_by_key(|o| o.report_time);
    let mean = |extract: &dyn Fn(&WeatherObservation) -> Option<f64>| -> Option<f64> {
        time_weighted_mean(&series(&sorted, interval_start, extract), duration)
    };

    let temperature_c = mean(&|o| o.temperature_c.map(|t| corrected_temperature(t, delta_m)));
    let pressure_hpa = mean(&|o| {
        let temperature = finite(o.temperature_c)?;
        o.pressure_hpa
            .map(|p| corrected_pressure(p, temperature, delta_m))
    });
    let dew_point_c = mean(&|o| o.dew_point_c);
    let gust_mph = mean(&|o| o.gust_mph);
    let rain = mean(&|o| Some(rain_index(&o.weather)));
    let snow = mean(&|o| Some(snow_index(&o.weather)));

    let wind_components = |o: &WeatherObservation| -> Option<(f64, f64)> {
        let speed = finite(o.wind_speed_mph)?;
        let direction = finite(o.wind_direction_deg)?;
        let angle = (90.0 - direction).to_radians();
        Some((angle.cos() * speed, angle.sin() * speed))
    };
    let east = mean(&|o| wind_components(o).map(|(e, _)| e));
    let north = mean(&|o| wind_components(o).map(|(_, n)| n));
    let (wind_speed_mph, wind_direction_deg) = match (east, north) {
        (Some(e), Some(n)) => {
            let direction = (90.0 - n.atan2(e).to_degrees()).rem_euclid(360.0);
            (Some(e.hypot(n)), Some(direction))
        }
        _ => (None, None),
    };

    let humidity = match (temperature_c, dew_point_c) {
        (Some(t), Some(d)) => finite(Some(relative_humidity(t, d))),
        _ => None,
    };

    Ok(AveragedWeather {
        station_id: first.station_id,
        temperature_c,
        dew_point_c,
        pressure_hpa,
        wind_speed_mph,
        wind_direction_deg,
        gust_mph,
        relative_humidity: humidity,
        rain,
        snow,
    })
}
