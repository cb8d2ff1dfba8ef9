//! METAR report parsing.
//!
//! The upstream serves plain-text listings: every report is preceded by a
//! fixed-width date prefix (`YYYYMMDDHHMMSS`, or `YYYYMMDDHHMM`) and ends at
//! a line terminated by `=`. Lines starting with `#` are comments.
//!
//! Decoding runs in two passes. The strict pass requires the groups in their
//! regulated order; when it trips over anything, the lenient pass picks the
//! recognisable groups out in any order and flags the record.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::db::models::{Intensity, NewObservation, WeatherPhenomenon};

/// Knots to miles per hour.
const KT_TO_MPH: f64 = 1.150_779;
/// Metres per second to miles per hour.
const MPS_TO_MPH: f64 = 2.236_936;
/// Kilometres per hour to miles per hour.
const KMH_TO_MPH: f64 = 0.621_371;
/// Inches of mercury to hectopascal.
const INHG_TO_HPA: f64 = 33.8639;

static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{14}|\d{12})\s+(.*)$").expect("valid prefix regex"));
static STATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]{3}$").expect("valid station regex"));
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})(\d{2})(\d{2})Z$").expect("valid time regex"));
static MODIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:AUTO|COR|NIL|RTD|CC[A-Z])$").expect("valid modifier regex"));
static WIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{3}|VRB|///)(\d{2,3}|//)(?:G(\d{2,3}))?(KT|MPS|KMH)$")
        .expect("valid wind regex")
});
static VARIABLE_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{3}V\d{3}$").expect("valid variable direction regex"));
static VISIBILITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:CAVOK|\d{4}(?:NDV|[NSEW]{1,2})?|[MP]?\d{1,2}SM|M?\d{1,2}/\d{1,2}SM|\d|////)$")
        .expect("valid visibility regex")
});
static RVR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^R\d{2}[LCR]?/\S+$").expect("valid RVR regex"));
static WEATHER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(-|\+|VC)?(MI|PR|BC|DR|BL|SH|TS|FZ)?((?:DZ|RA|SN|SG|IC|PL|GR|GS|UP|BR|FG|FU|VA|DU|SA|HZ|PY|PO|SQ|FC|SS|DS)*)$",
    )
    .expect("valid weather regex")
});
static SKY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:FEW|SCT|BKN|OVC)(?:\d{3}|///)(?:CB|TCU|///)?|VV(?:\d{3}|///)|SKC|CLR|NSC|NCD)$",
    )
    .expect("valid sky regex")
});
static TEMP_DEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(M?\d{2}|//)/(M?\d{2}|//)?$").expect("valid temperature regex"));
static ALTIMETER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([AQ])(\d{4})$").expect("valid altimeter regex"));
static RECENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^RE[A-Z]{2,}$").expect("valid recent weather regex"));
static SLP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SLP(\d{3})$").expect("valid SLP regex"));
static PRECISE_TEMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^T([01])(\d{3})(?:([01])(\d{3}))?$").expect("valid T-group regex")
});

/// A report body cut out of an upstream listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReport {
    /// Timestamp from the date prefix (UTC).
    pub timestamp: NaiveDateTime,
    /// Report text without the terminating `=`.
    pub body: String,
}

/// A decoded report, not yet tied to a stored station.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMetar {
    pub station_code: String,
    pub report_time: DateTime<Utc>,
    pub raw_text: String,
    pub wind_speed_mph: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    pub gust_mph: Option<f64>,
    pub temperature_c: Option<f64>,
    pub dew_point_c: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub weather: Vec<WeatherPhenomenon>,
    /// Set when only the lenient pass could decode the report.
    pub parse_error: bool,
}

impl ParsedMetar {
    pub fn into_observation(self, station_id: Uuid) -> NewObservation {
        NewObservation {
            station_id,
            report_time: self.report_time,
            raw_text: self.raw_text,
            wind_speed_mph: self.wind_speed_mph,
            wind_direction_deg: self.wind_direction_deg,
            gust_mph: self.gust_mph,
            temperature_c: self.temperature_c,
            dew_point_c: self.dew_point_c,
            pressure_hpa: self.pressure_hpa,
            weather: self.weather,
            parse_error: self.parse_error,
        }
    }
}

/// A report that could not be tokenised at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseFailure {
    #[error("Empty report")]
    Empty,
    #[error("Missing station identifier in '{0}'")]
    MissingStation(String),
    #[error("Missing or invalid report time in '{0}'")]
    InvalidTime(String),
}

// ---------------------------------------------------------------------------
// Listing splitter
// ---------------------------------------------------------------------------

/// Cut an upstream listing into individual reports.
///
/// Reports may wrap over several lines. A report still open when the next
/// prefix (or the end of input) arrives is dropped.
pub fn split_reports(text: &str) -> Vec<RawReport> {
    let mut reports = Vec::new();
    let mut pending: Option<(NaiveDateTime, String)> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((timestamp, body)) = parse_prefix(line) {
            if let Some((dropped_at, partial)) = pending.take() {
                tracing::warn!("Dropping unterminated report at {}: {}", dropped_at, partial);
            }
            pending = Some((timestamp, body.to_string()));
        } else if let Some((_, partial)) = pending.as_mut() {
            partial.push(' ');
            partial.push_str(line);
        } else {
            tracing::debug!("Skipping line outside any report: {}", line);
            continue;
        }

        if pending.as_ref().is_some_and(|(_, body)| body.ends_with('=')) {
            if let Some((timestamp, body)) = pending.take() {
                let body = body.trim_end_matches('=').trim().to_string();
                if !body.is_empty() {
                    reports.push(RawReport { timestamp, body });
                }
            }
        }
    }

    if let Some((dropped_at, partial)) = pending {
        tracing::warn!("Dropping unterminated report at {}: {}", dropped_at, partial);
    }

    reports
}

fn parse_prefix(line: &str) -> Option<(NaiveDateTime, &str)> {
    let caps = PREFIX_RE.captures(line)?;
    let digits = caps.get(1)?.as_str();
    let field = |range: std::ops::Range<usize>| digits.get(range)?.parse::<u32>().ok();
    let year = digits.get(0..4)?.parse::<i32>().ok()?;
    let second = if digits.len() == 14 { field(12..14)? } else { 0 };
    let timestamp = NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)?.and_hms_opt(
        field(8..10)?,
        field(10..12)?,
        second,
    )?;
    Some((timestamp, caps.get(2)?.as_str()))
}

// ---------------------------------------------------------------------------
// Report decoder
// ---------------------------------------------------------------------------

/// Decoded body groups, in the order they must appear.
#[derive(Debug, Clone, PartialEq)]
enum Group {
    Modifier,
    Wind {
        direction_deg: Option<f64>,
        speed_mph: Option<f64>,
        gust_mph: Option<f64>,
    },
    VariableDirection,
    Visibility,
    RunwayRange,
    Weather(Option<WeatherPhenomenon>),
    Sky,
    TemperatureDewPoint {
        temperature_c: Option<f64>,
        dew_point_c: Option<f64>,
    },
    Altimeter(f64),
    RecentWeather,
}

impl Group {
    fn rank(&self) -> u8 {
        match self {
            Group::Modifier => 0,
            Group::Wind { .. } => 1,
            Group::VariableDirection => 2,
            Group::Visibility => 3,
            Group::RunwayRange => 4,
            Group::Weather(_) => 5,
            Group::Sky => 6,
            Group::TemperatureDewPoint { .. } => 7,
            Group::Altimeter(_) => 8,
            Group::RecentWeather => 9,
        }
    }
}

#[derive(Debug, Default)]
struct Decoded {
    wind_speed_mph: Option<f64>,
    wind_direction_deg: Option<f64>,
    gust_mph: Option<f64>,
    temperature_c: Option<f64>,
    dew_point_c: Option<f64>,
    pressure_hpa: Option<f64>,
    weather: Vec<WeatherPhenomenon>,
}

impl Decoded {
    fn apply(&mut self, group: Group) {
        match group {
            Group::Wind {
                direction_deg,
                speed_mph,
                gust_mph,
            } => {
                self.wind_direction_deg = direction_deg;
                self.wind_speed_mph = speed_mph;
                self.gust_mph = gust_mph;
            }
            Group::Weather(Some(phenomenon)) => self.weather.push(phenomenon),
            Group::TemperatureDewPoint {
                temperature_c,
                dew_point_c,
            } => {
                self.temperature_c = temperature_c;
                self.dew_point_c = dew_point_c;
            }
            Group::Altimeter(hpa) => {
                if self.pressure_hpa.is_none() {
                    self.pressure_hpa = Some(hpa);
                }
            }
            _ => {}
        }
    }

    fn apply_remarks(&mut self, remarks: &[&str]) {
        for token in remarks {
            if let Some(caps) = SLP_RE.captures(token) {
                if self.pressure_hpa.is_none() {
                    if let Ok(tenths) = caps[1].parse::<f64>() {
                        let base = if tenths < 500.0 { 1000.0 } else { 900.0 };
                        self.pressure_hpa = Some(base + tenths / 10.0);
                    }
                }
            } else if let Some(caps) = PRECISE_TEMP_RE.captures(token) {
                self.temperature_c = signed_tenths(&caps[1], &caps[2]).or(self.temperature_c);
                if let (Some(sign), Some(value)) = (caps.get(3), caps.get(4)) {
                    self.dew_point_c =
                        signed_tenths(sign.as_str(), value.as_str()).or(self.dew_point_c);
                }
            }
        }
    }
}

/// Decode one report body.
///
/// `year` and `month` complete the day-of-month timestamp carried by the
/// report itself.
pub fn parse(raw: &str, year: i32, month: u32) -> Result<ParsedMetar, ParseFailure> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let mut idx = 0;
    if matches!(tokens[0], "METAR" | "SPECI") {
        idx += 1;
    }
    while tokens.get(idx).is_some_and(|t| MODIFIER_RE.is_match(t)) {
        idx += 1;
    }

    let station_code = tokens
        .get(idx)
        .filter(|t| STATION_RE.is_match(t))
        .ok_or_else(|| ParseFailure::MissingStation(raw.to_string()))?
        .to_string();
    idx += 1;

    let report_time = tokens
        .get(idx)
        .and_then(|t| parse_report_time(t, year, month))
        .ok_or_else(|| ParseFailure::InvalidTime(raw.to_string()))?;
    idx += 1;

    let rest = &tokens[idx..];
    let (main, remarks) = match rest.iter().position(|t| *t == "RMK") {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, &rest[rest.len()..]),
    };

    let (mut decoded, parse_error) = match decode_strict(main) {
        Ok(decoded) => (decoded, false),
        Err(token) => {
            tracing::debug!(
                "Strict decode of {} failed at '{}', using lenient pass",
                station_code,
                token
            );
            (decode_lenient(main), true)
        }
    };
    decoded.apply_remarks(remarks);

    Ok(ParsedMetar {
        station_code,
        report_time,
        raw_text: raw.trim().to_string(),
        wind_speed_mph: decoded.wind_speed_mph,
        wind_direction_deg: decoded.wind_direction_deg,
        gust_mph: decoded.gust_mph,
        temperature_c: decoded.temperature_c,
        dew_point_c: decoded.dew_point_c,
        pressure_hpa: decoded.pressure_hpa,
        weather: decoded.weather,
        parse_error,
    })
}

/// Groups must appear in non-decreasing rank. Returns the offending token.
fn decode_strict<'a>(tokens: &[&'a str]) -> Result<Decoded, &'a str> {
    let mut decoded = Decoded::default();
    let mut last_rank = 0;
    for &token in tokens {
        if is_trend(token) {
            break;
        }
        let group = classify(token).ok_or(token)?;
        if group.rank() < last_rank {
            return Err(token);
        }
        last_rank = group.rank();
        decoded.apply(group);
    }
    Ok(decoded)
}

fn decode_lenient(tokens: &[&str]) -> Decoded {
    let mut decoded = Decoded::default();
    for &token in tokens {
        if is_trend(token) {
            break;
        }
        if let Some(group) = classify(token) {
            decoded.apply(group);
        }
    }
    decoded
}

/// Trend and wind-shear sections end the decodable body.
fn is_trend(token: &str) -> bool {
    matches!(token, "NOSIG" | "BECMG" | "TEMPO" | "WS")
}

fn classify(token: &str) -> Option<Group> {
    if MODIFIER_RE.is_match(token) {
        return Some(Group::Modifier);
    }
    if let Some(caps) = WIND_RE.captures(token) {
        let factor = match &caps[4] {
            "KT" => KT_TO_MPH,
            "MPS" => MPS_TO_MPH,
            _ => KMH_TO_MPH,
        };
        let speed_mph = caps[2].parse::<f64>().ok().map(|v| v * factor);
        let direction_deg = caps[1].parse::<f64>().ok().filter(|d| *d <= 360.0);
        let gust_mph = caps
            .get(3)
            .and_then(|g| g.as_str().parse::<f64>().ok())
            .map(|v| v * factor);
        return Some(Group::Wind {
            direction_deg,
            speed_mph,
            gust_mph,
        });
    }
    if VARIABLE_DIR_RE.is_match(token) {
        return Some(Group::VariableDirection);
    }
    if VISIBILITY_RE.is_match(token) {
        return Some(Group::Visibility);
    }
    if RVR_RE.is_match(token) {
        return Some(Group::RunwayRange);
    }
    if token == "//" {
        return Some(Group::Weather(None));
    }
    if let Some(phenomenon) = parse_weather(token) {
        return Some(Group::Weather(Some(phenomenon)));
    }
    if SKY_RE.is_match(token) {
        return Some(Group::Sky);
    }
    if let Some(caps) = TEMP_DEW_RE.captures(token) {
        return Some(Group::TemperatureDewPoint {
            temperature_c: parse_temperature(&caps[1]),
            dew_point_c: caps.get(2).and_then(|m| parse_temperature(m.as_str())),
        });
    }
    if let Some(caps) = ALTIMETER_RE.captures(token) {
        let value: f64 = caps[2].parse().ok()?;
        let hpa = match &caps[1] {
            "A" => value / 100.0 * INHG_TO_HPA,
            _ => value,
        };
        return Some(Group::Altimeter(hpa));
    }
    if RECENT_RE.is_match(token) {
        return Some(Group::RecentWeather);
    }
    None
}

fn parse_weather(token: &str) -> Option<WeatherPhenomenon> {
    let caps = WEATHER_RE.captures(token)?;
    let descriptor = caps.get(2).map(|m| m.as_str().to_string());
    let codes: Vec<String> = caps
        .get(3)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .as_bytes()
        .chunks(2)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .map(str::to_string)
        .collect();
    if descriptor.is_none() && codes.is_empty() {
        return None;
    }
    let intensity = match caps.get(1).map(|m| m.as_str()) {
        Some("-") => Intensity::Light,
        Some("+") => Intensity::Heavy,
        Some("VC") => Intensity::Vicinity,
        _ => Intensity::Moderate,
    };
    Some(WeatherPhenomenon {
        intensity,
        descriptor,
        codes,
    })
}

/// `M05` is -5 °C; `//` is missing.
fn parse_temperature(token: &str) -> Option<f64> {
    match token.strip_prefix('M') {
        Some(value) => value.parse::<f64>().ok().map(|v| -v),
        None => token.parse::<f64>().ok(),
    }
}

/// T-group digits: sign flag `1` is negative, value in tenths of a degree.
fn signed_tenths(sign: &str, digits: &str) -> Option<f64> {
    let value = digits.parse::<f64>().ok()? / 10.0;
    Some(if sign == "1" { -value } else { value })
}

fn parse_report_time(token: &str, year: i32, month: u32) -> Option<DateTime<Utc>> {
    let caps = TIME_RE.captures(token)?;
    let day: u32 = caps[1].parse().ok()?;
    let hour: u32 = caps[2].parse().ok()?;
    let minute: u32 = caps[3].parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

// ---------------------------------------------------------------------------
// Precipitation indices
// ---------------------------------------------------------------------------

fn rain_weight(code: &str) -> Option<f64> {
    match code {
        "RA" | "DZ" | "UP" => Some(0.3),
        "BR" => Some(0.1),
        _ => None,
    }
}

fn snow_weight(code: &str) -> Option<f64> {
    match code {
        "SN" | "SG" | "IC" | "PL" | "GS" => Some(0.5),
        _ => None,
    }
}

fn intensity_adjustment(intensity: Intensity) -> f64 {
    match intensity {
        Intensity::Light => -0.1,
        Intensity::Heavy => 0.2,
        Intensity::Moderate | Intensity::Vicinity => 0.0,
    }
}

fn weighted_index(weather: &[WeatherPhenomenon], weight: fn(&str) -> Option<f64>) -> f64 {
    weather
        .iter()
        .filter(|w| w.intensity != Intensity::Vicinity)
        .flat_map(|w| {
            let adjustment = intensity_adjustment(w.intensity);
            w.codes
                .iter()
                .filter_map(move |code| weight(code).map(|base| (base + adjustment).max(0.0)))
        })
        .sum()
}

/// Rain-equivalent index of one report's present weather.
pub fn rain_index(weather: &[WeatherPhenomenon]) -> f64 {
    weighted_index(weather, rain_weight)
}

/// Snow-equivalent index of one report's present weather.
pub fn snow_index(weather: &[WeatherPhenomenon]) -> f64 {
    weighted_index(weather, snow_weight)
}
