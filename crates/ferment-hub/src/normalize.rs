//! Source adapters: turn an iSpindel / Tilt / Tilt Cloud payload into one
//! canonical reading (Celsius, specific gravity, provenance note).
//!
//! Every adapter is a pure function of the payload plus the ingestion clock,
//! so the push gateway and the cloud poller share them unchanged.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Ispindel,
    Tilt,
    TiltCloud,
}

impl SourceType {
    /// Device type tag a device of this source is registered under.
    pub fn device_type(self) -> &'static str {
        match self {
            SourceType::Ispindel => "ispindel",
            SourceType::Tilt | SourceType::TiltCloud => "tilt",
        }
    }

    /// Value written to `fermentation_readings.source`.
    pub fn reading_source(self) -> &'static str {
        self.device_type()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub timestamp: OffsetDateTime,
    pub temperature_c: Option<f64>,
    pub gravity: Option<f64>,
    pub notes: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("field '{field}' is not a number: {value}")]
    NotANumber { field: &'static str, value: String },
    #[error("unsupported temperature unit '{0}'")]
    UnknownUnit(String),
}

/// iSpindel angle→gravity calibration, read from `calibration_data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub polynomial: Vec<f64>,
}

impl Calibration {
    /// `None` unless `calibration_data.polynomial` is a non-empty numeric array.
    pub fn from_json(data: Option<&Value>) -> Option<Self> {
        let poly = data?.get("polynomial")?.as_array()?;
        let coefs: Option<Vec<f64>> = poly.iter().map(Value::as_f64).collect();
        coefs.filter(|c| !c.is_empty()).map(|polynomial| Self { polynomial })
    }

    pub fn gravity_at(&self, angle: f64) -> f64 {
        let g: f64 = self
            .polynomial
            .iter()
            .enumerate()
            .map(|(i, c)| c * angle.powi(i as i32))
            .sum();
        (g * 10_000.0).round() / 10_000.0
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn normalize(
    source: SourceType,
    payload: &Value,
    calibration: Option<&Calibration>,
    now: OffsetDateTime,
) -> Result<NormalizedReading, NormalizeError> {
    let obj = payload.as_object().ok_or(NormalizeError::NotAnObject)?;
    match source {
        SourceType::Ispindel => ispindel(obj, calibration, now),
        SourceType::Tilt => tilt(obj, now, "auto-import"),
        SourceType::TiltCloud => tilt(obj, now, "auto-poll"),
    }
}

pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

fn ispindel(
    obj: &Map<String, Value>,
    calibration: Option<&Calibration>,
    now: OffsetDateTime,
) -> Result<NormalizedReading, NormalizeError> {
    let raw_temp = number(obj, "temperature")?;
    let temperature_c = match (raw_temp, string(obj, "temp_units")) {
        (Some(t), Some(unit)) => Some(to_celsius(t, &unit)?),
        (t, _) => t,
    };

    let angle = number(obj, "angle")?;
    let battery = number(obj, "battery")?;
    let mut gravity = number(obj, "gravity")?;
    if let (Some(cal), Some(a)) = (calibration, angle) {
        gravity = Some(cal.gravity_at(a));
    }

    let notes = format!(
        "iSpindel auto-import. Battery: {}V, Angle: {}°",
        or_na(battery),
        or_na(angle)
    );

    Ok(NormalizedReading {
        timestamp: now,
        temperature_c,
        gravity,
        notes,
    })
}

fn tilt(
    obj: &Map<String, Value>,
    now: OffsetDateTime,
    mode: &str,
) -> Result<NormalizedReading, NormalizeError> {
    let temperature_c = number(obj, "Temp")?.map(fahrenheit_to_celsius);
    let gravity = number(obj, "SG")?;
    let timestamp = string(obj, "Timepoint")
        .and_then(|s| parse_timepoint(&s))
        .unwrap_or(now);

    let color = string(obj, "Color").unwrap_or_else(|| "Unknown".to_string());
    let mut notes = format!("Tilt {color} {mode}.");
    if let Some(comment) = string(obj, "Comment").filter(|c| !c.trim().is_empty()) {
        notes.push(' ');
        notes.push_str(comment.trim());
    }

    Ok(NormalizedReading {
        timestamp,
        temperature_c,
        gravity,
        notes,
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Missing and `null` fields are `None`; numeric strings are accepted.
fn number(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, NormalizeError> {
    let bad = |v: &Value| NormalizeError::NotANumber {
        field,
        value: v.to_string(),
    };
    let Some(v) = obj.get(field) else {
        return Ok(None);
    };
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| bad(v)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| bad(v)),
        _ => Err(bad(v)),
    }
}

fn string(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn or_na(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
}

fn to_celsius(t: f64, unit: &str) -> Result<f64, NormalizeError> {
    match unit.trim().to_ascii_uppercase().as_str() {
        "" | "C" => Ok(t),
        "F" => Ok(fahrenheit_to_celsius(t)),
        "K" => Ok(t - 273.15),
        other => Err(NormalizeError::UnknownUnit(other.to_string())),
    }
}

/// ISO-8601 with `Z` or an explicit offset; offset-less values are taken as
/// UTC. Anything else yields `None` so the caller falls back to "now".
pub fn parse_timepoint(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if let Ok(t) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(t);
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let naive_frac =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    PrimitiveDateTime::parse(s, &naive)
        .or_else(|_| PrimitiveDateTime::parse(s, &naive_frac))
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

// ===========================================================================
// Tests
// ===========================================================================
