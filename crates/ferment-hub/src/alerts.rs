//! Threshold and staleness alert events. Nothing here persists or dispatches;
//! callers decide whether to return, log, or forward the events.

use serde::Serialize;

use crate::db::AlertConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TemperatureLow,
    TemperatureHigh,
    StaleDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub severity: Severity,
}

/// Compare a temperature against the device thresholds. Each bound is checked
/// on its own, so a config with `min > max` can raise both events.
pub fn evaluate(config: Option<&AlertConfig>, temperature: Option<f64>) -> Vec<AlertEvent> {
    let mut alerts = Vec::new();

    let (Some(cfg), Some(t)) = (config, temperature) else {
        return alerts;
    };
    if !cfg.enable_alerts {
        return alerts;
    }

    if let Some(min) = cfg.temperature_min {
        if t < min {
            alerts.push(AlertEvent {
                kind: AlertKind::TemperatureLow,
                message: format!("Temperature {t:.1}°C is below minimum {min}°C"),
                severity: Severity::Warning,
            });
        }
    }

    if let Some(max) = cfg.temperature_max {
        if t > max {
            alerts.push(AlertEvent {
                kind: AlertKind::TemperatureHigh,
                message: format!("Temperature {t:.1}°C is above maximum {max}°C"),
                severity: Severity::Warning,
            });
        }
    }

    alerts
}

/// Stale-device event. `elapsed_sec` is `None` when the device never reported.
pub fn stale_device(
    device_name: &str,
    elapsed_sec: Option<i64>,
    interval_sec: i64,
    escalate: bool,
) -> AlertEvent {
    let since = match elapsed_sec {
        Some(s) => format!("for {s} seconds"),
        None => "since it was registered".to_string(),
    };
    AlertEvent {
        kind: AlertKind::StaleDevice,
        message: format!(
            "Device {device_name} has not reported {since} (expected every {interval_sec} seconds)"
        ),
        severity: if escalate {
            Severity::Critical
        } else {
            Severity::Warning
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================
