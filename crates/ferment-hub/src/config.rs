//! TOML config file loading, validation, and database seeding for batches
//! and devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::db::{AlertConfig, Db, DeviceSeed};
use crate::normalize::Calibration;

/// Longest accepted scheduler period (one week).
pub const MAX_INTERVAL_SEC: u64 = 7 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub batches: Vec<BatchEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_sec: u64,
    pub freshness_interval_sec: u64,
    pub fetch_timeout_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_sec: 900,
            freshness_interval_sec: 300,
            fetch_timeout_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchEntry {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub batch_id: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub manual_override: bool,
    #[serde(default = "default_true")]
    pub auto_import_enabled: bool,
    #[serde(default = "default_import_interval")]
    pub import_interval_seconds: i64,
    #[serde(default)]
    pub calibration_data: Option<Value>,
    #[serde(default)]
    pub configuration: Option<Value>,
    #[serde(default)]
    pub alert_config: Option<AlertConfig>,
}

fn default_true() -> bool {
    true
}

fn default_import_interval() -> i64 {
    900
}

const DEVICE_TYPES: &[&str] = &["ispindel", "tilt"];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_scheduler(&mut errors);
        self.validate_batches(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_scheduler(&self, errors: &mut Vec<String>) {
        let s = &self.scheduler;
        for (field, value) in [
            ("poll_interval_sec", s.poll_interval_sec),
            ("freshness_interval_sec", s.freshness_interval_sec),
            ("fetch_timeout_sec", s.fetch_timeout_sec),
        ] {
            if value == 0 {
                errors.push(format!("scheduler: {field} must be positive"));
            } else if value > MAX_INTERVAL_SEC {
                errors.push(format!(
                    "scheduler: {field} ({value}) exceeds the maximum of {MAX_INTERVAL_SEC}"
                ));
            }
        }
        if s.fetch_timeout_sec > 0 && s.fetch_timeout_sec > s.poll_interval_sec {
            errors.push(format!(
                "scheduler: fetch_timeout_sec ({}) exceeds poll_interval_sec ({})",
                s.fetch_timeout_sec, s.poll_interval_sec
            ));
        }
    }

    fn validate_batches(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for b in &self.batches {
            if b.id <= 0 {
                errors.push(format!("batch {}: id must be positive", b.id));
            } else if !seen_ids.insert(b.id) {
                errors.push(format!("batch {}: duplicate id", b.id));
            }
            if b.name.trim().is_empty() {
                errors.push(format!("batch {}: name is empty", b.id));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let batch_ids: HashSet<i64> = self.batches.iter().map(|b| b.id).collect();
        let mut seen_keys: HashSet<(&str, &str)> = HashSet::new();
        let mut seen_tokens: HashSet<(&str, &str)> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.name.trim().is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if !DEVICE_TYPES.contains(&d.device_type.as_str()) {
                errors.push(format!(
                    "{}: device_type '{}' is not one of {}",
                    ctx(),
                    d.device_type,
                    DEVICE_TYPES.join(", ")
                ));
            }
            if !seen_keys.insert((d.name.as_str(), d.device_type.as_str())) {
                errors.push(format!("{}: duplicate {} device name", ctx(), d.device_type));
            }

            if let Some(token) = &d.api_token {
                if token.trim().is_empty() {
                    errors.push(format!("{}: api_token is empty", ctx()));
                } else if !seen_tokens.insert((d.device_type.as_str(), token.as_str())) {
                    errors.push(format!(
                        "{}: api_token is already used by another {} device",
                        ctx(),
                        d.device_type
                    ));
                }
            }

            // ── Attribution & timing ────────────────────────────
            if let Some(batch_id) = d.batch_id {
                if !batch_ids.contains(&batch_id) {
                    errors.push(format!(
                        "{}: batch_id {batch_id} does not match any defined batch",
                        ctx()
                    ));
                }
            }
            if d.import_interval_seconds <= 0 {
                errors.push(format!(
                    "{}: import_interval_seconds must be positive, got {}",
                    ctx(),
                    d.import_interval_seconds
                ));
            }

            // ── Source-specific blobs ───────────────────────────
            if let Some(cal) = &d.calibration_data {
                if cal.get("polynomial").is_some() && Calibration::from_json(Some(cal)).is_none() {
                    errors.push(format!(
                        "{}: calibration_data.polynomial must be a non-empty list of numbers",
                        ctx()
                    ));
                }
            }
            if let Some(cfg) = &d.configuration {
                let has_url = cfg.get("cloud_url").is_some();
                let has_id = cfg.get("hydrometer_id").is_some();
                if has_url != has_id {
                    errors.push(format!(
                        "{}: cloud_url and hydrometer_id must be set together",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all batches and devices from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for b in &config.batches {
        db.upsert_batch(b.id, &b.name)
            .await
            .with_context(|| format!("failed to upsert batch {}", b.id))?;
    }

    for d in &config.devices {
        db.upsert_device(&DeviceSeed {
            name: d.name.clone(),
            device_type: d.device_type.clone(),
            api_token: d.api_token.clone(),
            calibration_data: d.calibration_data.clone(),
            configuration: d.configuration.clone(),
            is_active: d.is_active,
            batch_id: d.batch_id,
            manual_override: d.manual_override,
            auto_import_enabled: d.auto_import_enabled,
            import_interval_seconds: d.import_interval_seconds,
            alert_config: d.alert_config.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.name))?;
    }

    tracing::info!(
        batches = config.batches.len(),
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
