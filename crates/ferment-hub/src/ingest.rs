//! Push ingestion gateway.
//!
//! One inbound payload runs these steps strictly in order; any failure stops
//! the request with a specific outcome:
//!
//! ```text
//! resolve ─▶ usability ─▶ normalize ─▶ dedup ─▶ persist ─▶ evaluate alerts
//!   │404        │403 / "received"  │422      │"duplicate"  │500
//! ```
//!
//! The dedup → persist → evaluate tail (`store_reading`) is shared with the
//! cloud poller.

use anyhow::Result;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::alerts::{self, AlertEvent};
use crate::db::{unix_millis, Db, Device, InsertOutcome, NewReading};
use crate::dedup;
use crate::error::IngestError;
use crate::normalize::{self, Calibration, NormalizedReading, SourceType};
use crate::registry::{self, Usability};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Recorded {
        reading_id: i64,
        batch_id: i64,
        alerts: Vec<AlertEvent>,
    },
    /// Device has no batch; acknowledged so the hardware does not retry.
    Unattributed { device: String },
    /// Same (device, batch, timestamp) already stored.
    Duplicate { batch_id: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Recorded {
        reading_id: i64,
        alerts: Vec<AlertEvent>,
    },
    Duplicate,
}

pub async fn ingest_push(
    db: &Db,
    source: SourceType,
    credential: Option<&str>,
    payload: &Value,
) -> Result<IngestOutcome, IngestError> {
    ingest_push_at(db, source, credential, payload, OffsetDateTime::now_utc()).await
}

pub async fn ingest_push_at(
    db: &Db,
    source: SourceType,
    credential: Option<&str>,
    payload: &Value,
    now: OffsetDateTime,
) -> Result<IngestOutcome, IngestError> {
    // 1. resolve
    let device = registry::resolve(db, source, credential, name_hint(source, payload))
        .await
        .map_err(IngestError::Persistence)?
        .ok_or(IngestError::DeviceNotFound)?;

    // 2. usability
    let batch_id = match registry::assert_usable(&device)? {
        Usability::Attributed { batch_id } => batch_id,
        Usability::Unattributed => {
            warn!(device = %device.name, "data received but no batch is assigned");
            return Ok(IngestOutcome::Unattributed {
                device: device.name,
            });
        }
    };

    // 3. normalize
    let calibration = Calibration::from_json(device.calibration_data.as_ref());
    let reading = normalize::normalize(source, payload, calibration.as_ref(), now)?;

    // 4–6. dedup, persist, evaluate
    let outcome = store_reading(db, &device, batch_id, source, &reading)
        .await
        .map_err(IngestError::Persistence)?;

    Ok(match outcome {
        StoreOutcome::Recorded { reading_id, alerts } => IngestOutcome::Recorded {
            reading_id,
            batch_id,
            alerts,
        },
        StoreOutcome::Duplicate => IngestOutcome::Duplicate { batch_id },
    })
}

/// Dedup check, then insert (with `last_reading_at`) in one transaction, then
/// alert evaluation. A unique-index conflict is a duplicate, not an error.
pub async fn store_reading(
    db: &Db,
    device: &Device,
    batch_id: i64,
    source: SourceType,
    reading: &NormalizedReading,
) -> Result<StoreOutcome> {
    if dedup::is_duplicate(db, device.id, batch_id, reading.timestamp).await? {
        debug!(device = %device.name, batch_id, ts = %reading.timestamp, "duplicate reading skipped");
        return Ok(StoreOutcome::Duplicate);
    }

    let inserted = db
        .insert_reading(&NewReading {
            batch_id,
            device_id: device.id,
            ts: unix_millis(reading.timestamp),
            gravity: reading.gravity,
            temperature: reading.temperature_c,
            notes: reading.notes.clone(),
            source: source.reading_source(),
        })
        .await?;

    let reading_id = match inserted {
        InsertOutcome::Inserted(id) => id,
        InsertOutcome::Duplicate => {
            debug!(device = %device.name, batch_id, "concurrent duplicate reading skipped");
            return Ok(StoreOutcome::Duplicate);
        }
    };

    info!(
        device = %device.name,
        batch_id,
        reading_id,
        gravity = ?reading.gravity,
        temperature_c = ?reading.temperature_c,
        "reading recorded"
    );

    let alerts = alerts::evaluate(device.alert_config.as_ref(), reading.temperature_c);
    for a in &alerts {
        warn!(device = %device.name, kind = ?a.kind, "{}", a.message);
    }

    Ok(StoreOutcome::Recorded { reading_id, alerts })
}

fn name_hint(source: SourceType, payload: &Value) -> Option<&str> {
    let field = match source {
        SourceType::Ispindel => "name",
        SourceType::Tilt | SourceType::TiltCloud => "Color",
    };
    payload.get(field).and_then(Value::as_str)
}

// ===========================================================================
// Tests
// ===========================================================================
