//! Device resolution and device↔batch association.

use anyhow::Result;

use crate::db::{Db, Device};
use crate::error::{AssociationError, IngestError};
use crate::normalize::SourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Attributed { batch_id: i64 },
    /// Accepted but not stored: no batch to attribute the reading to.
    Unattributed,
}

/// Find the configured device for an inbound payload: API token first (scoped
/// to the source's device type), then the name hint. iSpindel names match
/// exactly; Tilt colours match as a case-insensitive substring.
pub async fn resolve(
    db: &Db,
    source: SourceType,
    credential: Option<&str>,
    name_hint: Option<&str>,
) -> Result<Option<Device>> {
    let device_type = source.device_type();

    if let Some(token) = credential.filter(|t| !t.is_empty()) {
        if let Some(d) = db.find_device_by_token(device_type, token).await? {
            return Ok(Some(d));
        }
    }

    let Some(hint) = name_hint.map(str::trim).filter(|h| !h.is_empty()) else {
        return Ok(None);
    };

    match source {
        SourceType::Ispindel => db.find_device_by_name(device_type, hint).await,
        SourceType::Tilt | SourceType::TiltCloud => {
            db.find_device_by_name_fragment(device_type, hint).await
        }
    }
}

pub fn assert_usable(device: &Device) -> Result<Usability, IngestError> {
    if !device.is_active {
        return Err(IngestError::DeviceInactive(device.name.clone()));
    }
    Ok(match device.batch_id {
        Some(batch_id) => Usability::Attributed { batch_id },
        None => Usability::Unattributed,
    })
}

pub async fn associate(db: &Db, device_id: i64, batch_id: i64) -> Result<Device, AssociationError> {
    let device = db
        .get_device(device_id)
        .await
        .map_err(AssociationError::Persistence)?
        .ok_or(AssociationError::DeviceNotFound(device_id))?;
    if !db
        .batch_exists(batch_id)
        .await
        .map_err(AssociationError::Persistence)?
    {
        return Err(AssociationError::BatchNotFound(batch_id));
    }

    if device.batch_id != Some(batch_id) {
        db.set_device_batch(device_id, Some(batch_id))
            .await
            .map_err(AssociationError::Persistence)?;
        tracing::info!(device = %device.name, batch_id, "device associated with batch");
    }
    Ok(Device {
        batch_id: Some(batch_id),
        ..device
    })
}

/// Clear the batch association; readings stop being attributed until the
/// device is associated again.
pub async fn dissociate(db: &Db, device_id: i64) -> Result<Device, AssociationError> {
    let device = db
        .get_device(device_id)
        .await
        .map_err(AssociationError::Persistence)?
        .ok_or(AssociationError::DeviceNotFound(device_id))?;

    if device.batch_id.is_some() {
        db.set_device_batch(device_id, None)
            .await
            .map_err(AssociationError::Persistence)?;
        tracing::info!(device = %device.name, "device dissociated from batch");
    }
    Ok(Device {
        batch_id: None,
        ..device
    })
}

// ===========================================================================
// Tests
// ===========================================================================
