use thiserror::Error;

use crate::normalize::NormalizeError;

/// Caller-visible failures of the push ingestion path. Unattributed and
/// duplicate deliveries are successful outcomes, not errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("device not found; configure the device before sending data")]
    DeviceNotFound,
    #[error("device '{0}' is not active")]
    DeviceInactive(String),
    #[error("malformed payload: {0}")]
    Normalization(#[from] NormalizeError),
    #[error("store unavailable: {0:#}")]
    Persistence(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AssociationError {
    #[error("device {0} not found")]
    DeviceNotFound(i64),
    #[error("batch {0} not found")]
    BatchNotFound(i64),
    #[error("store unavailable: {0:#}")]
    Persistence(anyhow::Error),
}
