//! Replay guard for at-least-once delivery (webhook retries, repeated cloud
//! polls). The existence check runs before persistence; the unique index on
//! (device_id, batch_id, ts) settles races the check cannot see. The key
//! keeps millisecond precision.

use anyhow::Result;
use time::OffsetDateTime;

use crate::db::{unix_millis, Db};

pub async fn is_duplicate(
    db: &Db,
    device_id: i64,
    batch_id: i64,
    timestamp: OffsetDateTime,
) -> Result<bool> {
    db.reading_exists(device_id, batch_id, unix_millis(timestamp))
        .await
}
