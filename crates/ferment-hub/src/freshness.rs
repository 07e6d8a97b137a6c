//! Freshness monitor: flags devices that should be reporting but have gone
//! quiet. Read-only with respect to readings.

use std::time::Duration;

use anyhow::Result;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::alerts::{self, AlertEvent, Severity};
use crate::db::Db;
use crate::state::SharedState;

pub const JOB_ID: &str = "device_freshness_check";
pub const JOB_NAME: &str = "Check device data freshness";

/// A device that never reported is always stale.
pub fn is_stale(last_reading_at: Option<i64>, interval_sec: i64, now: i64) -> bool {
    match last_reading_at {
        Some(last) => now - last >= interval_sec,
        None => true,
    }
}

/// One pass over the monitored devices. Returns the stale-device events.
pub async fn check_tick(db: &Db, now: i64) -> Result<Vec<(String, AlertEvent)>> {
    let mut events = Vec::new();

    for device in db.freshness_targets().await? {
        if !is_stale(device.last_reading_at, device.import_interval_seconds, now) {
            continue;
        }

        let escalate = device
            .alert_config
            .as_ref()
            .is_some_and(|c| c.missing_data_alert);
        let elapsed = device.last_reading_at.map(|last| now - last);
        let event = alerts::stale_device(&device.name, elapsed, device.import_interval_seconds, escalate);

        match event.severity {
            Severity::Critical => error!(device = %device.name, ?elapsed, "{}", event.message),
            Severity::Warning => warn!(device = %device.name, ?elapsed, "{}", event.message),
        }
        events.push((device.name, event));
    }

    Ok(events)
}

/// Freshness loop. The first check runs one `period` after start.
pub async fn run(db: Db, period: Duration, shared: SharedState, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_sec = period.as_secs(), "freshness monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop.borrow() {
            break;
        }

        shared.write().await.job_started(JOB_ID);
        let now = OffsetDateTime::now_utc();
        let next_run = now + period;

        match check_tick(&db, now.unix_timestamp()).await {
            Ok(events) => {
                let mut st = shared.write().await;
                for (device, event) in &events {
                    st.record_alert(format!("{device}: {}", event.message));
                }
                st.job_finished(JOB_ID, format!("{} stale", events.len()), next_run);
            }
            Err(e) => {
                error!("freshness check failed: {e:#}");
                let mut st = shared.write().await;
                st.record_error(format!("freshness check failed: {e:#}"));
                st.job_finished(JOB_ID, "failed".into(), next_run);
            }
        }
    }

    shared.write().await.job_stopped(JOB_ID);
    info!("freshness monitor stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::db::testing::*;
    use crate::db::{AlertConfig, DeviceSeed, NewReading};
    use crate::state::SystemState;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn staleness_threshold() {
        assert!(is_stale(Some(NOW - 1000), 900, NOW));
        assert!(!is_stale(Some(NOW - 500), 900, NOW));
        assert!(is_stale(Some(NOW - 900), 900, NOW));
        assert!(is_stale(None, 900, NOW));
    }

    /// Inserts a reading and rewinds `last_reading_at` to `ago` seconds before NOW.
    async fn reported(db: &Db, device_id: i64, batch_id: i64, ago: i64) {
        db.insert_reading(&NewReading {
            batch_id,
            device_id,
            ts: (NOW - ago) * 1000,
            gravity: Some(1.050),
            temperature: Some(20.0),
            notes: String::new(),
            source: "tilt",
        })
        .await
        .unwrap();
        sqlx::query("UPDATE devices SET last_reading_at = ? WHERE id = ?")
            .bind(NOW - ago)
            .bind(device_id)
            .execute(db_pool(db))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn quiet_device_is_flagged_fresh_one_is_not() {
        let db = memory_db().await;
        let quiet = insert_device(&db, DeviceSeed { batch_id: Some(1), ..seed("quiet", "tilt") }).await;
        let fresh = insert_device(&db, DeviceSeed { batch_id: Some(1), ..seed("fresh", "tilt") }).await;
        reported(&db, quiet.id, 1, 1000).await;
        reported(&db, fresh.id, 1, 500).await;

        let events = check_tick(&db, NOW).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "quiet");
        assert_eq!(events[0].1.kind, AlertKind::StaleDevice);
        assert_eq!(events[0].1.severity, Severity::Warning);
        assert!(events[0].1.message.contains("1000 seconds"));
    }

    #[tokio::test]
    async fn never_reported_device_is_stale() {
        let db = memory_db().await;
        insert_device(&db, DeviceSeed { batch_id: Some(1), ..seed("new", "ispindel") }).await;

        let events = check_tick(&db, NOW).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].1.message.contains("since it was registered"));
    }

    #[tokio::test]
    async fn missing_data_alert_escalates() {
        let db = memory_db().await;
        insert_device(
            &db,
            DeviceSeed {
                batch_id: Some(1),
                alert_config: Some(AlertConfig {
                    missing_data_alert: true,
                    ..AlertConfig::default()
                }),
                ..seed("watched", "tilt")
            },
        )
        .await;

        let events = check_tick(&db, NOW).await.unwrap();
        assert_eq!(events[0].1.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn unmonitored_devices_are_ignored() {
        let db = memory_db().await;
        insert_device(&db, seed("no-batch", "tilt")).await;
        insert_device(
            &db,
            DeviceSeed {
                batch_id: Some(1),
                manual_override: true,
                ..seed("manual", "tilt")
            },
        )
        .await;
        insert_device(
            &db,
            DeviceSeed {
                batch_id: Some(1),
                auto_import_enabled: false,
                ..seed("no-auto", "tilt")
            },
        )
        .await;
        insert_device(
            &db,
            DeviceSeed {
                batch_id: Some(1),
                is_active: false,
                ..seed("inactive", "tilt")
            },
        )
        .await;

        assert!(check_tick(&db, NOW).await.unwrap().is_empty());
        assert_eq!(db.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_loop_records_events_and_stops() {
        let db = memory_db().await;
        insert_device(&db, DeviceSeed { batch_id: Some(1), ..seed("quiet", "tilt") }).await;

        let shared = SystemState::shared();
        shared
            .write()
            .await
            .register_job(JOB_ID, JOB_NAME, 0, OffsetDateTime::now_utc());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(db, Duration::from_millis(50), shared.clone(), rx));

        for _ in 0..50 {
            if !shared.read().await.events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();

        let st = shared.read().await;
        assert!(st.events.iter().any(|e| e.detail.starts_with("quiet:")));
        assert!(st.jobs[JOB_ID].next_run.is_none());
    }
}
