//! Tilt Cloud poll loop.
//!
//! Every tick walks the active, batch-attributed devices and pulls the latest
//! hydrometer sample for each Tilt that has a cloud endpoint configured.
//! Devices are handled one at a time and in isolation: a timeout, HTTP error
//! or unreadable body for one device is logged and the tick moves on.
//!
//! The stop signal is honoured between ticks, while a fetch is in flight and
//! after every device.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertEvent;
use crate::db::{now_unix, Db, Device};
use crate::ingest::{self, StoreOutcome};
use crate::normalize::{self, SourceType};
use crate::state::SharedState;

pub const JOB_ID: &str = "device_poll";
pub const JOB_NAME: &str = "Poll cloud-connected devices";

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("cloud responded with {0}")]
    Status(StatusCode),
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("response is not valid JSON: {0}")]
    Decode(reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::Decode(e)
        } else {
            FetchError::Transport(e)
        }
    }
}

#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
}

impl CloudClient {
    /// `fetch_timeout` bounds each request end to end.
    pub fn new(fetch_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    pub async fn latest(&self, target: &CloudTarget, token: Option<&str>) -> Result<Value, FetchError> {
        let mut req = self
            .http
            .get(target.latest_url())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(resp.json::<Value>().await?)
    }
}

/// Cloud endpoint of one Tilt, read from the device `configuration`.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudTarget {
    pub cloud_url: String,
    pub hydrometer_id: String,
}

impl CloudTarget {
    /// `None` unless the device is a Tilt with both `cloud_url` and
    /// `hydrometer_id` configured.
    pub fn from_device(device: &Device) -> Option<Self> {
        if device.device_type != SourceType::TiltCloud.device_type() {
            return None;
        }
        let cfg = device.configuration.as_ref()?;
        let cloud_url = cfg
            .get("cloud_url")?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string();
        let hydrometer_id = match cfg.get("hydrometer_id")? {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            cloud_url,
            hydrometer_id,
        })
    }

    pub fn latest_url(&self) -> String {
        format!(
            "{}/api/hydrometer/{}/latest",
            self.cloud_url.trim_end_matches('/'),
            self.hydrometer_id
        )
    }
}

// ---------------------------------------------------------------------------
// One tick
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TickReport {
    pub recorded: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Attributed devices without a cloud endpoint.
    pub skipped: usize,
    pub alerts: Vec<(String, AlertEvent)>,
    pub cancelled: bool,
}

impl TickReport {
    pub fn summary(&self) -> String {
        format!(
            "{} recorded, {} duplicate, {} failed, {} skipped",
            self.recorded, self.duplicates, self.failed, self.skipped
        )
    }
}

enum DeviceOutcome {
    Stored(StoreOutcome),
    Failed,
}

pub async fn poll_tick(
    db: &Db,
    client: &CloudClient,
    stop: &mut watch::Receiver<bool>,
) -> Result<TickReport> {
    let mut report = TickReport::default();
    let devices = db.poll_targets().await?;

    for device in devices {
        if *stop.borrow() {
            report.cancelled = true;
            break;
        }

        let (Some(target), Some(batch_id)) = (CloudTarget::from_device(&device), device.batch_id) else {
            report.skipped += 1;
            continue;
        };

        let fetched = tokio::select! {
            r = client.latest(&target, device.api_token.as_deref()) => r,
            _ = stop_requested(stop) => {
                debug!(device = %device.name, "fetch abandoned on shutdown");
                report.cancelled = true;
                break;
            }
        };

        match poll_device(db, &device, batch_id, fetched).await {
            DeviceOutcome::Stored(StoreOutcome::Recorded { alerts, .. }) => {
                report.recorded += 1;
                report
                    .alerts
                    .extend(alerts.into_iter().map(|a| (device.name.clone(), a)));
            }
            DeviceOutcome::Stored(StoreOutcome::Duplicate) => report.duplicates += 1,
            DeviceOutcome::Failed => report.failed += 1,
        }
    }

    if *stop.borrow() {
        report.cancelled = true;
    }
    Ok(report)
}

/// Resolves once `stop` reads `true`. A `false` update is ignored and a
/// dropped sender never resolves, so an in-flight fetch is only abandoned on
/// an explicit shutdown.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn poll_device(
    db: &Db,
    device: &Device,
    batch_id: i64,
    fetched: Result<Value, FetchError>,
) -> DeviceOutcome {
    let payload = match fetched {
        Ok(v) => v,
        Err(e) => {
            warn!(device = %device.name, "cloud fetch failed: {e}");
            return DeviceOutcome::Failed;
        }
    };

    if let Err(e) = db.touch_last_import(device.id, now_unix()).await {
        warn!(device = %device.name, "failed to stamp last_import_at: {e:#}");
    }

    let reading = match normalize::normalize(
        SourceType::TiltCloud,
        &payload,
        None,
        OffsetDateTime::now_utc(),
    ) {
        Ok(r) => r,
        Err(e) => {
            warn!(device = %device.name, "unusable cloud payload: {e}");
            return DeviceOutcome::Failed;
        }
    };

    match ingest::store_reading(db, device, batch_id, SourceType::TiltCloud, &reading).await {
        Ok(outcome) => DeviceOutcome::Stored(outcome),
        Err(e) => {
            error!(device = %device.name, batch_id, "failed to store polled reading: {e:#}");
            DeviceOutcome::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Poll loop. The first tick fires immediately; the loop returns once `stop`
/// flips to `true` or its sender is dropped.
pub async fn run(
    db: Db,
    client: CloudClient,
    period: Duration,
    shared: SharedState,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_sec = period.as_secs(), "device poll loop started");

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

        let next_run = OffsetDateTime::now_utc() + period;
        let cancelled = match poll_tick(&db, &client, &mut stop).await {
            Ok(report) => {
                info!(
                    recorded = report.recorded,
                    duplicates = report.duplicates,
                    failed = report.failed,
                    skipped = report.skipped,
                    "poll tick finished"
                );
                let mut st = shared.write().await;
                for (device, alert) in &report.alerts {
                    st.record_alert(format!("{device}: {}", alert.message));
                }
                st.job_finished(JOB_ID, report.summary(), next_run);
                report.cancelled
            }
            Err(e) => {
                error!("poll tick failed: {e:#}");
                let mut st = shared.write().await;
                st.record_error(format!("poll tick failed: {e:#}"));
                st.job_finished(JOB_ID, "failed".into(), next_run);
                false
            }
        };

        if cancelled {
            break;
        }
    }

    shared.write().await.job_stopped(JOB_ID);
    info!("device poll loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::*;
    use crate::db::DeviceSeed;
    use crate::state::SystemState;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        auth: Arc<Mutex<Vec<Option<String>>>>,
        ids: Arc<Mutex<Vec<String>>>,
    }

    /// Local stand-in for the Tilt Cloud API. `delay` stalls every response.
    async fn cloud(status: StatusCode, body: Value, delay: Duration) -> (String, Seen) {
        let seen = Seen::default();
        let s = seen.clone();
        let app = Router::new().route(
            "/api/hydrometer/{id}/latest",
            get(move |Path(id): Path<String>, headers: HeaderMap| {
                let s = s.clone();
                let body = body.clone();
                async move {
                    s.ids.lock().unwrap().push(id);
                    s.auth.lock().unwrap().push(
                        headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string),
                    );
                    tokio::time::sleep(delay).await;
                    (status, Json(body))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn cloud_payload() -> Value {
        json!({"Color":"Red","Temp":68.0,"SG":1.040,"Timepoint":"2024-03-21T14:30:00Z"})
    }

    async fn cloud_tilt(db: &Db, name: &str, url: &str, token: Option<&str>) -> Device {
        insert_device(
            db,
            DeviceSeed {
                batch_id: Some(3),
                api_token: token.map(str::to_string),
                configuration: Some(json!({"cloud_url": url, "hydrometer_id": "hyd-1"})),
                ..seed(name, "tilt")
            },
        )
        .await
    }

    fn client(timeout_ms: u64) -> CloudClient {
        CloudClient::new(Duration::from_millis(timeout_ms)).unwrap()
    }

    #[test]
    fn cloud_target_requires_tilt_with_url_and_id() {
        let mut d = Device {
            id: 1,
            name: "red".into(),
            device_type: "tilt".into(),
            api_token: None,
            calibration_data: None,
            configuration: Some(json!({"cloud_url": "https://cloud.example/", "hydrometer_id": 42})),
            is_active: true,
            batch_id: Some(1),
            manual_override: false,
            auto_import_enabled: true,
            import_interval_seconds: 900,
            alert_config: None,
            last_reading_at: None,
            last_import_at: None,
        };
        let t = CloudTarget::from_device(&d).unwrap();
        assert_eq!(t.latest_url(), "https://cloud.example/api/hydrometer/42/latest");

        d.configuration = Some(json!({"cloud_url": "https://cloud.example"}));
        assert!(CloudTarget::from_device(&d).is_none());

        d.configuration = Some(json!({"cloud_url": "https://cloud.example", "hydrometer_id": "a"}));
        d.device_type = "ispindel".into();
        assert!(CloudTarget::from_device(&d).is_none());
    }

    #[tokio::test]
    async fn tick_records_cloud_reading_with_bearer_token() {
        let db = memory_db().await;
        let (url, seen) = cloud(StatusCode::OK, cloud_payload(), Duration::ZERO).await;
        let d = cloud_tilt(&db, "red", &url, Some("tok")).await;
        let (_tx, mut rx) = watch::channel(false);

        let report = poll_tick(&db, &client(2_000), &mut rx).await.unwrap();
        assert_eq!(report.recorded, 1);
        assert!(!report.cancelled);
        assert_eq!(*seen.ids.lock().unwrap(), vec!["hyd-1".to_string()]);
        assert_eq!(seen.auth.lock().unwrap()[0].as_deref(), Some("Bearer tok"));

        let rows = db.readings_for_device(d.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].temperature.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(rows[0].notes.as_deref(), Some("Tilt Red auto-poll."));

        let d = db.get_device(d.id).await.unwrap().unwrap();
        assert!(d.last_import_at.is_some());
        assert!(d.last_reading_at.is_some());
    }

    #[tokio::test]
    async fn repeated_poll_of_same_sample_is_duplicate() {
        let db = memory_db().await;
        let (url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::ZERO).await;
        let d = cloud_tilt(&db, "red", &url, None).await;
        let (_tx, mut rx) = watch::channel(false);
        let c = client(2_000);

        poll_tick(&db, &c, &mut rx).await.unwrap();
        let second = poll_tick(&db, &c, &mut rx).await.unwrap();
        assert_eq!(second.recorded, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(db.readings_for_device(d.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_device() {
        let db = memory_db().await;
        let (bad_url, _) = cloud(StatusCode::INTERNAL_SERVER_ERROR, json!({}), Duration::ZERO).await;
        let (good_url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::ZERO).await;
        let bad = cloud_tilt(&db, "black", &bad_url, None).await;
        let good = cloud_tilt(&db, "red", &good_url, None).await;
        // Attributed but without a cloud endpoint.
        insert_device(&db, DeviceSeed { batch_id: Some(3), ..seed("ispindel", "ispindel") }).await;
        let (_tx, mut rx) = watch::channel(false);

        let report = poll_tick(&db, &client(2_000), &mut rx).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.recorded, 1);
        assert_eq!(report.skipped, 1);
        assert!(db.readings_for_device(bad.id).await.unwrap().is_empty());
        assert_eq!(db.readings_for_device(good.id).await.unwrap().len(), 1);
        assert!(db.get_device(bad.id).await.unwrap().unwrap().last_import_at.is_none());
    }

    #[tokio::test]
    async fn overridden_device_is_not_polled() {
        let db = memory_db().await;
        let (url, seen) = cloud(StatusCode::OK, cloud_payload(), Duration::ZERO).await;
        let d = insert_device(
            &db,
            DeviceSeed {
                batch_id: Some(3),
                manual_override: true,
                configuration: Some(json!({"cloud_url": url, "hydrometer_id": "hyd-1"})),
                ..seed("red", "tilt")
            },
        )
        .await;
        let (_tx, mut rx) = watch::channel(false);

        let report = poll_tick(&db, &client(2_000), &mut rx).await.unwrap();
        assert_eq!(report.recorded, 0);
        assert_eq!(report.failed, 0);
        assert!(seen.ids.lock().unwrap().is_empty());
        assert!(db.readings_for_device(d.id).await.unwrap().is_empty());
        assert!(db.get_device(d.id).await.unwrap().unwrap().last_import_at.is_none());
    }

    #[tokio::test]
    async fn write_failure_is_isolated_per_device() {
        let db = memory_db().await;
        let (url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::ZERO).await;
        let bad = cloud_tilt(&db, "black", &url, None).await;
        let good = cloud_tilt(&db, "red", &url, None).await;

        // Point the first device at a batch that does not exist so its insert
        // hits the foreign key.
        sqlx::query("PRAGMA foreign_keys = OFF").execute(db_pool(&db)).await.unwrap();
        db.set_device_batch(bad.id, Some(404)).await.unwrap();
        sqlx::query("PRAGMA foreign_keys = ON").execute(db_pool(&db)).await.unwrap();
        let (_tx, mut rx) = watch::channel(false);

        let report = poll_tick(&db, &client(2_000), &mut rx).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.recorded, 1);
        assert!(!report.cancelled);

        assert!(db.readings_for_device(bad.id).await.unwrap().is_empty());
        assert!(db.get_device(bad.id).await.unwrap().unwrap().last_reading_at.is_none());

        let rows = db.readings_for_device(good.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].batch_id, 3);
        assert!(db.get_device(good.id).await.unwrap().unwrap().last_reading_at.is_some());
    }

    #[tokio::test]
    async fn slow_cloud_times_out() {
        let db = memory_db().await;
        let (url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::from_secs(5)).await;
        cloud_tilt(&db, "red", &url, None).await;
        let (_tx, mut rx) = watch::channel(false);

        let c = client(100);
        let d = db.poll_targets().await.unwrap().remove(0);
        let err = c
            .latest(&CloudTarget::from_device(&d).unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout), "got {err:?}");

        let report = poll_tick(&db, &c, &mut rx).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(db.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_signal_abandons_in_flight_fetch() {
        let db = memory_db().await;
        let (url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::from_secs(30)).await;
        cloud_tilt(&db, "red", &url, None).await;
        cloud_tilt(&db, "blue", &url, None).await;
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            poll_tick(&db, &client(60_000), &mut rx),
        )
        .await
        .expect("tick should stop promptly")
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.recorded + report.failed, 0);
        assert_eq!(db.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn only_a_true_stop_abandons_the_fetch() {
        let db = memory_db().await;
        let (url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::from_millis(300)).await;
        let d = cloud_tilt(&db, "red", &url, None).await;
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(false).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(tx);
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            poll_tick(&db, &client(2_000), &mut rx),
        )
        .await
        .expect("tick should finish")
        .unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.recorded, 1);
        assert_eq!(db.readings_for_device(d.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_loop_polls_immediately_and_stops() {
        let db = memory_db().await;
        let (url, _) = cloud(StatusCode::OK, cloud_payload(), Duration::ZERO).await;
        let d = cloud_tilt(&db, "red", &url, None).await;

        let shared = SystemState::shared();
        shared
            .write()
            .await
            .register_job(JOB_ID, JOB_NAME, 3600, OffsetDateTime::now_utc());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            db.clone(),
            client(2_000),
            Duration::from_secs(3600),
            shared.clone(),
            rx,
        ));

        for _ in 0..50 {
            if !db.readings_for_device(d.id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(db.readings_for_device(d.id).await.unwrap().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();

        let st = shared.read().await;
        let job = &st.jobs[JOB_ID];
        assert!(job.last_run.is_some());
        assert!(job.next_run.is_none());
    }
}
