use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Per-device alert thresholds, stored as JSON on the device row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub enable_alerts: bool,
    #[serde(default)]
    pub temperature_min: Option<f64>,
    #[serde(default)]
    pub temperature_max: Option<f64>,
    #[serde(default)]
    pub missing_data_alert: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub device_type: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub calibration_data: Option<Value>,
    pub configuration: Option<Value>,

    pub is_active: bool,
    pub batch_id: Option<i64>,
    pub manual_override: bool,
    pub auto_import_enabled: bool,
    pub import_interval_seconds: i64,

    pub alert_config: Option<AlertConfig>,

    pub last_reading_at: Option<i64>,
    pub last_import_at: Option<i64>,
}

/// Device definition as seeded from the config file.
#[derive(Debug, Clone)]
pub struct DeviceSeed {
    pub name: String,
    pub device_type: String,
    pub api_token: Option<String>,
    pub calibration_data: Option<Value>,
    pub configuration: Option<Value>,
    pub is_active: bool,
    pub batch_id: Option<i64>,
    pub manual_override: bool,
    pub auto_import_enabled: bool,
    pub import_interval_seconds: i64,
    pub alert_config: Option<AlertConfig>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FermentationReading {
    pub id: i64,
    pub batch_id: i64,
    pub device_id: Option<i64>,
    /// Observation time, unix milliseconds.
    pub ts: i64,
    pub gravity: Option<f64>,
    pub temperature: Option<f64>,
    pub ph: Option<f64>,
    pub notes: Option<String>,
    pub source: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub batch_id: i64,
    pub device_id: i64,
    /// Observation time, unix milliseconds.
    pub ts: i64,
    pub gravity: Option<f64>,
    pub temperature: Option<f64>,
    pub notes: String,
    pub source: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The (device_id, batch_id, ts) unique index rejected the row.
    Duplicate,
}

#[derive(FromRow)]
struct DeviceRow {
    id: i64,
    name: String,
    device_type: String,
    api_token: Option<String>,
    calibration_data: Option<String>,
    configuration: Option<String>,
    is_active: bool,
    batch_id: Option<i64>,
    manual_override: bool,
    auto_import_enabled: bool,
    import_interval_seconds: i64,
    alert_config: Option<String>,
    last_reading_at: Option<i64>,
    last_import_at: Option<i64>,
}

impl From<DeviceRow> for Device {
    fn from(r: DeviceRow) -> Self {
        let alert_config = r.alert_config.as_deref().and_then(|s| {
            serde_json::from_str::<AlertConfig>(s)
                .map_err(|e| {
                    tracing::warn!(device = %r.name, "ignoring unreadable alert_config: {e}");
                })
                .ok()
        });
        Device {
            id: r.id,
            name: r.name,
            device_type: r.device_type,
            api_token: r.api_token,
            calibration_data: parse_json_column(r.calibration_data.as_deref()),
            configuration: parse_json_column(r.configuration.as_deref()),
            is_active: r.is_active,
            batch_id: r.batch_id,
            manual_override: r.manual_override,
            auto_import_enabled: r.auto_import_enabled,
            import_interval_seconds: r.import_interval_seconds,
            alert_config,
            last_reading_at: r.last_reading_at,
            last_import_at: r.last_import_at,
        }
    }
}

fn parse_json_column(raw: Option<&str>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .filter(|v: &Value| !v.is_null())
}

fn json_column(v: Option<&Value>) -> Option<String> {
    v.map(|v| v.to_string())
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Reading timestamps are stored as unix milliseconds so distinct
/// sub-second observations keep distinct dedup keys.
pub fn unix_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

const DEVICE_COLUMNS: &str = r#"
    id, name, device_type, api_token, calibration_data, configuration,
    is_active, batch_id, manual_override, auto_import_enabled,
    import_interval_seconds, alert_config, last_reading_at, last_import_at
"#;

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/ferment-hub/ferment.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Batches
    // ----------------------------

    pub async fn upsert_batch(&self, id: i64, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batches (id, name) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET name=excluded.name
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(&self.pool)
        .await
        .context("upsert_batch failed")?;
        Ok(())
    }

    pub async fn batch_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM batches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("batch_exists failed")?;
        Ok(found.is_some())
    }

    // ----------------------------
    // Devices
    // ----------------------------

    /// Insert or refresh a device keyed by (name, device_type). Runtime
    /// bookkeeping (`last_reading_at`, `last_import_at`) is left untouched.
    pub async fn upsert_device(&self, d: &DeviceSeed) -> Result<i64> {
        let alert_config = d
            .alert_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode alert_config")?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO devices (
              name, device_type, api_token, calibration_data, configuration,
              is_active, batch_id, manual_override, auto_import_enabled,
              import_interval_seconds, alert_config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, device_type) DO UPDATE SET
              api_token=excluded.api_token,
              calibration_data=excluded.calibration_data,
              configuration=excluded.configuration,
              is_active=excluded.is_active,
              batch_id=excluded.batch_id,
              manual_override=excluded.manual_override,
              auto_import_enabled=excluded.auto_import_enabled,
              import_interval_seconds=excluded.import_interval_seconds,
              alert_config=excluded.alert_config
            RETURNING id
            "#,
        )
        .bind(&d.name)
        .bind(&d.device_type)
        .bind(&d.api_token)
        .bind(json_column(d.calibration_data.as_ref()))
        .bind(json_column(d.configuration.as_ref()))
        .bind(d.is_active)
        .bind(d.batch_id)
        .bind(d.manual_override)
        .bind(d.auto_import_enabled)
        .bind(d.import_interval_seconds)
        .bind(alert_config)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert_device failed for '{}'", d.name))?;
        Ok(id)
    }

    pub async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?");
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_device failed")?;
        Ok(row.map(Device::from))
    }

    pub async fn find_device_by_token(&self, device_type: &str, token: &str) -> Result<Option<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE api_token = ? AND device_type = ? ORDER BY id LIMIT 1"
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(token)
            .bind(device_type)
            .fetch_optional(&self.pool)
            .await
            .context("find_device_by_token failed")?;
        Ok(row.map(Device::from))
    }

    pub async fn find_device_by_name(&self, device_type: &str, name: &str) -> Result<Option<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE name = ? AND device_type = ? ORDER BY id LIMIT 1"
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(name)
            .bind(device_type)
            .fetch_optional(&self.pool)
            .await
            .context("find_device_by_name failed")?;
        Ok(row.map(Device::from))
    }

    /// Case-insensitive substring match on the device name (Tilt colours).
    pub async fn find_device_by_name_fragment(
        &self,
        device_type: &str,
        fragment: &str,
    ) -> Result<Option<Device>> {
        // instr() instead of LIKE so '%' and '_' in the fragment match literally.
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE instr(lower(name), lower(?)) > 0 AND device_type = ?
             ORDER BY id LIMIT 1"
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(fragment)
            .bind(device_type)
            .fetch_optional(&self.pool)
            .await
            .context("find_device_by_name_fragment failed")?;
        Ok(row.map(Device::from))
    }

    /// Returns false when no device with `id` exists.
    pub async fn set_device_batch(&self, id: i64, batch_id: Option<i64>) -> Result<bool> {
        let res = sqlx::query("UPDATE devices SET batch_id = ? WHERE id = ?")
            .bind(batch_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("set_device_batch failed")?;
        Ok(res.rows_affected() > 0)
    }

    /// Active devices attributed to a batch and not under manual override
    /// (poll scheduler targets).
    pub async fn poll_targets(&self) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE is_active = 1
               AND manual_override = 0
               AND batch_id IS NOT NULL
             ORDER BY id"
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("poll_targets failed")?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    /// Devices the freshness monitor is responsible for.
    pub async fn freshness_targets(&self) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE is_active = 1
               AND auto_import_enabled = 1
               AND manual_override = 0
               AND batch_id IS NOT NULL
             ORDER BY id"
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("freshness_targets failed")?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    pub async fn touch_last_import(&self, device_id: i64, ts: i64) -> Result<()> {
        sqlx::query("UPDATE devices SET last_import_at = ? WHERE id = ?")
            .bind(ts)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("touch_last_import failed")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn reading_exists(&self, device_id: i64, batch_id: i64, ts: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM fermentation_readings
            WHERE device_id = ? AND batch_id = ? AND ts = ?
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(batch_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await
        .context("reading_exists failed")?;
        Ok(found.is_some())
    }

    /// Inserts the reading and stamps the device's `last_reading_at` in one
    /// transaction. A unique-index conflict rolls back and reports
    /// `Duplicate` instead of failing.
    pub async fn insert_reading(&self, r: &NewReading) -> Result<InsertOutcome> {
        let now = now_unix();
        let mut tx = self.pool.begin().await.context("insert_reading: begin failed")?;

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO fermentation_readings
              (batch_id, device_id, ts, gravity, temperature, notes, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(r.batch_id)
        .bind(r.device_id)
        .bind(r.ts)
        .bind(r.gravity)
        .bind(r.temperature)
        .bind(&r.notes)
        .bind(r.source)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let reading_id = match inserted {
            Ok(id) => id,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tx.rollback().await.context("insert_reading: rollback failed")?;
                return Ok(InsertOutcome::Duplicate);
            }
            Err(e) => return Err(e).context("insert_reading failed"),
        };

        sqlx::query("UPDATE devices SET last_reading_at = ? WHERE id = ?")
            .bind(now)
            .bind(r.device_id)
            .execute(&mut *tx)
            .await
            .context("insert_reading: last_reading_at update failed")?;

        tx.commit().await.context("insert_reading: commit failed")?;
        Ok(InsertOutcome::Inserted(reading_id))
    }

    /// Newest reading a device produced for the given batch.
    pub async fn latest_reading(&self, device_id: i64, batch_id: i64) -> Result<Option<FermentationReading>> {
        let row = sqlx::query_as::<_, FermentationReading>(
            r#"
            SELECT id, batch_id, device_id, ts, gravity, temperature, ph, notes, source, created_at
            FROM fermentation_readings
            WHERE device_id = ? AND batch_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")?;
        Ok(row)
    }

    #[cfg(test)]
    pub async fn readings_for_device(&self, device_id: i64) -> Result<Vec<FermentationReading>> {
        let rows = sqlx::query_as::<_, FermentationReading>(
            r#"
            SELECT id, batch_id, device_id, ts, gravity, temperature, ph, notes, source, created_at
            FROM fermentation_readings
            WHERE device_id = ?
            ORDER BY ts, id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("readings_for_device failed")?;
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn count_readings(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fermentation_readings")
            .fetch_one(&self.pool)
            .await
            .context("count_readings failed")?;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Test fixtures shared by the other modules' test suites
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
