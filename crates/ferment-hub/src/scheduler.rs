//! Owns the two background loops: the cloud poller and the freshness
//! monitor.
//!
//! ```text
//! main ──start()──▶ Scheduler ──spawn──▶ poller::run     (watch stop #1)
//!                              └─spawn──▶ freshness::run  (watch stop #2)
//! ```
//!
//! Each loop has its own stop channel, so stopping is independent and never
//! waits on the other loop's timer. Readings never pass through here; the
//! loops write to the store directly.

use std::time::Duration;

use anyhow::Result;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::db::Db;
use crate::freshness;
use crate::poller::{self, CloudClient};
use crate::state::{SharedState, StatusResponse};

struct Job {
    id: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    shared: SharedState,
    jobs: Vec<Job>,
}

impl Scheduler {
    /// Spawn both loops. With `enabled = false` nothing is spawned and the
    /// status reports `stopped`.
    pub async fn start(db: Db, cfg: &SchedulerConfig, shared: SharedState) -> Result<Self> {
        let mut jobs = Vec::new();

        if !cfg.enabled {
            info!("scheduler disabled by configuration");
            shared
                .write()
                .await
                .record_system("scheduler disabled by configuration".into());
            return Ok(Self { shared, jobs });
        }

        let poll_every = Duration::from_secs(cfg.poll_interval_sec);
        let fresh_every = Duration::from_secs(cfg.freshness_interval_sec);
        let client = CloudClient::new(Duration::from_secs(cfg.fetch_timeout_sec))?;

        {
            let now = OffsetDateTime::now_utc();
            let mut st = shared.write().await;
            st.register_job(poller::JOB_ID, poller::JOB_NAME, cfg.poll_interval_sec, now);
            st.register_job(
                freshness::JOB_ID,
                freshness::JOB_NAME,
                cfg.freshness_interval_sec,
                now + fresh_every,
            );
            st.scheduler_running = true;
            st.record_system(format!(
                "scheduler started (poll every {}s, freshness every {}s)",
                cfg.poll_interval_sec, cfg.freshness_interval_sec
            ));
        }

        let (stop, rx) = watch::channel(false);
        jobs.push(Job {
            id: poller::JOB_ID,
            stop,
            handle: tokio::spawn(poller::run(db.clone(), client, poll_every, shared.clone(), rx)),
        });

        let (stop, rx) = watch::channel(false);
        jobs.push(Job {
            id: freshness::JOB_ID,
            stop,
            handle: tokio::spawn(freshness::run(db, fresh_every, shared.clone(), rx)),
        });

        info!(
            poll_interval_sec = cfg.poll_interval_sec,
            freshness_interval_sec = cfg.freshness_interval_sec,
            fetch_timeout_sec = cfg.fetch_timeout_sec,
            "scheduler started"
        );
        Ok(Self { shared, jobs })
    }

    /// Signal every loop, then wait for each to finish its current step.
    pub async fn stop(self) {
        for job in &self.jobs {
            // A loop that already exited has dropped its receiver.
            let _ = job.stop.send(true);
        }
        for job in self.jobs {
            if let Err(e) = job.handle.await {
                warn!(job = job.id, "background job ended abnormally: {e}");
            }
        }

        let mut st = self.shared.write().await;
        st.scheduler_running = false;
        st.record_system("scheduler stopped".into());
        info!("scheduler stopped");
    }

    pub async fn status(&self) -> StatusResponse {
        self.shared.read().await.to_status()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
