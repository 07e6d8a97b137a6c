use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Read-only status of the background jobs, exposed to operators. Each job
/// writes only its own entry; readings never flow through here.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub scheduler_running: bool,
    pub jobs: BTreeMap<String, JobState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct JobState {
    pub id: String,
    pub name: String,
    pub interval_sec: u64,
    /// A tick is currently in progress.
    pub busy: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run: Option<OffsetDateTime>,
    pub last_summary: Option<String>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub jobs: Vec<JobState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            scheduler_running: false,
            jobs: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn register_job(&mut self, id: &str, name: &str, interval_sec: u64, next_run: OffsetDateTime) {
        self.jobs.insert(
            id.to_string(),
            JobState {
                id: id.to_string(),
                name: name.to_string(),
                interval_sec,
                busy: false,
                last_run: None,
                next_run: Some(next_run),
                last_summary: None,
            },
        );
    }

    pub fn job_started(&mut self, id: &str) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.busy = true;
            job.last_run = Some(OffsetDateTime::now_utc());
        }
    }

    pub fn job_finished(&mut self, id: &str, summary: String, next_run: OffsetDateTime) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.busy = false;
            job.last_summary = Some(summary);
            job.next_run = Some(next_run);
        }
    }

    /// A stopped job keeps its history but has no next run.
    pub fn job_stopped(&mut self, id: &str) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.busy = false;
            job.next_run = None;
        }
    }

    pub fn record_alert(&mut self, detail: String) {
        self.push_event(EventKind::Alert, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            status: if self.scheduler_running {
                "running"
            } else {
                "stopped"
            },
            uptime_secs: self.started_at.elapsed().as_secs(),
            jobs: self.jobs.values().cloned().collect(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_bounded_and_newest_first() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);

        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("e{}", MAX_EVENTS + 4));
        assert_eq!(status.events.last().unwrap().detail, "e5");
    }

    #[test]
    fn job_lifecycle() {
        let mut st = SystemState::new();
        let next = OffsetDateTime::now_utc();
        st.register_job("device_poll", "Poll cloud devices", 900, next);
        assert_eq!(st.to_status().status, "stopped");

        st.scheduler_running = true;
        st.job_started("device_poll");
        assert!(st.jobs["device_poll"].busy);

        st.job_finished("device_poll", "2 recorded".into(), next);
        let job = &st.jobs["device_poll"];
        assert!(!job.busy);
        assert!(job.last_run.is_some());
        assert_eq!(job.last_summary.as_deref(), Some("2 recorded"));

        st.job_stopped("device_poll");
        assert!(st.jobs["device_poll"].next_run.is_none());
        assert_eq!(st.to_status().status, "running");
    }

    #[test]
    fn unknown_job_updates_are_ignored() {
        let mut st = SystemState::new();
        st.job_started("nope");
        st.job_finished("nope", String::new(), OffsetDateTime::now_utc());
        assert!(st.jobs.is_empty());
    }

    #[test]
    fn status_serializes_rfc3339_times() {
        let mut st = SystemState::new();
        st.register_job("j", "Job", 60, time::macros::datetime!(2024-03-21 14:30:00 UTC));
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["jobs"][0]["next_run"], "2024-03-21T14:30:00Z");
        assert!(json["jobs"][0]["last_run"].is_null());
    }
}
