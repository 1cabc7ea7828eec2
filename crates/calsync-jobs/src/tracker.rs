use calsync_core::JobStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Progress of a single background job.
#[derive(Debug, Clone)]
pub struct JobState {
    pub job_id: String,
    pub status: String,
    pub processed: u64,
    pub total: Option<u64>,
    pub detail: Option<Value>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn new(job_id: String, total: Option<u64>) -> Self {
        Self {
            job_id,
            status: "queued".to_string(),
            processed: 0,
            total,
            detail: None,
            message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn to_status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id.clone(),
            status: self.status.clone(),
            processed: self.processed,
            total: self.total,
            detail: self.detail.clone(),
            message: self.message.clone(),
        }
    }
}

/// Partial update applied to a job entry; unset fields keep their value.
#[derive(Debug, Default)]
pub struct JobUpdate {
    pub status: Option<String>,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub message: Option<String>,
    pub detail: Option<Value>,
}

/// Thread-safe registry for currently running jobs.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, JobState>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job and return its initial state.
    pub fn create(&self, prefix: &str, total: Option<u64>) -> JobState {
        let job_id = format!("{prefix}-{}", Uuid::new_v4().simple());
        let state = JobState::new(job_id.clone(), total);
        self.jobs
            .lock()
            .expect("job registry poisoned")
            .insert(job_id, state.clone());
        state
    }

    pub fn get(&self, job_id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .expect("job registry poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn update(&self, job_id: &str, update: JobUpdate) -> Option<JobState> {
        let mut jobs = self.jobs.lock().expect("job registry poisoned");
        let state = jobs.get_mut(job_id)?;
        if let Some(status) = update.status {
            state.status = status;
        }
        if let Some(processed) = update.processed {
            state.processed = processed;
        }
        if let Some(total) = update.total {
            state.total = Some(total);
        }
        if let Some(message) = update.message {
            state.message = Some(message);
        }
        if let Some(detail) = update.detail {
            state.detail = Some(detail);
        }
        if matches!(state.status.as_str(), "completed" | "failed") && state.finished_at.is_none() {
            state.finished_at = Some(Utc::now());
        }
        Some(state.clone())
    }

    pub fn increment(
        &self,
        job_id: &str,
        processed_delta: u64,
        total_delta: u64,
    ) -> Option<JobState> {
        let mut jobs = self.jobs.lock().expect("job registry poisoned");
        let state = jobs.get_mut(job_id)?;
        if processed_delta > 0 {
            state.processed += processed_delta;
        }
        if total_delta > 0 {
            state.total = Some(state.total.unwrap_or(0) + total_delta);
        }
        Some(state.clone())
    }

    pub fn finish(&self, job_id: &str, detail: Option<Value>) -> Option<JobState> {
        self.update(
            job_id,
            JobUpdate {
                status: Some("completed".to_string()),
                detail,
                ..JobUpdate::default()
            },
        )
    }

    pub fn fail(&self, job_id: &str, message: &str) -> Option<JobState> {
        self.update(
            job_id,
            JobUpdate {
                status: Some("failed".to_string()),
                message: Some(message.to_string()),
                ..JobUpdate::default()
            },
        )
    }
}
