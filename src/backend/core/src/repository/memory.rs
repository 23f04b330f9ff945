//! In-memory repository backend for development mode and tests.
//!
//! Optimistic and conditional writes are compare-and-swaps under a single
//! write lock, matching the atomicity the SQL backend gets from conditional
//! UPDATE statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobRepository, LeaseRepository};
use crate::error::{PulseError, Result};
use crate::jobs::trigger::truncate_millis;
use crate::jobs::{Job, JobId, JobStatus};
use crate::leader::LeaseRecord;

/// In-memory implementation of both repository contracts.
pub struct InMemoryRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    lease: RwLock<Option<LeaseRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            lease: RwLock::new(None),
        }
    }

    /// Number of stored jobs (terminal included).
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn save(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(PulseError::new(
                crate::error::ErrorCode::DuplicateRecord,
                format!("Job already exists: {}", job.id),
            ));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.fire_time);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn update(&self, mut job: Job, expected_version: i64) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get(&job.id)
            .ok_or_else(|| PulseError::not_found("job", job.id.to_string()))?;

        if stored.version != expected_version {
            return Err(PulseError::version_conflict(job.id.to_string()));
        }

        job.version = expected_version + 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let jobs = self.jobs.read().await;
        let mut counts = HashMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LeaseRepository for InMemoryRepository {
    async fn read(&self) -> Result<Option<LeaseRecord>> {
        Ok(self.lease.read().await.clone())
    }

    async fn try_claim(
        &self,
        candidate: LeaseRecord,
        expected_token: Option<Uuid>,
    ) -> Result<bool> {
        let mut lease = self.lease.write().await;
        let applies = match (&*lease, expected_token) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.token == expected,
            _ => false,
        };
        if applies {
            *lease = Some(candidate);
        }
        Ok(applies)
    }

    async fn renew(&self, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut lease = self.lease.write().await;
        match lease.as_mut() {
            Some(current) if current.token == token => {
                current.last_heartbeat = truncate_millis(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
