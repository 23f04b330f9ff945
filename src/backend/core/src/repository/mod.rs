//! Persistence contracts for jobs and the master lease.
//!
//! The repository is the collaborator boundary towards storage: SQL and
//! in-memory backends implement the same contract. All coordination between
//! replicas flows through these two traits — every mutation is a conditional
//! or optimistic write, never a distributed lock.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{Job, JobId, JobStatus};
use crate::leader::LeaseRecord;

/// Persistent store for job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a newly created job.
    async fn save(&self, job: Job) -> Result<Job>;

    /// Look up a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Jobs with status in {SCHEDULED, RETRY} and `fire_time <= now`,
    /// ordered by fire time ascending, bounded by `limit`.
    async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>>;

    /// Persist a job mutation, conditioned on the stored version still being
    /// `expected_version`. On success the stored version is bumped and the
    /// updated job returned; a concurrent writer surfaces as
    /// [`crate::error::ErrorCode::VersionConflict`].
    async fn update(&self, job: Job, expected_version: i64) -> Result<Job>;

    /// Physically delete a job. Storage-layer policy; never called by the
    /// scheduler itself.
    async fn delete(&self, id: JobId) -> Result<()>;

    /// Job counts per status, for diagnostics.
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// Cheap connectivity probe for the readiness endpoint.
    async fn ping(&self) -> Result<()>;
}

/// Store for the singleton master lease record.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Read the current lease record, if any replica ever claimed one.
    async fn read(&self) -> Result<Option<LeaseRecord>>;

    /// Attempt to claim mastership with `candidate`, conditioned on the
    /// record's token still being `expected_token` (`None` = no record
    /// existed when it was read). Returns whether the claim applied.
    async fn try_claim(
        &self,
        candidate: LeaseRecord,
        expected_token: Option<Uuid>,
    ) -> Result<bool>;

    /// Renew the heartbeat, conditioned on still holding `token`. Returns
    /// whether the renewal applied; `false` means another replica raced and
    /// won, and the caller must demote itself.
    async fn renew(&self, token: Uuid, now: DateTime<Utc>) -> Result<bool>;
}
