//! PostgreSQL repository backend.
//!
//! Uses sqlx with conditional single-statement writes: the optimistic version
//! check on jobs and the token check on the lease are both enforced by the
//! database inside one UPDATE, so they hold across replicas.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use super::{JobRepository, LeaseRepository};
use crate::error::{PulseError, Result};
use crate::jobs::{Job, JobCorrelation, JobId, JobStatus};
use crate::leader::{LeaseRecord, MASTER_LEASE_ID};

/// PostgreSQL implementation of both repository contracts.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a new connection pool.
    pub async fn new(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PulseError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_job(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let trigger: serde_json::Value = row.try_get("trigger")?;
    let recipient: serde_json::Value = row.try_get("recipient")?;
    let backoff: serde_json::Value = row.try_get("backoff")?;
    let timeout_ms: Option<i64> = row.try_get("execution_timeout_ms")?;

    Ok(Job {
        id: JobId(row.try_get::<Uuid, _>("id")?),
        correlation: JobCorrelation {
            process_id: row.try_get("process_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            node_instance_id: row.try_get("node_instance_id")?,
            root_process_id: row.try_get("root_process_id")?,
            root_process_instance_id: row.try_get("root_process_instance_id")?,
        },
        trigger: serde_json::from_value(trigger)?,
        recipient: serde_json::from_value(recipient)?,
        status: JobStatus::parse(&status)?,
        retries: row.try_get::<i32, _>("retries")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        backoff: serde_json::from_value(backoff)?,
        execution_timeout: timeout_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
        executions: row.try_get::<i32, _>("executions")? as u32,
        cancel_requested: row.try_get("cancel_requested")?,
        fire_time: row.try_get("fire_time")?,
        created_at: row.try_get("created_at")?,
        last_update: row.try_get("last_update")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl JobRepository for PostgresRepository {
    async fn save(&self, job: Job) -> Result<Job> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, version, fire_time, trigger, recipient,
                retries, max_retries, backoff, execution_timeout_ms,
                executions, cancel_requested,
                process_id, process_instance_id, node_instance_id,
                root_process_id, root_process_instance_id,
                created_at, last_update
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id.0)
        .bind(job.status.as_str())
        .bind(job.version)
        .bind(job.fire_time)
        .bind(serde_json::to_value(&job.trigger)?)
        .bind(serde_json::to_value(&job.recipient)?)
        .bind(job.retries as i32)
        .bind(job.max_retries as i32)
        .bind(serde_json::to_value(&job.backoff)?)
        .bind(job.execution_timeout.map(|d| d.as_millis() as i64))
        .bind(job.executions as i32)
        .bind(job.cancel_requested)
        .bind(&job.correlation.process_id)
        .bind(&job.correlation.process_instance_id)
        .bind(&job.correlation.node_instance_id)
        .bind(&job.correlation.root_process_id)
        .bind(&job.correlation.root_process_instance_id)
        .bind(job.created_at)
        .bind(job.last_update)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('SCHEDULED', 'RETRY') AND fire_time <= $1
            ORDER BY fire_time ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn update(&self, mut job: Job, expected_version: i64) -> Result<Job> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3, version = $2 + 1, fire_time = $4, trigger = $5,
                retries = $6, executions = $7, cancel_requested = $8,
                last_update = $9
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(job.id.0)
        .bind(expected_version)
        .bind(job.status.as_str())
        .bind(job.fire_time)
        .bind(serde_json::to_value(&job.trigger)?)
        .bind(job.retries as i32)
        .bind(job.executions as i32)
        .bind(job.cancel_requested)
        .bind(job.last_update)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing record.
            let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
                .bind(job.id.0)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return Err(if exists {
                PulseError::version_conflict(job.id.to_string())
            } else {
                PulseError::not_found("job", job.id.to_string())
            });
        }

        job.version = expected_version + 1;
        Ok(job)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            counts.insert(JobStatus::parse(&status)?, total as u64);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseRepository for PostgresRepository {
    async fn read(&self) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query("SELECT * FROM job_service_management WHERE id = $1")
            .bind(MASTER_LEASE_ID)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(LeaseRecord {
                id: row.try_get("id")?,
                token: row.try_get("token")?,
                last_heartbeat: row.try_get("last_heartbeat")?,
                instance_name: row.try_get("instance_name")?,
                instance_ip: row.try_get("instance_ip")?,
            })
        })
        .transpose()
    }

    async fn try_claim(
        &self,
        candidate: LeaseRecord,
        expected_token: Option<Uuid>,
    ) -> Result<bool> {
        let result = match expected_token {
            // No record observed: only the very first insert wins.
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO job_service_management (id, token, last_heartbeat, instance_name, instance_ip)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(&candidate.id)
                .bind(candidate.token)
                .bind(candidate.last_heartbeat)
                .bind(&candidate.instance_name)
                .bind(&candidate.instance_ip)
                .execute(&self.pool)
                .await?
            }
            // Takeover conditioned on the token observed when the lease was read.
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE job_service_management
                    SET token = $2, last_heartbeat = $3, instance_name = $4, instance_ip = $5
                    WHERE id = $1 AND token = $6
                    "#,
                )
                .bind(&candidate.id)
                .bind(candidate.token)
                .bind(candidate.last_heartbeat)
                .bind(&candidate.instance_name)
                .bind(&candidate.instance_ip)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn renew(&self, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_service_management SET last_heartbeat = $1 WHERE id = $2 AND token = $3",
        )
        .bind(now)
        .bind(MASTER_LEASE_ID)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
