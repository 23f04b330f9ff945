//! Job management commands.
//!
//! Provides create, get, status, cancel, and reschedule operations for jobs.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Create a new job
    Create(CreateArgs),

    /// Get a job by id
    Get {
        /// Job ID
        job_id: Uuid,
    },

    /// Get a job's compact status
    Status {
        /// Job ID
        job_id: Uuid,
    },

    /// Cancel a job (idempotent)
    Cancel {
        /// Job ID
        job_id: Uuid,
    },

    /// Replace a job's schedule
    Reschedule {
        /// Job ID
        job_id: Uuid,

        /// New fire time (RFC 3339, e.g. 2026-01-01T12:00:00Z)
        #[arg(long)]
        at: DateTime<Utc>,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Fire once at this time (RFC 3339)
    #[arg(long, group = "trigger")]
    at: Option<DateTime<Utc>>,

    /// Fire repeatedly at this interval (e.g. 30s, 5m)
    #[arg(long, group = "trigger")]
    every: Option<String>,

    /// Number of repetitions for --every (0 = unlimited)
    #[arg(long, default_value = "0", requires = "every")]
    repeat: i32,

    /// Fire on a cron expression (UTC)
    #[arg(long, group = "trigger")]
    cron: Option<String>,

    /// Deliver to an HTTP endpoint
    #[arg(long, group = "recipient")]
    url: Option<String>,

    /// HTTP method for --url
    #[arg(long, default_value = "POST", requires = "url")]
    method: String,

    /// Deliver to a broker channel
    #[arg(long, group = "recipient")]
    channel: Option<String>,

    /// Deliver to the environment-resolved sink
    #[arg(long, group = "recipient")]
    sink: bool,

    /// Inline JSON payload for the recipient
    #[arg(long)]
    payload: Option<String>,

    /// Retry budget per occurrence
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Per-attempt deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Correlated process instance id
    #[arg(long)]
    process_instance: Option<String>,
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    id: Uuid,
    status: String,
    fire_time: DateTime<Utc>,
    retries: u32,
    max_retries: u32,
    executions: u32,
    created_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Fire Time")]
    fire_time: String,
    #[tabled(rename = "Retries")]
    retries: String,
    #[tabled(rename = "Executions")]
    executions: u32,
}

impl From<&JobInfo> for JobRow {
    fn from(job: &JobInfo) -> Self {
        Self {
            id: job.id.to_string(),
            status: job.status.clone(),
            fire_time: job.fire_time.to_rfc3339(),
            retries: format!("{}/{}", job.retries, job.max_retries),
            executions: job.executions,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct JobStatusInfo {
    id: Uuid,
    status: String,
    retries: u32,
    executions: u32,
    fire_time: DateTime<Utc>,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Create(args) => create(args, client, format).await,
        JobCommands::Get { job_id } => get(job_id, client, format).await,
        JobCommands::Status { job_id } => status(job_id, client, format).await,
        JobCommands::Cancel { job_id } => cancel(job_id, client, format).await,
        JobCommands::Reschedule { job_id, at } => reschedule(job_id, at, client, format).await,
    }
}

fn build_trigger(args: &CreateArgs) -> Result<serde_json::Value> {
    if let Some(at) = args.at {
        Ok(serde_json::json!({"type": "point_in_time", "fire_time": at}))
    } else if let Some(every) = &args.every {
        // Validated client-side so typos fail before the request goes out.
        humantime::parse_duration(every)
            .map_err(|e| anyhow::anyhow!("Invalid --every interval '{}': {}", every, e))?;
        Ok(serde_json::json!({
            "type": "interval",
            "repeat_limit": args.repeat,
            "delay": every,
        }))
    } else if let Some(cron) = &args.cron {
        Ok(serde_json::json!({"type": "cron", "expression": cron}))
    } else {
        bail!("A trigger is required: one of --at, --every, or --cron");
    }
}

fn build_recipient(args: &CreateArgs) -> Result<serde_json::Value> {
    let payload: Option<serde_json::Value> = args
        .payload
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid --payload JSON: {}", e))?;

    if let Some(url) = &args.url {
        Ok(serde_json::json!({
            "type": "http",
            "url": url,
            "method": args.method,
            "payload": payload,
        }))
    } else if let Some(channel) = &args.channel {
        Ok(serde_json::json!({
            "type": "broker",
            "channel": channel,
            "payload": payload,
        }))
    } else if args.sink {
        Ok(serde_json::json!({"type": "sink"}))
    } else {
        bail!("A recipient is required: one of --url, --channel, or --sink");
    }
}

async fn create(args: CreateArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let mut request = serde_json::json!({
        "trigger": build_trigger(&args)?,
        "recipient": build_recipient(&args)?,
        "max_retries": args.max_retries,
    });
    if let Some(timeout_ms) = args.timeout_ms {
        request["execution_timeout_ms"] = serde_json::json!(timeout_ms);
    }
    if let Some(process_instance) = &args.process_instance {
        request["correlation"] = serde_json::json!({"process_instance_id": process_instance});
    }

    let job: JobInfo = client.post("/v2/jobs", &request).await?;

    output::print_success(&format!("Job created: {}", job.id));
    output::print_list(&[JobRow::from(&job)], format);
    Ok(())
}

async fn get(job_id: Uuid, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let job: JobInfo = client.get(&format!("/v2/jobs/{}", job_id)).await?;
    output::print_list(&[JobRow::from(&job)], format);
    Ok(())
}

async fn status(job_id: Uuid, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: JobStatusInfo = client.get(&format!("/v2/jobs/{}/status", job_id)).await?;

    match format {
        OutputFormat::Table => {
            output::print_detail("Status", &status.status);
            output::print_detail(
                "Retries",
                &format!("{}", status.retries),
            );
            output::print_detail("Executions", &format!("{}", status.executions));
            output::print_detail("Fire time", &status.fire_time.to_rfc3339());
        }
        OutputFormat::Json => output::print_item(&status, format),
    }
    Ok(())
}

async fn cancel(job_id: Uuid, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let job: JobInfo = client.delete(&format!("/v2/jobs/{}", job_id)).await?;
    output::print_success(&format!("Job {} is now {}", job.id, job.status));
    output::print_list(&[JobRow::from(&job)], format);
    Ok(())
}

async fn reschedule(
    job_id: Uuid,
    at: DateTime<Utc>,
    client: &ApiClient,
    format: OutputFormat,
) -> Result<()> {
    let request = serde_json::json!({
        "trigger": {"type": "point_in_time", "fire_time": at}
    });
    let job: JobInfo = client.patch(&format!("/v2/jobs/{}", job_id), &request).await?;

    output::print_success(&format!("Job {} rescheduled for {}", job.id, job.fire_time));
    output::print_list(&[JobRow::from(&job)], format);
    Ok(())
}
