//! Master election via a heartbeat lease in shared storage.
//!
//! Every replica runs a [`LeaderCoordinator`]. On each tick it either renews
//! its own lease (while master) or probes the stored lease and attempts an
//! atomic conditional claim when the lease is absent or stale. This is a
//! lease, not a consensus protocol: a short dual-master window is possible
//! between a master's pause and the staleness timeout, which is why the
//! job-level optimistic version check in the repository remains the actual
//! correctness boundary for firing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LeaderConfig;
use crate::error::Result;
use crate::jobs::trigger::truncate_millis;
use crate::observability::metrics as obs;
use crate::repository::LeaseRepository;

/// Well-known key of the singleton lease record.
pub const MASTER_LEASE_ID: &str = "master";

// ═══════════════════════════════════════════════════════════════════════════════
// Lease Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The singleton master lease, one row/document per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Fixed well-known key
    pub id: String,
    /// Opaque claim of the current holder, regenerated per successful claim
    pub token: Uuid,
    /// Updated periodically by the current master
    pub last_heartbeat: DateTime<Utc>,
    /// Diagnostics only
    pub instance_name: String,
    /// Diagnostics only
    pub instance_ip: Option<String>,
}

impl LeaseRecord {
    /// Build a candidate record for a fresh claim attempt.
    pub fn candidate(instance_name: &str, instance_ip: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MASTER_LEASE_ID.to_string(),
            token: Uuid::new_v4(),
            last_heartbeat: truncate_millis(now),
            instance_name: instance_name.to_string(),
            instance_ip,
        }
    }

    /// Whether the heartbeat is older than the staleness threshold at `now`.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age >= chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Leader Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

/// Heartbeat loop maintaining (or contending for) the master lease.
pub struct LeaderCoordinator {
    lease_repo: Arc<dyn LeaseRepository>,
    config: LeaderConfig,
    instance_name: String,
    mastership_tx: watch::Sender<bool>,
    /// Token of the lease currently held, when master. Local fast-path only;
    /// the stored record is authoritative.
    token: parking_lot::RwLock<Option<Uuid>>,
}

impl LeaderCoordinator {
    /// Create a coordinator. The returned receiver reports mastership to the
    /// scheduler loop and the health probe.
    pub fn new(
        lease_repo: Arc<dyn LeaseRepository>,
        config: LeaderConfig,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let instance_name = config
            .instance_name
            .clone()
            .unwrap_or_else(|| format!("pulse-{}", Uuid::new_v4()));
        let (mastership_tx, mastership_rx) = watch::channel(false);

        let coordinator = Arc::new(Self {
            lease_repo,
            config,
            instance_name,
            mastership_tx,
            token: parking_lot::RwLock::new(None),
        });
        (coordinator, mastership_rx)
    }

    /// Whether this replica currently believes it is master.
    ///
    /// Fast-path check only; every job transition is still guarded by the
    /// repository's optimistic version check.
    pub fn is_master(&self) -> bool {
        *self.mastership_tx.borrow()
    }

    /// The instance name written into the lease record.
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Run the heartbeat loop until `shutdown` fires, then resign.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            instance = %self.instance_name,
            interval = ?self.config.heartbeat_interval,
            staleness = ?self.config.staleness_threshold,
            "Leader coordinator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::warn!(error = %e, "Leader heartbeat tick failed");
                        // Storage unreachable: a held lease cannot be proven
                        // anymore, so stop firing until it can.
                        if self.is_master() {
                            self.demote("storage unavailable");
                        }
                    }
                }
            }
        }

        self.resign().await;
        tracing::info!(instance = %self.instance_name, "Leader coordinator stopped");
    }

    /// One heartbeat: renew while master, otherwise probe and maybe claim.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let held = *self.token.read();
        match held {
            Some(token) => {
                if self.lease_repo.renew(token, now).await? {
                    tracing::trace!(instance = %self.instance_name, "Lease renewed");
                } else {
                    // Someone else raced and won.
                    self.demote("lease renewal rejected");
                }
            }
            None => {
                let observed = self.lease_repo.read().await?;
                let claimable = match &observed {
                    None => true,
                    Some(lease) => lease.is_stale(self.config.staleness_threshold, now),
                };
                if claimable {
                    let candidate =
                        LeaseRecord::candidate(&self.instance_name, local_ip(), now);
                    let token = candidate.token;
                    let expected = observed.map(|l| l.token);
                    if self.lease_repo.try_claim(candidate, expected).await? {
                        self.promote(token);
                    }
                }
            }
        }
        Ok(())
    }

    /// Proactively give up mastership, marking the stored lease stale so
    /// another replica can take over without waiting out the threshold.
    pub async fn resign(&self) {
        let held = self.token.write().take();
        if let Some(token) = held {
            // Best effort: an epoch heartbeat is immediately stale.
            if let Err(e) = self
                .lease_repo
                .renew(token, DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(Utc::now))
                .await
            {
                tracing::warn!(error = %e, "Failed to release lease on shutdown");
            }
            let _ = self.mastership_tx.send(false);
            obs::set_master(false);
            tracing::info!(instance = %self.instance_name, "Resigned mastership");
        }
    }

    fn promote(&self, token: Uuid) {
        *self.token.write() = Some(token);
        let _ = self.mastership_tx.send(true);
        obs::set_master(true);
        metrics::counter!("pulse_lease_acquisitions_total").increment(1);
        tracing::info!(instance = %self.instance_name, "Acquired master lease");
    }

    fn demote(&self, reason: &str) {
        *self.token.write() = None;
        let _ = self.mastership_tx.send(false);
        obs::set_master(false);
        metrics::counter!("pulse_lease_demotions_total").increment(1);
        tracing::warn!(instance = %self.instance_name, reason, "Demoted from master");
    }
}

/// Best-effort local IP for lease diagnostics.
fn local_ip() -> Option<String> {
    // Reading the hostname-resolved address would need another crate; the
    // field is informational, so absence is acceptable.
    None
}
