//! Retention background task for mailsink.
//!
//! Periodically evicts messages older than the configured age and trims
//! the mailbox down to the configured count.

use chrono::{DateTime, Duration as AgeDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::RetentionConfig;
use crate::db::Database;
use crate::mail::MessageRepository;

/// Messages removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Removed for exceeding the maximum age.
    pub expired: u64,
    /// Removed for exceeding the maximum count.
    pub excess: u64,
}

/// Retention policy enforcer.
pub struct RetentionManager {
    db: Database,
    config: RetentionConfig,
}

impl RetentionManager {
    /// Create a manager for the given database and policy.
    pub fn new(db: Database, config: RetentionConfig) -> Self {
        Self { db, config }
    }

    /// Run sweeps until `shutdown` becomes `true`.
    ///
    /// The first sweep happens immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Retention policy disabled");
            return;
        }

        info!(
            max_age_hours = self.config.max_age_hours,
            max_count = self.config.max_count,
            interval_secs = self.config.cleanup_interval_secs,
            "Retention manager started"
        );

        let mut timer = interval(Duration::from_secs(self.config.cleanup_interval_secs.max(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = timer.tick() => {
                    self.sweep(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Retention manager stopped");
    }

    /// Apply both policies once, as of `now`.
    ///
    /// A zero limit disables that policy. Failures are logged and counted
    /// as nothing removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        debug!("Running retention sweep");
        let repo = MessageRepository::new(&self.db);
        let mut report = SweepReport::default();

        if self.config.max_age_hours > 0 {
            let hours = i64::try_from(self.config.max_age_hours).unwrap_or(i64::MAX);
            let cutoff = AgeDuration::try_hours(hours)
                .and_then(|age| now.checked_sub_signed(age))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            match repo.delete_older_than(cutoff).await {
                Ok(deleted) => report.expired = deleted,
                Err(e) => error!(error = %e, "Failed to delete expired messages"),
            }
        }

        if self.config.max_count > 0 {
            match repo.delete_excess(self.config.max_count).await {
                Ok(deleted) => report.excess = deleted,
                Err(e) => error!(error = %e, "Failed to delete excess messages"),
            }
        }

        if report.expired > 0 || report.excess > 0 {
            info!(
                expired = report.expired,
                excess = report.excess,
                "Retention sweep removed messages"
            );
        }

        report
    }
}

/// Start the retention manager as a background task.
pub fn start_retention(
    db: Database,
    config: RetentionConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let manager = RetentionManager::new(db, config);
    tokio::spawn(manager.run(shutdown))
}
