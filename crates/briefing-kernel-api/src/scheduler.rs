//! Fixed-cadence background jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::{BriefingError, BriefingKernelApi};

/// Longest cadence a job can be configured with (one year).
pub const MAX_PERIOD_MINUTES: u64 = 525_600;

pub const SCHEDULER_SERVICE: &str = "scheduler";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledJob {
    HandoffSweep,
    StalenessSweep,
    AnnealingCycle,
    NightlyRefresh,
}

impl ScheduledJob {
    pub const ALL: [Self; 4] =
        [Self::HandoffSweep, Self::StalenessSweep, Self::AnnealingCycle, Self::NightlyRefresh];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandoffSweep => "handoff_sweep",
            Self::StalenessSweep => "staleness_sweep",
            Self::AnnealingCycle => "annealing_cycle",
            Self::NightlyRefresh => "nightly_refresh",
        }
    }

    /// Configured cadence, clamped to between one minute and [`MAX_PERIOD_MINUTES`].
    #[must_use]
    pub fn period(self, api: &BriefingKernelApi) -> Duration {
        let scheduler = &api.config().scheduler;
        let minutes = match self {
            Self::HandoffSweep => scheduler.handoff_sweep_minutes,
            Self::StalenessSweep => scheduler.staleness_sweep_minutes,
            Self::AnnealingCycle => scheduler.annealing_cycle_minutes,
            Self::NightlyRefresh => scheduler.nightly_refresh_minutes,
        };
        Duration::from_secs(minutes.clamp(1, MAX_PERIOD_MINUTES) * 60)
    }

    /// Run the job once. Panics are contained and journaled.
    ///
    /// # Errors
    /// Returns the job's failure; the scheduler only logs it.
    pub async fn run_once(self, api: &BriefingKernelApi) -> Result<(), BriefingError> {
        let job_api = api.clone();
        api.guarded(SCHEDULER_SERVICE, self.as_str(), async move {
            match self {
                Self::HandoffSweep => job_api.audit_handoff_backlog().await.map(|_| ()),
                Self::StalenessSweep => job_api.audit_cache_staleness().await.map(|_| ()),
                Self::AnnealingCycle => job_api.run_annealing_cycle().await.map(|_| ()),
                Self::NightlyRefresh => job_api.nightly_refresh().await.map(|_| ()),
            }
        })
        .await
    }
}

/// Running scheduler; dropping it without [`SchedulerHandle::shutdown`]
/// leaves the jobs running until the runtime stops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every job loop to stop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::warn!(%error, "scheduler task ended abnormally");
            }
        }
    }
}

/// Spawn one loop per job. The first run of each job happens one period
/// after start. Returns a handle with no jobs when scheduling is disabled.
#[must_use]
pub fn start_scheduler(api: &BriefingKernelApi) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    if api.config().scheduler.enabled {
        for job in ScheduledJob::ALL {
            tasks.push(tokio::spawn(job_loop(api.clone(), job, shutdown_rx.clone())));
        }
        tracing::info!(jobs = tasks.len(), "scheduler started");
    } else {
        tracing::info!("scheduler disabled");
    }
    SchedulerHandle { shutdown_tx, tasks }
}

async fn job_loop(api: BriefingKernelApi, job: ScheduledJob, mut shutdown_rx: watch::Receiver<bool>) {
    let period = job.period(&api);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracing::debug!(job = job.as_str(), "scheduled job starting");
                if let Err(error) = job.run_once(&api).await {
                    tracing::warn!(%error, job = job.as_str(), "scheduled job failed");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!(job = job.as_str(), "scheduled job stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::config::BriefingConfig;
    use crate::testing::{test_api, test_api_with_config, ScriptedSummarizer};

    // Test IDs: TSCH-001
    #[tokio::test]
    async fn scheduler_starts_one_loop_per_job_and_stops_on_shutdown() {
        let (api, summarizer) = test_api(ScriptedSummarizer::default());
        let handle = start_scheduler(&api);
        assert_eq!(handle.job_count(), 4);
        handle.shutdown().await;
        assert_eq!(summarizer.calls(), 0);
    }

    // Test IDs: TSCH-002
    #[tokio::test]
    async fn disabled_scheduler_spawns_nothing() {
        let mut config = BriefingConfig::default();
        config.scheduler.enabled = false;
        let (api, _summarizer) = test_api_with_config(config, ScriptedSummarizer::default());
        let handle = start_scheduler(&api);
        assert_eq!(handle.job_count(), 0);
        handle.shutdown().await;
    }

    // Test IDs: TSCH-003
    #[tokio::test]
    async fn default_cadences_match_the_sweep_plan() {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        let hours = ScheduledJob::ALL
            .iter()
            .map(|job| job.period(&api).as_secs() / 3600)
            .collect::<Vec<_>>();
        assert_eq!(hours, vec![2, 4, 6, 24]);
    }

    // Test IDs: TSCH-004
    #[tokio::test]
    async fn every_job_runs_once_on_an_empty_store() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        for job in ScheduledJob::ALL {
            job.run_once(&api).await?;
        }
        assert_eq!(api.error_summary(1).await?.total, 0);
        Ok(())
    }

    // Test IDs: TSCH-005
    #[tokio::test]
    async fn oversized_cadences_are_capped_instead_of_overflowing() {
        let mut config = BriefingConfig::default();
        config.scheduler.handoff_sweep_minutes = u64::MAX;
        config.scheduler.staleness_sweep_minutes = 0;
        let (api, _summarizer) = test_api_with_config(config, ScriptedSummarizer::default());

        assert_eq!(
            ScheduledJob::HandoffSweep.period(&api),
            Duration::from_secs(MAX_PERIOD_MINUTES * 60)
        );
        assert_eq!(ScheduledJob::StalenessSweep.period(&api), Duration::from_secs(60));

        let handle = start_scheduler(&api);
        assert_eq!(handle.job_count(), 4);
        handle.shutdown().await;
    }
}
