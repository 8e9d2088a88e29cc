use briefing_kernel_core::{
    assess_cache_staleness, assess_handoff_backlog, assess_output_quality, ErrorClass,
    HandoffBacklog, Learning, NewErrorRecord, OutputQuality, StalenessSweep, AUDIT_SERVICE,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::journal::lookback_start;
use crate::{BriefingError, BriefingKernelApi};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_quality: Option<OutputQuality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_staleness: Option<StalenessSweep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_backlog: Option<HandoffBacklog>,
    /// One per aggregated finding, keyed by the finding's pattern tag.
    pub learnings: Vec<Learning>,
    pub failed_sweeps: Vec<String>,
}

fn hours(value: u32) -> Duration {
    Duration::hours(i64::from(value))
}

impl BriefingKernelApi {
    async fn journal_findings(&self, findings: Vec<NewErrorRecord>, learnings: &mut Vec<Learning>) {
        for finding in findings {
            if let Some(tag) = finding.pattern_id.clone() {
                learnings.push(Learning::keyed(tag, finding.message.clone()));
            }
            self.log_error(finding).await;
        }
    }

    /// Sample the most recent briefings and journal empty or short summaries.
    ///
    /// # Errors
    /// Returns store errors when the sample cannot be read.
    pub async fn audit_output_quality(&self) -> Result<(OutputQuality, Vec<Learning>), BriefingError> {
        let audit = &self.config().audit;
        let sample_size = audit.quality_sample_size;
        let summaries =
            self.with_store(move |store| store.recent_context_summaries(sample_size)).await?;
        let quality = assess_output_quality(&summaries, audit.min_summary_length);
        let mut learnings = Vec::new();
        self.journal_findings(quality.findings(), &mut learnings).await;
        Ok((quality, learnings))
    }

    /// Journal one aggregated record when recently active contacts lack a fresh briefing.
    ///
    /// # Errors
    /// Returns store errors when activity cannot be read.
    pub async fn audit_cache_staleness(&self) -> Result<(StalenessSweep, Vec<Learning>), BriefingError> {
        let audit = &self.config().audit;
        let now = OffsetDateTime::now_utc();
        let since = lookback_start(
            now,
            Duration::days(i64::from(audit.activity_lookback_days)),
            "audit.activity_lookback_days",
        )?;
        let snapshots = self.with_store(move |store| store.active_contact_snapshots(since)).await?;
        let sweep = assess_cache_staleness(&snapshots, now, hours(audit.staleness_hours));
        let mut learnings = Vec::new();
        self.journal_findings(sweep.finding().into_iter().collect(), &mut learnings).await;
        Ok((sweep, learnings))
    }

    /// Journal overdue escalations and stuck handoffs.
    ///
    /// # Errors
    /// Returns store errors when pending handoffs cannot be read.
    pub async fn audit_handoff_backlog(&self) -> Result<(HandoffBacklog, Vec<Learning>), BriefingError> {
        let audit = &self.config().audit;
        let pending = self.with_store(|store| store.list_pending_handoffs()).await?;
        let backlog = assess_handoff_backlog(
            &pending,
            OffsetDateTime::now_utc(),
            hours(audit.handoff_overdue_hours),
            hours(audit.handoff_stuck_hours),
        );
        let mut learnings = Vec::new();
        self.journal_findings(backlog.findings(), &mut learnings).await;
        Ok((backlog, learnings))
    }

    /// Run all three sweeps; a failing sweep is journaled and the others still run.
    pub async fn run_quality_audit(&self) -> AuditReport {
        let mut report = AuditReport::default();

        match self.audit_output_quality().await {
            Ok((quality, learnings)) => {
                report.output_quality = Some(quality);
                report.learnings.extend(learnings);
            }
            Err(err) => self.sweep_failed("output_quality", &err, &mut report).await,
        }
        match self.audit_cache_staleness().await {
            Ok((sweep, learnings)) => {
                report.cache_staleness = Some(sweep);
                report.learnings.extend(learnings);
            }
            Err(err) => self.sweep_failed("cache_staleness", &err, &mut report).await,
        }
        match self.audit_handoff_backlog().await {
            Ok((backlog, learnings)) => {
                report.handoff_backlog = Some(backlog);
                report.learnings.extend(learnings);
            }
            Err(err) => self.sweep_failed("handoff_backlog", &err, &mut report).await,
        }
        report
    }

    async fn sweep_failed(&self, sweep: &'static str, err: &BriefingError, report: &mut AuditReport) {
        tracing::error!(sweep, error = %err, "quality audit sweep failed");
        self.log_error(NewErrorRecord::new(
            ErrorClass::Operational,
            AUDIT_SERVICE,
            sweep,
            format!("audit sweep failed: {err}"),
        ))
        .await;
        report.failed_sweeps.push(sweep.to_string());
    }
}
