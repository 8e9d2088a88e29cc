use briefing_kernel_core::{ErrorClass, ErrorPattern, Learning, NewErrorRecord};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::audit::AuditReport;
use crate::remediation::RemediationOutcome;
use crate::{BriefingError, BriefingKernelApi};

pub const ANNEALING_SERVICE: &str = "self_annealing";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnealingReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub window_hours: u32,
    pub patterns: Vec<ErrorPattern>,
    pub remediations: Vec<RemediationOutcome>,
    pub audit: AuditReport,
    pub learnings_appended: usize,
    pub learnings_skipped: usize,
    /// In execution order.
    pub phases: Vec<PhaseOutcome>,
}

impl AnnealingReport {
    #[must_use]
    pub fn phase_failed(&self, phase: &str) -> bool {
        self.phases
            .iter()
            .any(|outcome| outcome.phase == phase && outcome.status == PhaseStatus::Failed)
    }
}

fn phase_completed(phase: &str, report: &mut AnnealingReport) {
    tracing::debug!(phase, "annealing phase completed");
    report.phases.push(PhaseOutcome {
        phase: phase.to_string(),
        status: PhaseStatus::Completed,
        error: None,
    });
}

impl BriefingKernelApi {
    /// Run one self-annealing cycle on its own task.
    ///
    /// Phases run in order: pattern detection, auto-remediation, quality audit,
    /// knowledge sink. A failing phase is journaled and later phases still run.
    ///
    /// # Errors
    /// Returns [`BriefingError::Aborted`] when the cycle task itself panics; the
    /// panic is journaled as an operational error.
    pub async fn run_annealing_cycle(&self) -> Result<AnnealingReport, BriefingError> {
        let api = self.clone();
        self.guarded(ANNEALING_SERVICE, "cycle", async move { Ok(api.annealing_cycle().await) })
            .await
    }

    async fn annealing_cycle(&self) -> AnnealingReport {
        let window_hours = self.config().audit.pattern_window_hours;
        let mut report = AnnealingReport {
            started_at: OffsetDateTime::now_utc(),
            finished_at: OffsetDateTime::now_utc(),
            window_hours,
            patterns: Vec::new(),
            remediations: Vec::new(),
            audit: AuditReport::default(),
            learnings_appended: 0,
            learnings_skipped: 0,
            phases: Vec::new(),
        };
        tracing::info!(window_hours, "self-annealing cycle started");

        match self.error_patterns(window_hours).await {
            Ok(patterns) => {
                report.patterns = patterns;
                phase_completed("pattern_detection", &mut report);
            }
            Err(err) => self.phase_failed("pattern_detection", err.to_string(), &mut report).await,
        }

        match self.auto_remediate(&report.patterns, window_hours).await {
            Ok(outcomes) => {
                report.remediations = outcomes;
                phase_completed("auto_remediation", &mut report);
            }
            Err(err) => self.phase_failed("auto_remediation", err.to_string(), &mut report).await,
        }

        report.audit = self.run_quality_audit().await;
        if report.audit.failed_sweeps.is_empty() {
            phase_completed("quality_audit", &mut report);
        } else {
            let failed = format!("failed sweeps: {}", report.audit.failed_sweeps.join(", "));
            self.phase_failed("quality_audit", failed, &mut report).await;
        }

        let learnings = report
            .remediations
            .iter()
            .map(|outcome| {
                Learning::keyed(outcome.remediation.pattern_id.clone(), outcome.remediation.learning.clone())
            })
            .chain(report.audit.learnings.iter().cloned())
            .collect::<Vec<_>>();
        match self.knowledge().append(&learnings).await {
            Ok(write) => {
                report.learnings_appended = write.appended;
                report.learnings_skipped = write.skipped;
                phase_completed("knowledge_sink", &mut report);
            }
            Err(err) => self.phase_failed("knowledge_sink", err.to_string(), &mut report).await,
        }

        report.finished_at = OffsetDateTime::now_utc();
        tracing::info!(
            patterns = report.patterns.len(),
            remediations = report.remediations.len(),
            learnings = report.learnings_appended,
            "self-annealing cycle finished"
        );
        report
    }

    async fn phase_failed(&self, phase: &'static str, error: String, report: &mut AnnealingReport) {
        tracing::error!(phase, %error, "annealing phase failed");
        self.log_error(NewErrorRecord::new(
            ErrorClass::Operational,
            ANNEALING_SERVICE,
            phase,
            format!("phase failed: {error}"),
        ))
        .await;
        report.phases.push(PhaseOutcome {
            phase: phase.to_string(),
            status: PhaseStatus::Failed,
            error: Some(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use briefing_kernel_core::{RemediationAction, DEFAULT_KNOWLEDGE_MARKER};

    use super::*;
    use crate::testing::{test_api, ScriptedSummarizer};

    async fn seed_budget_errors(api: &BriefingKernelApi, count: usize) {
        for _ in 0..count {
            api.log_error(NewErrorRecord::new(
                ErrorClass::BudgetExceeded,
                "regeneration_pipeline",
                "generate_context",
                "daily token budget exhausted for agent `context_cache`",
            ))
            .await;
        }
    }

    // Test IDs: TANN-001
    #[tokio::test]
    async fn cycle_runs_phases_in_order_and_writes_learnings_once() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        seed_budget_errors(&api, 3).await;

        let report = api.run_annealing_cycle().await?;
        let phases = report.phases.iter().map(|outcome| outcome.phase.as_str()).collect::<Vec<_>>();
        assert_eq!(
            phases,
            vec!["pattern_detection", "auto_remediation", "quality_audit", "knowledge_sink"]
        );
        assert!(report.phases.iter().all(|outcome| outcome.status == PhaseStatus::Completed));
        assert_eq!(report.remediations.len(), 1);
        assert_eq!(report.remediations[0].remediation.action, RemediationAction::RaiseTokenBudget);
        assert_eq!(report.learnings_appended, 1);

        let document = tokio::fs::read_to_string(api.knowledge().path()).await?;
        assert!(document.contains(DEFAULT_KNOWLEDGE_MARKER));
        assert!(document.contains("raise the daily token budget"));

        // The pattern is resolved now, so a second cycle has nothing new to say.
        let second = api.run_annealing_cycle().await?;
        assert!(second.remediations.is_empty());
        assert_eq!(second.learnings_appended, 0);
        Ok(())
    }

    // Test IDs: TANN-002
    #[tokio::test]
    async fn failing_phase_does_not_stop_later_phases() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        seed_budget_errors(&api, 3).await;
        // A directory where the document should be makes the sink fail.
        tokio::fs::create_dir_all(api.knowledge().path()).await?;

        let report = api.run_annealing_cycle().await?;
        assert!(report.phase_failed("knowledge_sink"));
        assert!(!report.phase_failed("auto_remediation"));
        assert_eq!(report.remediations[0].resolved, 3);

        let patterns = api.error_patterns(1).await?;
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_id, "operational:self_annealing:knowledge_sink");
        Ok(())
    }
}
