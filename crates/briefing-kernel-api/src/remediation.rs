use briefing_kernel_core::{decide_remediation, ErrorPattern, Remediation, ResolveScope};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::journal::window_start;
use crate::{BriefingError, BriefingKernelApi};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationOutcome {
    pub remediation: Remediation,
    /// Rows closed with `auto_fixed` set; always zero for flags.
    pub resolved: usize,
}

impl BriefingKernelApi {
    /// Apply the remediation table to each recurring pattern and close the
    /// rows of every remedy that marks them resolved.
    ///
    /// Resolution is scoped to the pattern's triple within `window_hours`,
    /// and only touches rows that are still open.
    ///
    /// # Errors
    /// Returns store errors from the first failing resolution.
    pub async fn auto_remediate(
        &self,
        patterns: &[ErrorPattern],
        window_hours: u32,
    ) -> Result<Vec<RemediationOutcome>, BriefingError> {
        let since = window_start(window_hours)?;
        let mut outcomes = Vec::new();
        for pattern in patterns {
            let Some(remediation) = decide_remediation(pattern) else {
                continue;
            };
            let resolved = if remediation.action.marks_resolved() {
                let scope = ResolveScope::Pattern { key: pattern.key.clone(), since: Some(since) };
                let resolution = remediation.resolution.clone();
                self.with_store(move |store| {
                    store.resolve_errors(&scope, &resolution, true, OffsetDateTime::now_utc())
                })
                .await?
            } else {
                0
            };
            tracing::info!(
                pattern = %remediation.pattern_id,
                action = remediation.action.as_str(),
                count = remediation.count,
                resolved,
                "remediation applied"
            );
            outcomes.push(RemediationOutcome { remediation, resolved });
        }
        Ok(outcomes)
    }
}
