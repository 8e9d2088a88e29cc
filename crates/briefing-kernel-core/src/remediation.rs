use serde::{Deserialize, Serialize};

use crate::journal::{ErrorClass, ErrorPattern, ESCALATION_THRESHOLD};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    ReduceBatchSize,
    RaiseTokenBudget,
    EscalateModel,
    FlagForReview,
}

impl RemediationAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReduceBatchSize => "reduce_batch_size",
            Self::RaiseTokenBudget => "raise_token_budget",
            Self::EscalateModel => "escalate_model",
            Self::FlagForReview => "flag_for_review",
        }
    }

    /// Flags leave the rows open for a human.
    #[must_use]
    pub fn marks_resolved(self) -> bool {
        !matches!(self, Self::FlagForReview)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remediation {
    pub pattern_id: String,
    pub action: RemediationAction,
    pub count: usize,
    /// Stored as the resolution text on every row the remediation closes.
    pub resolution: String,
    /// One line for the knowledge document.
    pub learning: String,
}

/// Apply the fixed decision table to one pattern; first match wins.
///
/// Returns `None` for patterns below the recurring threshold and for
/// recurring patterns that neither match a canned remedy nor reach the
/// escalation threshold.
#[must_use]
pub fn decide_remediation(pattern: &ErrorPattern) -> Option<Remediation> {
    if !pattern.is_recurring() {
        return None;
    }

    let key = &pattern.key;
    let site = format!("{}.{}", key.service, key.operation);
    let count = pattern.count;

    let (action, resolution, learning) = if key.error_type == ErrorClass::ExternalDependency
        && pattern.rate_limited
    {
        (
            RemediationAction::ReduceBatchSize,
            "auto-remediation: reduce summarizer batch size and add delay between calls".to_string(),
            format!(
                "Summarizer rate limited {count}x at {site}; reduce batch size and add delay between calls."
            ),
        )
    } else if key.error_type == ErrorClass::BudgetExceeded {
        (
            RemediationAction::RaiseTokenBudget,
            "auto-remediation: raise the daily token budget for the affected agent".to_string(),
            format!(
                "Daily token budget exceeded {count}x at {site}; raise the daily token budget for the affected agent."
            ),
        )
    } else if key.error_type == ErrorClass::QualityIssue && count >= ESCALATION_THRESHOLD {
        (
            RemediationAction::EscalateModel,
            format!("auto-remediation: escalate {} to a higher-capability model", key.operation),
            format!(
                "Quality issues recurred {count}x at {site}; escalate {} to a higher-capability model.",
                key.operation
            ),
        )
    } else if count >= ESCALATION_THRESHOLD {
        (
            RemediationAction::FlagForReview,
            String::new(),
            format!(
                "Recurring {} errors ({count}x) at {site} have no canned remedy; flagged for review. Latest: {}",
                key.error_type, pattern.latest_message
            ),
        )
    } else {
        return None;
    };

    Some(Remediation { pattern_id: pattern.pattern_id.clone(), action, count, resolution, learning })
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::journal::PatternKey;

    fn mk_pattern(class: ErrorClass, count: usize, message: &str) -> ErrorPattern {
        let key = PatternKey {
            error_type: class,
            service: "regeneration_pipeline".to_string(),
            operation: "generate_context".to_string(),
        };
        ErrorPattern {
            pattern_id: key.to_string(),
            key,
            count,
            first_seen: OffsetDateTime::UNIX_EPOCH,
            last_seen: OffsetDateTime::UNIX_EPOCH,
            latest_message: message.to_string(),
            rate_limited: crate::journal::is_rate_limit_message(message),
        }
    }

    // Test IDs: TREM-001
    #[test]
    fn budget_pattern_at_three_is_auto_fixed_with_budget_learning() {
        let Some(remediation) =
            decide_remediation(&mk_pattern(ErrorClass::BudgetExceeded, 3, "over budget"))
        else {
            panic!("expected a remediation for a recurring budget pattern");
        };
        assert_eq!(remediation.action, RemediationAction::RaiseTokenBudget);
        assert!(remediation.action.marks_resolved());
        assert!(remediation.learning.contains("budget"));
    }

    // Test IDs: TREM-002
    #[test]
    fn rate_limit_rule_wins_over_flagging() {
        let pattern = mk_pattern(ErrorClass::ExternalDependency, 7, "HTTP 429 rate_limit_error");
        let remediation = decide_remediation(&pattern);
        assert_eq!(remediation.map(|r| r.action), Some(RemediationAction::ReduceBatchSize));
    }

    // Test IDs: TREM-003
    #[test]
    fn quality_issue_needs_five_occurrences() {
        assert!(decide_remediation(&mk_pattern(ErrorClass::QualityIssue, 4, "empty")).is_none());
        assert_eq!(
            decide_remediation(&mk_pattern(ErrorClass::QualityIssue, 5, "empty")).map(|r| r.action),
            Some(RemediationAction::EscalateModel)
        );
    }

    // Test IDs: TREM-004
    #[test]
    fn unmatched_patterns_are_flagged_only_at_escalation_threshold() {
        let below = mk_pattern(ErrorClass::ExternalDependency, 4, "connection reset");
        assert!(decide_remediation(&below).is_none());

        let Some(flag) =
            decide_remediation(&mk_pattern(ErrorClass::Operational, 5, "disk I/O error"))
        else {
            panic!("expected a flag at the escalation threshold");
        };
        assert_eq!(flag.action, RemediationAction::FlagForReview);
        assert!(!flag.action.marks_resolved());
    }

    // Test IDs: TREM-005
    #[test]
    fn non_recurring_patterns_are_ignored() {
        assert!(decide_remediation(&mk_pattern(ErrorClass::BudgetExceeded, 2, "over")).is_none());
    }

    // Test IDs: TREM-006
    #[test]
    fn earlier_rate_limit_sample_still_selects_batch_reduction() {
        let mut pattern = mk_pattern(ErrorClass::ExternalDependency, 3, "connection reset by peer");
        assert!(decide_remediation(&pattern).is_none());

        pattern.rate_limited = true;
        assert_eq!(
            decide_remediation(&pattern).map(|r| r.action),
            Some(RemediationAction::ReduceBatchSize)
        );
    }
}
