use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::context::Handoff;
use crate::journal::{ErrorClass, NewErrorRecord};
use crate::{ContactId, HandoffId};

pub const AUDIT_SERVICE: &str = "quality_auditor";
pub const EMPTY_SUMMARY_PATTERN: &str = "empty_summary";
pub const SHORT_SUMMARY_PATTERN: &str = "short_summary";
pub const STALE_CONTEXT_PATTERN: &str = "stale_context";
pub const HANDOFF_ESCALATION_PATTERN: &str = "handoff_escalation";
pub const HANDOFF_STUCK_PATTERN: &str = "handoff_stuck";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputQuality {
    pub sample_size: usize,
    pub empty_count: usize,
    pub short_count: usize,
}

/// Count empty and (separately) short summaries in a sample.
#[must_use]
pub fn assess_output_quality(summaries: &[String], min_length: usize) -> OutputQuality {
    let mut quality = OutputQuality { sample_size: summaries.len(), ..OutputQuality::default() };
    for summary in summaries {
        let trimmed = summary.trim();
        if trimmed.is_empty() {
            quality.empty_count += 1;
        } else if trimmed.chars().count() < min_length {
            quality.short_count += 1;
        }
    }
    quality
}

impl OutputQuality {
    /// At most one record per non-zero count.
    #[must_use]
    pub fn findings(&self) -> Vec<NewErrorRecord> {
        let mut findings = Vec::new();
        if self.empty_count > 0 {
            findings.push(
                NewErrorRecord::new(
                    ErrorClass::QualityIssue,
                    AUDIT_SERVICE,
                    "output_quality",
                    format!(
                        "{} of {} recent briefings have an empty summary",
                        self.empty_count, self.sample_size
                    ),
                )
                .with_pattern(EMPTY_SUMMARY_PATTERN)
                .with_context(serde_json::json!({
                    "sample_size": self.sample_size,
                    "empty_count": self.empty_count,
                })),
            );
        }
        if self.short_count > 0 {
            findings.push(
                NewErrorRecord::new(
                    ErrorClass::QualityIssue,
                    AUDIT_SERVICE,
                    "output_quality",
                    format!(
                        "{} of {} recent briefings have a suspiciously short summary",
                        self.short_count, self.sample_size
                    ),
                )
                .with_pattern(SHORT_SUMMARY_PATTERN)
                .with_context(serde_json::json!({
                    "sample_size": self.sample_size,
                    "short_count": self.short_count,
                })),
            );
        }
        findings
    }
}

/// One active contact as seen by the staleness sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveContactSnapshot {
    pub contact_id: ContactId,
    #[serde(with = "time::serde::rfc3339")]
    pub last_touch_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub context_generated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StalenessSweep {
    pub active_contacts: usize,
    pub stale_count: usize,
    pub stale_contact_ids: Vec<ContactId>,
}

/// Stale when no record exists, or when the record is older than
/// `max_context_age` and the last touch is younger than the record.
#[must_use]
pub fn assess_cache_staleness(
    snapshots: &[ActiveContactSnapshot],
    now: OffsetDateTime,
    max_context_age: Duration,
) -> StalenessSweep {
    let stale_contact_ids = snapshots
        .iter()
        .filter(|snapshot| match snapshot.context_generated_at {
            None => true,
            Some(generated_at) => {
                let context_age = now - generated_at;
                let touch_age = now - snapshot.last_touch_at;
                context_age > max_context_age && touch_age < context_age
            }
        })
        .map(|snapshot| snapshot.contact_id)
        .collect::<Vec<_>>();

    StalenessSweep {
        active_contacts: snapshots.len(),
        stale_count: stale_contact_ids.len(),
        stale_contact_ids,
    }
}

impl StalenessSweep {
    #[must_use]
    pub fn finding(&self) -> Option<NewErrorRecord> {
        if self.stale_count == 0 {
            return None;
        }
        Some(
            NewErrorRecord::new(
                ErrorClass::QualityIssue,
                AUDIT_SERVICE,
                "cache_staleness",
                format!(
                    "{} of {} active contacts have a missing or stale briefing",
                    self.stale_count, self.active_contacts
                ),
            )
            .with_pattern(STALE_CONTEXT_PATTERN)
            .with_context(serde_json::json!({
                "active_contacts": self.active_contacts,
                "stale_count": self.stale_count,
            })),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffBacklog {
    pub overdue: usize,
    pub escalations: Vec<HandoffId>,
    pub stuck: Vec<HandoffId>,
}

/// Split pending handoffs older than `overdue_after` into an escalation
/// tier (high/critical) and a normal tier; the normal tier only counts
/// items older than `stuck_after`.
#[must_use]
pub fn assess_handoff_backlog(
    pending: &[Handoff],
    now: OffsetDateTime,
    overdue_after: Duration,
    stuck_after: Duration,
) -> HandoffBacklog {
    let mut backlog = HandoffBacklog::default();
    for handoff in pending {
        let age = now - handoff.created_at;
        if age <= overdue_after {
            continue;
        }
        backlog.overdue += 1;
        if handoff.urgency.is_escalation() {
            backlog.escalations.push(handoff.handoff_id);
        } else if age > stuck_after {
            backlog.stuck.push(handoff.handoff_id);
        }
    }
    backlog
}

impl HandoffBacklog {
    #[must_use]
    pub fn findings(&self) -> Vec<NewErrorRecord> {
        let mut findings = Vec::new();
        if !self.escalations.is_empty() {
            findings.push(
                NewErrorRecord::new(
                    ErrorClass::QualityIssue,
                    AUDIT_SERVICE,
                    "handoff_backlog",
                    format!(
                        "{} high-urgency handoffs pending past the response window",
                        self.escalations.len()
                    ),
                )
                .with_pattern(HANDOFF_ESCALATION_PATTERN)
                .with_context(serde_json::json!({
                    "count": self.escalations.len(),
                    "handoff_ids": self.escalations,
                })),
            );
        }
        if !self.stuck.is_empty() {
            findings.push(
                NewErrorRecord::new(
                    ErrorClass::QualityIssue,
                    AUDIT_SERVICE,
                    "handoff_backlog",
                    format!("{} handoffs stuck in pending", self.stuck.len()),
                )
                .with_pattern(HANDOFF_STUCK_PATTERN)
                .with_context(serde_json::json!({
                    "count": self.stuck.len(),
                    "handoff_ids": self.stuck,
                })),
            );
        }
        findings
    }
}
