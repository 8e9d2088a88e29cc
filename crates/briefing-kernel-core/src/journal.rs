use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ErrorId, KernelError};

/// A pattern becomes actionable at this many unresolved occurrences.
pub const RECURRING_THRESHOLD: usize = 3;
/// Patterns without a canned remedy are flagged from this count on.
pub const ESCALATION_THRESHOLD: usize = 5;

const RATE_LIMIT_MARKERS: [&str; 4] = ["rate_limit", "rate limit", "429", "too many requests"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Operational,
    ExternalDependency,
    BudgetExceeded,
    QualityIssue,
    IntegrationGap,
}

impl ErrorClass {
    pub const ALL: [Self; 5] = [
        Self::Operational,
        Self::ExternalDependency,
        Self::BudgetExceeded,
        Self::QualityIssue,
        Self::IntegrationGap,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::ExternalDependency => "external_dependency",
            Self::BudgetExceeded => "budget_exceeded",
            Self::QualityIssue => "quality_issue",
            Self::IntegrationGap => "integration_gap",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "operational" => Some(Self::Operational),
            "external_dependency" => Some(Self::ExternalDependency),
            "budget_exceeded" => Some(Self::BudgetExceeded),
            "quality_issue" => Some(Self::QualityIssue),
            "integration_gap" => Some(Self::IntegrationGap),
            _ => None,
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring heuristic over free-text summarizer failures.
#[must_use]
pub fn is_rate_limit_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewErrorRecord {
    pub error_type: ErrorClass,
    pub service: String,
    pub operation: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub pattern_id: Option<String>,
}

impl NewErrorRecord {
    #[must_use]
    pub fn new(
        error_type: ErrorClass,
        service: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            service: service.into(),
            operation: operation.into(),
            message: message.into(),
            context: None,
            pattern_id: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern_id: impl Into<String>) -> Self {
        self.pattern_id = Some(pattern_id.into());
        self
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when service, operation or message is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (field, value) in
            [("service", &self.service), ("operation", &self.operation), ("message", &self.message)]
        {
            if value.trim().is_empty() {
                return Err(KernelError::Validation(format!("{field} MUST be provided")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub error_id: ErrorId,
    pub error_type: ErrorClass,
    pub service: String,
    pub operation: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub pattern_id: Option<String>,
    pub resolution: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub auto_fixed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ErrorRecord {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    #[must_use]
    pub fn pattern_key(&self) -> PatternKey {
        PatternKey {
            error_type: self.error_type,
            service: self.service.clone(),
            operation: self.operation.clone(),
        }
    }
}

/// Grouping key of a recurring failure: `classification:service:operation`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PatternKey {
    pub error_type: ErrorClass,
    pub service: String,
    pub operation: String,
}

impl PatternKey {
    /// Parse the `classification:service:operation` form.
    ///
    /// # Errors
    /// Returns [`KernelError::Parse`] when the value is not a known class
    /// followed by two non-empty segments.
    pub fn parse(raw: &str) -> Result<Self, KernelError> {
        let mut parts = raw.splitn(3, ':');
        let (Some(class), Some(service), Some(operation)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(KernelError::Parse(format!("pattern id `{raw}` is not class:service:operation")));
        };
        let error_type = ErrorClass::parse(class)
            .ok_or_else(|| KernelError::Parse(format!("unknown error class `{class}`")))?;
        if service.is_empty() || operation.is_empty() {
            return Err(KernelError::Parse(format!("pattern id `{raw}` has empty segments")));
        }
        Ok(Self { error_type, service: service.to_string(), operation: operation.to_string() })
    }
}

impl Display for PatternKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.error_type, self.service, self.operation)
    }
}

/// Derived aggregate; recomputed every cycle and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPattern {
    pub pattern_id: String,
    pub key: PatternKey,
    pub count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub latest_message: String,
    /// True when any grouped record reads as a summarizer rate limit.
    #[serde(default)]
    pub rate_limited: bool,
}

impl ErrorPattern {
    #[must_use]
    pub fn is_recurring(&self) -> bool {
        self.count >= RECURRING_THRESHOLD
    }
}

/// Group unresolved records by `(classification, service, operation)`.
///
/// Output is ordered by count descending, then most recent first, then key.
#[must_use]
pub fn group_patterns(records: &[ErrorRecord]) -> Vec<ErrorPattern> {
    let mut groups: BTreeMap<PatternKey, ErrorPattern> = BTreeMap::new();

    for record in records.iter().filter(|record| !record.is_resolved()) {
        let key = record.pattern_key();
        match groups.get_mut(&key) {
            Some(pattern) => {
                pattern.count += 1;
                pattern.rate_limited |= is_rate_limit_message(&record.message);
                if record.created_at < pattern.first_seen {
                    pattern.first_seen = record.created_at;
                }
                if record.created_at >= pattern.last_seen {
                    pattern.last_seen = record.created_at;
                    pattern.latest_message.clone_from(&record.message);
                }
            }
            None => {
                groups.insert(
                    key.clone(),
                    ErrorPattern {
                        pattern_id: key.to_string(),
                        key,
                        count: 1,
                        first_seen: record.created_at,
                        last_seen: record.created_at,
                        latest_message: record.message.clone(),
                        rate_limited: is_rate_limit_message(&record.message),
                    },
                );
            }
        }
    }

    let mut patterns = groups.into_values().collect::<Vec<_>>();
    patterns.sort_by(|a, b| {
        b.count.cmp(&a.count).then(b.last_seen.cmp(&a.last_seen)).then(a.key.cmp(&b.key))
    });
    patterns
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSummary {
    pub window_hours: u32,
    pub total: usize,
    pub unresolved: usize,
    pub auto_fixed: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_service: BTreeMap<String, usize>,
    pub recurring_patterns: Vec<ErrorPattern>,
}

/// Summarize every record of a window, resolved or not.
#[must_use]
pub fn summarize_errors(records: &[ErrorRecord], window_hours: u32) -> ErrorSummary {
    let mut by_type = BTreeMap::new();
    let mut by_service = BTreeMap::new();
    for record in records {
        *by_type.entry(record.error_type.as_str().to_string()).or_insert(0) += 1;
        *by_service.entry(record.service.clone()).or_insert(0) += 1;
    }

    ErrorSummary {
        window_hours,
        total: records.len(),
        unresolved: records.iter().filter(|record| !record.is_resolved()).count(),
        auto_fixed: records.iter().filter(|record| record.auto_fixed).count(),
        by_type,
        by_service,
        recurring_patterns: group_patterns(records)
            .into_iter()
            .filter(ErrorPattern::is_recurring)
            .collect(),
    }
}

/// Which unresolved rows a resolution applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveScope {
    Pattern { key: PatternKey, since: Option<OffsetDateTime> },
    PatternTag(String),
    Ids(Vec<ErrorId>),
}

impl ResolveScope {
    /// A triple-shaped id resolves by key, anything else by stored tag.
    #[must_use]
    pub fn from_pattern_id(pattern_id: &str) -> Self {
        match PatternKey::parse(pattern_id) {
            Ok(key) => Self::Pattern { key, since: None },
            Err(_) => Self::PatternTag(pattern_id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_800_000_000)
    }

    fn mk_error(class: ErrorClass, operation: &str, minutes: i64, message: &str) -> ErrorRecord {
        ErrorRecord {
            error_id: ErrorId::new(),
            error_type: class,
            service: "regeneration_pipeline".to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
            context: None,
            pattern_id: None,
            resolution: None,
            resolved_at: None,
            auto_fixed: false,
            created_at: fixture_time() + Duration::minutes(minutes),
        }
    }

    // Test IDs: TPAT-001
    #[test]
    fn grouping_is_strict_on_the_triple() {
        let mut records = (0..5)
            .map(|i| mk_error(ErrorClass::ExternalDependency, "generate_context", i, "boom"))
            .collect::<Vec<_>>();
        records.push(mk_error(ErrorClass::ExternalDependency, "digest_interaction", 9, "boom"));

        let patterns = group_patterns(&records);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].count, 5);
        assert_eq!(patterns[0].key.operation, "generate_context");
        assert_eq!(patterns[1].count, 1);
    }

    // Test IDs: TPAT-002
    #[test]
    fn grouping_tracks_first_last_and_latest_message() {
        let records = vec![
            mk_error(ErrorClass::Operational, "save", 10, "middle"),
            mk_error(ErrorClass::Operational, "save", 0, "first"),
            mk_error(ErrorClass::Operational, "save", 20, "latest"),
        ];
        let patterns = group_patterns(&records);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].first_seen, fixture_time());
        assert_eq!(patterns[0].last_seen, fixture_time() + Duration::minutes(20));
        assert_eq!(patterns[0].latest_message, "latest");
        assert_eq!(patterns[0].pattern_id, "operational:regeneration_pipeline:save");
    }

    // Test IDs: TPAT-003
    #[test]
    fn resolved_records_are_ignored_by_grouping_but_counted_in_summary() {
        let mut resolved = mk_error(ErrorClass::BudgetExceeded, "generate_context", 0, "over");
        resolved.resolved_at = Some(fixture_time());
        resolved.auto_fixed = true;
        let records = vec![resolved, mk_error(ErrorClass::BudgetExceeded, "generate_context", 1, "over")];

        assert_eq!(group_patterns(&records)[0].count, 1);

        let summary = summarize_errors(&records, 24);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.auto_fixed, 1);
        assert_eq!(summary.by_type.get("budget_exceeded"), Some(&2));
        assert!(summary.recurring_patterns.is_empty());
    }

    // Test IDs: TPAT-004
    #[test]
    fn pattern_ids_parse_back_into_keys_and_fall_back_to_tags() -> Result<(), KernelError> {
        let key = PatternKey::parse("quality_issue:quality_auditor:output_quality")?;
        assert_eq!(key.error_type, ErrorClass::QualityIssue);
        assert_eq!(key.to_string(), "quality_issue:quality_auditor:output_quality");

        assert_eq!(
            ResolveScope::from_pattern_id("empty_summary"),
            ResolveScope::PatternTag("empty_summary".to_string())
        );
        Ok(())
    }

    // Test IDs: TPAT-005
    #[test]
    fn rate_limit_heuristic_matches_known_markers() {
        assert!(is_rate_limit_message("summarizer returned HTTP 429 (rate_limit_error)"));
        assert!(is_rate_limit_message("Rate limit reached for requests"));
        assert!(!is_rate_limit_message("connection reset by peer"));
    }

    // Test IDs: TPAT-006
    #[test]
    fn rate_limit_flag_survives_a_later_unrelated_message() {
        let records = vec![
            mk_error(ErrorClass::ExternalDependency, "generate_context", 0, "HTTP 429 Too Many Requests"),
            mk_error(ErrorClass::ExternalDependency, "generate_context", 5, "connection reset by peer"),
            mk_error(ErrorClass::ExternalDependency, "generate_context", 9, "connection reset by peer"),
        ];
        let patterns = group_patterns(&records);
        assert_eq!(patterns[0].latest_message, "connection reset by peer");
        assert!(patterns[0].rate_limited);

        let quiet = group_patterns(&records[1..]);
        assert!(!quiet[0].rate_limited);
    }

    proptest! {
        #[test]
        fn property_grouping_conserves_unresolved_counts(ops in proptest::collection::vec(0_u8..4, 0..60)) {
            let records = ops
                .iter()
                .enumerate()
                .map(|(index, op)| {
                    let minutes = i64::try_from(index).unwrap_or(0);
                    mk_error(ErrorClass::Operational, &format!("op_{op}"), minutes, "x")
                })
                .collect::<Vec<_>>();
            let patterns = group_patterns(&records);
            let total: usize = patterns.iter().map(|pattern| pattern.count).sum();
            prop_assert_eq!(total, records.len());
            prop_assert!(patterns.windows(2).all(|pair| pair[0].count >= pair[1].count));
        }
    }
}
