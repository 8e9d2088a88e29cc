use briefing_kernel_core::{
    group_patterns, summarize_errors, ErrorId, ErrorPattern, ErrorSummary, NewErrorRecord,
    ResolveScope,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{BriefingError, BriefingKernelApi};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<ErrorId>,
    pub resolution: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveResult {
    pub count_resolved: usize,
}

/// Longest journal window accepted, in hours (one year).
pub const MAX_WINDOW_HOURS: u32 = 8760;

/// `now - span`, or a validation error when that instant is out of range.
pub(crate) fn lookback_start(
    now: OffsetDateTime,
    span: Duration,
    field: &str,
) -> Result<OffsetDateTime, BriefingError> {
    now.checked_sub(span).ok_or_else(|| {
        BriefingError::Validation(format!("{field} reaches outside the supported date range"))
    })
}

pub(crate) fn window_start(window_hours: u32) -> Result<OffsetDateTime, BriefingError> {
    if window_hours == 0 || window_hours > MAX_WINDOW_HOURS {
        return Err(BriefingError::Validation(format!(
            "window_hours MUST be between 1 and {MAX_WINDOW_HOURS}, got {window_hours}"
        )));
    }
    lookback_start(OffsetDateTime::now_utc(), Duration::hours(i64::from(window_hours)), "window_hours")
}

impl BriefingKernelApi {
    /// Append one error record. Never fails: a write failure only reaches
    /// local diagnostics.
    pub async fn log_error(&self, entry: NewErrorRecord) -> Option<ErrorId> {
        let service = entry.service.clone();
        let operation = entry.operation.clone();
        let result = self
            .with_store(move |store| store.insert_error(&entry, OffsetDateTime::now_utc()))
            .await;
        match result {
            Ok(error_id) => Some(error_id),
            Err(error) => {
                tracing::warn!(%error, service, operation, "failed to journal error record");
                None
            }
        }
    }

    /// Caller-reported error, e.g. an integration gap. Unlike [`Self::log_error`]
    /// the write outcome is returned.
    ///
    /// # Errors
    /// Returns [`BriefingError::Validation`] for blank fields and store errors on write failure.
    pub async fn report_error(&self, entry: NewErrorRecord) -> Result<ErrorId, BriefingError> {
        entry.validate()?;
        self.with_store(move |store| store.insert_error(&entry, OffsetDateTime::now_utc())).await
    }

    /// # Errors
    /// Returns [`BriefingError::Validation`] for a window outside `1..=MAX_WINDOW_HOURS`
    /// and store errors on read failure.
    pub async fn error_summary(&self, window_hours: u32) -> Result<ErrorSummary, BriefingError> {
        let since = window_start(window_hours)?;
        let records = self.with_store(move |store| store.list_errors_since(since)).await?;
        Ok(summarize_errors(&records, window_hours))
    }

    /// Unresolved records within the window grouped by
    /// `(classification, service, operation)`, largest group first.
    ///
    /// # Errors
    /// Returns [`BriefingError::Validation`] for a window outside `1..=MAX_WINDOW_HOURS`
    /// and store errors on read failure.
    pub async fn error_patterns(&self, window_hours: u32) -> Result<Vec<ErrorPattern>, BriefingError> {
        let since = window_start(window_hours)?;
        let records = self.with_store(move |store| store.list_unresolved_errors_since(since)).await?;
        Ok(group_patterns(&records))
    }

    /// Resolve open records by pattern id or by explicit ids. Already-resolved
    /// rows are left untouched, so repeating a request resolves nothing.
    ///
    /// # Errors
    /// Returns [`BriefingError::Validation`] unless exactly one of `pattern_id`
    /// and `ids` is given with a non-blank resolution.
    pub async fn resolve_errors(&self, request: ResolveRequest) -> Result<ResolveResult, BriefingError> {
        if request.resolution.trim().is_empty() {
            return Err(BriefingError::Validation("resolution MUST be provided".to_string()));
        }
        let scope = match (request.pattern_id.as_deref(), request.ids.is_empty()) {
            (Some(pattern_id), true) if !pattern_id.trim().is_empty() => {
                ResolveScope::from_pattern_id(pattern_id.trim())
            }
            (None, false) => ResolveScope::Ids(request.ids),
            _ => {
                return Err(BriefingError::Validation(
                    "exactly one of pattern_id or ids MUST be provided".to_string(),
                ))
            }
        };
        let resolution = request.resolution;
        let count_resolved = self
            .with_store(move |store| {
                store.resolve_errors(&scope, &resolution, false, OffsetDateTime::now_utc())
            })
            .await?;
        tracing::info!(count_resolved, "resolved error records");
        Ok(ResolveResult { count_resolved })
    }
}
