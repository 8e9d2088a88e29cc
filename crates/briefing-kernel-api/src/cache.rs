use std::time::Duration as StdDuration;

use briefing_kernel_core::{
    assess_staleness, ContactHeader, ContactId, ContextLevel, ContextRecord, ErrorClass, Handoff,
    Interaction, NewErrorRecord, StalenessReason,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::task::JoinSet;

use crate::journal::lookback_start;
use crate::pipeline::{InteractionWindow, PIPELINE_SERVICE};
use crate::{BriefingError, BriefingKernelApi};

/// Response of a context read at one of the four levels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Briefing {
    pub level: ContextLevel,
    pub contact: ContactHeader,
    #[serde(with = "time::serde::rfc3339::option")]
    pub generated_at: Option<OffsetDateTime>,
    /// Describes the record being served, never the one it replaced.
    pub is_stale: bool,
    /// Whether this read ran the regeneration pipeline.
    pub regenerated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness: Option<StalenessReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_interactions: Option<Vec<Interaction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_handoff: Option<Handoff>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshResult {
    pub contact_id: ContactId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub previous_generated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub new_generated_at: OffsetDateTime,
    pub token_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NightlyRefreshReport {
    pub active_contacts: usize,
    pub stale_contacts: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub batches: usize,
}

impl BriefingKernelApi {
    /// Read the briefing of one contact.
    ///
    /// Level 0 returns the contact header without touching the cache. Higher
    /// levels regenerate a stale record before answering, and levels 2 and 3
    /// attach recent interactions and the latest handoff.
    ///
    /// # Errors
    /// Returns [`BriefingError::Validation`] for levels above 3,
    /// [`BriefingError::NotFound`] for unknown contacts, and any regeneration failure.
    pub async fn get_context(
        &self,
        contact_id: ContactId,
        level: u8,
        force_refresh: bool,
    ) -> Result<Briefing, BriefingError> {
        let level = ContextLevel::from_level(level)?;
        let (contact, last_touch_at, cached, live_count) = self
            .with_store(move |store| {
                let contact = store.get_contact(contact_id)?;
                let last_touch_at = store.last_touch_at(contact_id)?;
                if !level.uses_cache() {
                    return Ok((contact, last_touch_at, None, 0));
                }
                let cached = store.get_context_record(contact_id)?;
                let live_count = store.interaction_count(contact_id)?;
                Ok((contact, last_touch_at, cached, live_count))
            })
            .await?;
        let contact = contact.ok_or_else(|| BriefingError::not_found("contact", contact_id))?;
        let header = ContactHeader::from_contact(&contact, last_touch_at);

        if !level.uses_cache() {
            return Ok(Briefing {
                level,
                contact: header,
                generated_at: None,
                is_stale: false,
                regenerated: false,
                staleness: None,
                context: None,
                recent_interactions: None,
                latest_handoff: None,
            });
        }

        let staleness = assess_staleness(
            cached.as_ref(),
            live_count,
            force_refresh,
            OffsetDateTime::now_utc(),
            self.config().cache.max_age(),
        );
        let (record, regenerated) = match (staleness, cached) {
            (None, Some(record)) => (record, false),
            (reason, _) => {
                tracing::debug!(contact_id = %contact_id, ?reason, "context stale, regenerating");
                (self.regenerate(contact_id, InteractionWindow::General).await?, true)
            }
        };

        let (recent_interactions, latest_handoff) = match level.recent_interaction_limit() {
            Some(limit) => {
                let (interactions, handoff) = self
                    .with_store(move |store| {
                        Ok((
                            store.list_recent_interactions(contact_id, limit)?,
                            store.latest_handoff(contact_id)?,
                        ))
                    })
                    .await?;
                (Some(interactions), handoff)
            }
            None => (None, None),
        };

        Ok(Briefing {
            level,
            contact: header,
            generated_at: Some(record.generated_at),
            is_stale: false,
            regenerated,
            staleness,
            context: Some(record),
            recent_interactions,
            latest_handoff,
        })
    }

    /// Force a regeneration and report what it replaced and what it cost.
    ///
    /// # Errors
    /// Returns [`BriefingError::NotFound`] for unknown contacts and any regeneration failure.
    pub async fn refresh_context(&self, contact_id: ContactId) -> Result<RefreshResult, BriefingError> {
        let previous = self
            .with_store(move |store| store.get_context_record(contact_id))
            .await?
            .map(|record| record.generated_at);
        let record = self.regenerate(contact_id, InteractionWindow::General).await?;
        Ok(RefreshResult {
            contact_id,
            previous_generated_at: previous,
            new_generated_at: record.generated_at,
            token_count: record.token_count,
        })
    }

    /// Regenerate stale briefings of recently active contacts in paced batches.
    ///
    /// Per-contact failures are journaled by the pipeline and the sweep continues.
    ///
    /// # Errors
    /// Returns store errors raised while selecting candidates.
    pub async fn nightly_refresh(&self) -> Result<NightlyRefreshReport, BriefingError> {
        let scheduler = &self.config().scheduler;
        let now = OffsetDateTime::now_utc();
        let since = lookback_start(
            now,
            Duration::days(i64::from(scheduler.nightly_lookback_days)),
            "scheduler.nightly_lookback_days",
        )?;
        let max_age = self.config().cache.max_age();

        let (active_contacts, stale) = self
            .with_store(move |store| {
                let snapshots = store.active_contact_snapshots(since)?;
                let mut stale = Vec::new();
                for snapshot in &snapshots {
                    let record = store.get_context_record(snapshot.contact_id)?;
                    let live_count = store.interaction_count(snapshot.contact_id)?;
                    if assess_staleness(record.as_ref(), live_count, false, now, max_age).is_some() {
                        stale.push(snapshot.contact_id);
                    }
                }
                Ok((snapshots.len(), stale))
            })
            .await?;

        let mut report = NightlyRefreshReport {
            active_contacts,
            stale_contacts: stale.len(),
            ..NightlyRefreshReport::default()
        };
        let delay = StdDuration::from_secs(scheduler.nightly_batch_delay_secs);
        for (index, batch) in stale.chunks(scheduler.nightly_batch_size.max(1)).enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            report.batches += 1;

            let mut tasks = JoinSet::new();
            for contact_id in batch.iter().copied() {
                let api = self.clone();
                tasks.spawn(async move { api.regenerate(contact_id, InteractionWindow::General).await });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(_)) => report.refreshed += 1,
                    Ok(Err(_)) => report.failed += 1,
                    Err(err) => {
                        report.failed += 1;
                        self.log_error(NewErrorRecord::new(
                            ErrorClass::Operational,
                            PIPELINE_SERVICE,
                            "nightly_refresh",
                            format!("regeneration task aborted: {err}"),
                        ))
                        .await;
                    }
                }
            }
        }

        tracing::info!(
            active = report.active_contacts,
            stale = report.stale_contacts,
            refreshed = report.refreshed,
            failed = report.failed,
            "nightly refresh finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use briefing_kernel_core::{InteractionDirection, NewContact};

    use super::*;
    use crate::contacts::LogInteractionRequest;
    use crate::summarizer::SummarizerError;
    use crate::testing::{test_api, ScriptedSummarizer};

    fn contact(email: &str) -> NewContact {
        NewContact {
            email: email.to_string(),
            name: "Sam Ortiz".to_string(),
            company: None,
            role: Some("Buyer".to_string()),
            status: None,
            notes: None,
        }
    }

    fn summarized(summary: &str) -> LogInteractionRequest {
        LogInteractionRequest {
            channel: "email".to_string(),
            direction: InteractionDirection::Inbound,
            raw_content: None,
            summary: Some(summary.to_string()),
            key_points: Vec::new(),
            sentiment: None,
            intent: None,
            occurred_at: None,
        }
    }

    // Test IDs: TCACHE-001
    #[tokio::test]
    async fn level_zero_never_regenerates() -> Result<()> {
        let (api, summarizer) = test_api(ScriptedSummarizer::default());
        let created = api.upsert_contact(contact("sam@example.com")).await?;

        let briefing = api.get_context(created.contact_id, 0, true).await?;
        assert_eq!(briefing.level, ContextLevel::Header);
        assert!(briefing.generated_at.is_none());
        assert!(!briefing.is_stale);
        assert!(briefing.context.is_none());
        assert_eq!(summarizer.calls(), 0);
        Ok(())
    }

    // Test IDs: TCACHE-002
    #[tokio::test]
    async fn fresh_record_with_matching_count_is_served_from_cache() -> Result<()> {
        let (api, summarizer) = test_api(ScriptedSummarizer::default());
        let created = api.upsert_contact(contact("sam@example.com")).await?;
        api.log_interaction(created.contact_id, summarized("Intro call")).await?;

        let first = api.get_context(created.contact_id, 1, false).await?;
        assert!(first.regenerated);
        assert_eq!(first.staleness, Some(StalenessReason::Missing));

        let second = api.get_context(created.contact_id, 1, false).await?;
        assert!(!second.regenerated);
        assert!(!second.is_stale);
        assert_eq!(second.generated_at, first.generated_at);
        assert_eq!(summarizer.calls(), 1);
        Ok(())
    }

    // Test IDs: TCACHE-003
    #[tokio::test]
    async fn interaction_drift_triggers_regeneration() -> Result<()> {
        let (api, summarizer) = test_api(ScriptedSummarizer::default());
        let created = api.upsert_contact(contact("sam@example.com")).await?;
        api.get_context(created.contact_id, 1, false).await?;

        api.log_interaction(created.contact_id, summarized("Follow-up")).await?;
        let briefing = api.get_context(created.contact_id, 1, false).await?;
        assert!(briefing.regenerated);
        assert_eq!(
            briefing.staleness,
            Some(StalenessReason::InteractionDrift { stored: 0, live: 1 })
        );
        assert_eq!(briefing.context.map(|record| record.interaction_count), Some(1));
        assert_eq!(summarizer.calls(), 2);
        Ok(())
    }

    // Test IDs: TCACHE-004
    #[tokio::test]
    async fn failed_regeneration_propagates_and_is_journaled() -> Result<()> {
        let summarizer = ScriptedSummarizer::default();
        summarizer.push_error(SummarizerError::Http { status: 500, body: "overloaded".to_string() });
        let (api, _summarizer) = test_api(summarizer);
        let created = api.upsert_contact(contact("sam@example.com")).await?;

        let result = api.get_context(created.contact_id, 2, false).await;
        assert!(matches!(result, Err(BriefingError::Summarizer { .. })));
        assert_eq!(api.error_summary(1).await?.total, 1);
        Ok(())
    }

    // Test IDs: TCACHE-005
    #[tokio::test]
    async fn refresh_reports_previous_and_new_generation() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        let created = api.upsert_contact(contact("sam@example.com")).await?;

        let first = api.refresh_context(created.contact_id).await?;
        assert!(first.previous_generated_at.is_none());
        let second = api.refresh_context(created.contact_id).await?;
        assert_eq!(second.previous_generated_at, Some(first.new_generated_at));
        assert!(second.new_generated_at >= first.new_generated_at);
        assert_eq!(second.token_count, 520);
        Ok(())
    }

    // Test IDs: TCACHE-006
    #[tokio::test]
    async fn invalid_level_and_unknown_contact_are_rejected() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        let created = api.upsert_contact(contact("sam@example.com")).await?;
        assert!(matches!(
            api.get_context(created.contact_id, 4, false).await,
            Err(BriefingError::Validation(_))
        ));
        assert!(matches!(
            api.get_context(ContactId::new(), 1, false).await,
            Err(BriefingError::NotFound { .. })
        ));
        Ok(())
    }

    // Test IDs: TCACHE-007
    #[tokio::test]
    async fn nightly_refresh_regenerates_only_stale_active_contacts() -> Result<()> {
        let (api, summarizer) = test_api(ScriptedSummarizer::default());
        let fresh = api.upsert_contact(contact("fresh@example.com")).await?;
        let stale = api.upsert_contact(contact("stale@example.com")).await?;
        let idle = api.upsert_contact(contact("idle@example.com")).await?;
        api.log_interaction(fresh.contact_id, summarized("Call")).await?;
        api.log_interaction(stale.contact_id, summarized("Email")).await?;
        api.get_context(fresh.contact_id, 1, false).await?;
        assert_eq!(summarizer.calls(), 1);

        let report = api.nightly_refresh().await?;
        assert_eq!(report.active_contacts, 2);
        assert_eq!(report.stale_contacts, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(summarizer.calls(), 2);

        let idle_briefing = api.get_context(idle.contact_id, 0, false).await?;
        assert!(idle_briefing.contact.last_touch_at.is_none());
        Ok(())
    }
}
