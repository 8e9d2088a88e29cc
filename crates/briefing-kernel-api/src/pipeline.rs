use briefing_kernel_core::{
    build_briefing_prompt, build_digest_prompt, is_rate_limit_message, parse_generated_briefing,
    parse_interaction_digest, ContactId, ContextRecord, ErrorClass, InteractionDigest,
    InteractionDirection, NewErrorRecord, UsageEntry, UsageEntryId,
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};

use crate::summarizer::{Completion, SummarizeRequest};
use crate::{BriefingError, BriefingKernelApi};

pub const PIPELINE_SERVICE: &str = "regeneration_pipeline";
pub(crate) const GENERATE_OPERATION: &str = "generate_context";
pub(crate) const DIGEST_OPERATION: &str = "digest_interaction";

/// How many recent interactions feed a regeneration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionWindow {
    General,
    /// Narrower window used when a handoff triggers the refresh.
    Handoff,
}

impl InteractionWindow {
    fn size(self, api: &BriefingKernelApi) -> usize {
        match self {
            Self::General => api.config().pipeline.general_window,
            Self::Handoff => api.config().pipeline.handoff_window,
        }
    }
}

impl BriefingKernelApi {
    /// Regenerate and persist the context record of one contact.
    ///
    /// Failures are journaled (best-effort) and returned to the caller.
    ///
    /// # Errors
    /// Returns [`BriefingError::NotFound`] for unknown contacts,
    /// [`BriefingError::BudgetExceeded`] when the agent's daily budget is spent,
    /// [`BriefingError::Summarizer`] when the call fails or its output does not parse,
    /// and store errors when persistence fails.
    pub async fn regenerate(
        &self,
        contact_id: ContactId,
        window: InteractionWindow,
    ) -> Result<ContextRecord, BriefingError> {
        let result = self.regenerate_inner(contact_id, window).await;
        if let Err(err) = &result {
            self.journal_pipeline_failure(GENERATE_OPERATION, Some(contact_id), err).await;
        }
        result
    }

    async fn regenerate_inner(
        &self,
        contact_id: ContactId,
        window: InteractionWindow,
    ) -> Result<ContextRecord, BriefingError> {
        let limit = window.size(self);
        let (contact, interactions, interaction_count) = self
            .with_store(move |store| {
                let contact = store.get_contact(contact_id)?;
                let interactions = store.list_recent_interactions(contact_id, limit)?;
                let count = store.interaction_count(contact_id)?;
                Ok((contact, interactions, count))
            })
            .await?;
        let contact = contact.ok_or_else(|| BriefingError::not_found("contact", contact_id))?;

        let pipeline = &self.config().pipeline;
        let agent = pipeline.regeneration_agent.clone();
        self.enforce_budget(&agent).await?;

        let prompt = build_briefing_prompt(&contact, &interactions, pipeline.max_prompt_chars);
        let completion = self.summarize(GENERATE_OPERATION, prompt).await?;
        let now = OffsetDateTime::now_utc();
        let usage = self.usage_entry(&agent, GENERATE_OPERATION, &completion, Some(contact_id), now);

        let briefing = match parse_generated_briefing(&completion.text) {
            Ok(briefing) => briefing,
            Err(err) => {
                self.with_store(move |store| store.record_usage(&usage)).await?;
                return Err(BriefingError::Summarizer {
                    classification: ErrorClass::ExternalDependency,
                    message: err.to_string(),
                });
            }
        };

        let token_count = completion.input_tokens.saturating_add(completion.output_tokens);
        let record = briefing.into_record(contact_id, interaction_count, now, token_count);
        tracing::info!(
            contact_id = %contact_id,
            interaction_count,
            token_count,
            ?window,
            "regenerated context"
        );
        self.with_store(move |store| {
            store.save_regeneration(&record, &usage)?;
            Ok(record)
        })
        .await
    }

    /// Summarize one raw interaction into the digest shape.
    ///
    /// The returned usage entry is not yet persisted; the caller stores it
    /// with the interaction. Usage of a call whose output does not parse is
    /// recorded here.
    pub(crate) async fn digest_interaction(
        &self,
        contact_id: ContactId,
        channel: &str,
        direction: InteractionDirection,
        raw_content: &str,
    ) -> Result<(InteractionDigest, UsageEntry), BriefingError> {
        let result = self.digest_inner(contact_id, channel, direction, raw_content).await;
        if let Err(err) = &result {
            self.journal_pipeline_failure(DIGEST_OPERATION, Some(contact_id), err).await;
        }
        result
    }

    async fn digest_inner(
        &self,
        contact_id: ContactId,
        channel: &str,
        direction: InteractionDirection,
        raw_content: &str,
    ) -> Result<(InteractionDigest, UsageEntry), BriefingError> {
        let pipeline = &self.config().pipeline;
        let agent = pipeline.digest_agent.clone();
        self.enforce_budget(&agent).await?;

        let prompt = build_digest_prompt(channel, direction, raw_content, pipeline.max_prompt_chars);
        let completion = self.summarize(DIGEST_OPERATION, prompt).await?;
        let usage = self.usage_entry(
            &agent,
            DIGEST_OPERATION,
            &completion,
            Some(contact_id),
            OffsetDateTime::now_utc(),
        );
        match parse_interaction_digest(&completion.text) {
            Ok(digest) => Ok((digest, usage)),
            Err(err) => {
                self.with_store(move |store| store.record_usage(&usage)).await?;
                Err(BriefingError::Summarizer {
                    classification: ErrorClass::ExternalDependency,
                    message: err.to_string(),
                })
            }
        }
    }

    async fn summarize(
        &self,
        operation: &str,
        prompt: String,
    ) -> Result<Completion, BriefingError> {
        let request = SummarizeRequest {
            operation: operation.to_string(),
            prompt,
            max_tokens: self.config().pipeline.max_output_tokens,
        };
        self.summarizer().complete(request).await.map_err(|err| BriefingError::Summarizer {
            classification: ErrorClass::ExternalDependency,
            message: err.to_string(),
        })
    }

    /// Refuse the call when `agent` has spent its daily allotment (UTC day).
    async fn enforce_budget(&self, agent: &str) -> Result<(), BriefingError> {
        let Some(budget) = self.config().budget_for(agent) else {
            return Ok(());
        };
        let day_start = OffsetDateTime::now_utc().replace_time(Time::MIDNIGHT);
        let owned_agent = agent.to_string();
        let used = self
            .with_store(move |store| store.tokens_used_since(&owned_agent, day_start))
            .await?;
        if used >= budget {
            return Err(BriefingError::BudgetExceeded { agent: agent.to_string(), used, budget });
        }
        Ok(())
    }

    fn usage_entry(
        &self,
        agent: &str,
        operation: &str,
        completion: &Completion,
        contact_id: Option<ContactId>,
        now: OffsetDateTime,
    ) -> UsageEntry {
        UsageEntry {
            entry_id: UsageEntryId::new(),
            agent: agent.to_string(),
            model: completion.model.clone(),
            operation: operation.to_string(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost_usd: self
                .config()
                .pricing
                .cost_usd(completion.input_tokens, completion.output_tokens),
            contact_id,
            created_at: now,
        }
    }

    /// Not-found and validation failures are caller errors and stay out of the journal.
    async fn journal_pipeline_failure(
        &self,
        operation: &'static str,
        contact_id: Option<ContactId>,
        err: &BriefingError,
    ) {
        let entry = match err {
            BriefingError::NotFound { .. } | BriefingError::Validation(_) => return,
            BriefingError::Summarizer { classification, message } => NewErrorRecord::new(
                *classification,
                PIPELINE_SERVICE,
                operation,
                message.clone(),
            )
            .with_context(serde_json::json!({
                "contact_id": contact_id,
                "rate_limited": is_rate_limit_message(message),
            })),
            BriefingError::BudgetExceeded { agent, used, budget } => NewErrorRecord::new(
                ErrorClass::BudgetExceeded,
                PIPELINE_SERVICE,
                operation,
                err.to_string(),
            )
            .with_context(serde_json::json!({
                "agent": agent,
                "used": used,
                "budget": budget,
                "contact_id": contact_id,
            })),
            BriefingError::Aborted(_) | BriefingError::Store(_) => NewErrorRecord::new(
                ErrorClass::Operational,
                PIPELINE_SERVICE,
                operation,
                err.to_string(),
            )
            .with_context(serde_json::json!({ "contact_id": contact_id })),
        };
        tracing::warn!(operation, contact_id = ?contact_id, error = %err, "regeneration pipeline failure");
        self.log_error(entry).await;
    }
}
