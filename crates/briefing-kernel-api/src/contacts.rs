use briefing_kernel_core::{
    Contact, ContactId, ContactUpdate, Handoff, HandoffId, HandoffStatus, Interaction,
    InteractionDirection, InteractionId, NewContact, Urgency,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::pipeline::InteractionWindow;
use crate::{BriefingError, BriefingKernelApi};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogInteractionRequest {
    pub channel: String,
    pub direction: InteractionDirection,
    #[serde(default)]
    pub raw_content: Option<String>,
    /// When absent, `raw_content` is digested by the summarizer.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateHandoffRequest {
    pub contact_id: ContactId,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    #[serde(default = "default_urgency")]
    pub urgency: Urgency,
}

fn default_urgency() -> Urgency {
    Urgency::Normal
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

impl BriefingKernelApi {
    /// # Errors
    /// Returns [`BriefingError::Validation`] for a blank name or malformed email.
    pub async fn upsert_contact(&self, contact: NewContact) -> Result<Contact, BriefingError> {
        contact.validate()?;
        self.with_store(move |store| store.upsert_contact_by_email(&contact, OffsetDateTime::now_utc()))
            .await
    }

    /// # Errors
    /// Returns [`BriefingError::NotFound`] when the contact does not exist.
    pub async fn get_contact(&self, contact_id: ContactId) -> Result<Contact, BriefingError> {
        self.with_store(move |store| store.get_contact(contact_id))
            .await?
            .ok_or_else(|| BriefingError::not_found("contact", contact_id))
    }

    /// # Errors
    /// Returns [`BriefingError::Validation`] for an empty update and
    /// [`BriefingError::NotFound`] when the contact does not exist.
    pub async fn update_contact(
        &self,
        contact_id: ContactId,
        update: ContactUpdate,
    ) -> Result<Contact, BriefingError> {
        if update.is_empty() {
            return Err(BriefingError::Validation("update MUST change at least one field".to_string()));
        }
        self.with_store(move |store| store.update_contact(contact_id, &update, OffsetDateTime::now_utc()))
            .await?
            .ok_or_else(|| BriefingError::not_found("contact", contact_id))
    }

    /// Append one interaction, digesting raw content first when no summary is supplied.
    ///
    /// A failed digest is journaled and returned; nothing is stored.
    ///
    /// # Errors
    /// Returns [`BriefingError::Validation`] when neither summary nor raw content
    /// is present, [`BriefingError::NotFound`] for unknown contacts, and digest failures.
    pub async fn log_interaction(
        &self,
        contact_id: ContactId,
        request: LogInteractionRequest,
    ) -> Result<Interaction, BriefingError> {
        if request.channel.trim().is_empty() {
            return Err(BriefingError::Validation("channel MUST be provided".to_string()));
        }
        self.get_contact(contact_id).await?;

        let now = OffsetDateTime::now_utc();
        let mut interaction = Interaction {
            interaction_id: InteractionId::new(),
            contact_id,
            channel: request.channel.trim().to_string(),
            direction: request.direction,
            raw_content: request.raw_content.clone(),
            summary: non_blank(request.summary.as_deref()).map(str::to_string),
            key_points: request.key_points,
            sentiment: request.sentiment,
            intent: request.intent,
            occurred_at: request.occurred_at.unwrap_or(now),
            created_at: now,
        };

        let usage = if interaction.summary.is_some() {
            None
        } else {
            let Some(raw) = non_blank(request.raw_content.as_deref()) else {
                return Err(BriefingError::Validation(
                    "summary or raw_content MUST be provided".to_string(),
                ));
            };
            let (digest, usage) = self
                .digest_interaction(contact_id, &interaction.channel, interaction.direction, raw)
                .await?;
            interaction.summary = Some(digest.summary);
            interaction.key_points = digest.key_points;
            interaction.sentiment = Some(digest.sentiment);
            interaction.intent = Some(digest.intent);
            Some(usage)
        };

        self.with_store(move |store| {
            store.save_interaction(&interaction, usage.as_ref())?;
            Ok(interaction)
        })
        .await
    }

    /// Record a pending handoff and refresh the contact's briefing in the background.
    ///
    /// # Errors
    /// Returns [`BriefingError::Validation`] for blank agents or reason and
    /// [`BriefingError::NotFound`] for unknown contacts.
    pub async fn create_handoff(&self, request: CreateHandoffRequest) -> Result<Handoff, BriefingError> {
        let (handoff, _refresh) = self.create_handoff_tracked(request).await?;
        Ok(handoff)
    }

    /// Like [`Self::create_handoff`], also returning the background refresh
    /// task so short-lived callers can wait for it.
    ///
    /// # Errors
    /// Same as [`Self::create_handoff`].
    pub async fn create_handoff_tracked(
        &self,
        request: CreateHandoffRequest,
    ) -> Result<(Handoff, JoinHandle<()>), BriefingError> {
        for (field, value) in [
            ("from_agent", &request.from_agent),
            ("to_agent", &request.to_agent),
            ("reason", &request.reason),
        ] {
            if value.trim().is_empty() {
                return Err(BriefingError::Validation(format!("{field} MUST be provided")));
            }
        }
        self.get_contact(request.contact_id).await?;

        let now = OffsetDateTime::now_utc();
        let handoff = Handoff {
            handoff_id: HandoffId::new(),
            contact_id: request.contact_id,
            from_agent: request.from_agent.trim().to_string(),
            to_agent: request.to_agent.trim().to_string(),
            reason: request.reason.trim().to_string(),
            urgency: request.urgency,
            status: HandoffStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let stored = handoff.clone();
        self.with_store(move |store| store.insert_handoff(&stored)).await?;
        tracing::info!(
            handoff_id = %handoff.handoff_id,
            contact_id = %handoff.contact_id,
            urgency = handoff.urgency.as_str(),
            "handoff created"
        );

        let refresh = self.spawn_detached_refresh(handoff.contact_id, InteractionWindow::Handoff);
        Ok((handoff, refresh))
    }

    /// Regenerate on a separate task. The caller does not observe the outcome;
    /// failures are journaled by the pipeline.
    pub fn spawn_detached_refresh(
        &self,
        contact_id: ContactId,
        window: InteractionWindow,
    ) -> JoinHandle<()> {
        let api = self.clone();
        tokio::spawn(async move {
            if let Err(error) = api.regenerate(contact_id, window).await {
                tracing::warn!(%error, contact_id = %contact_id, "detached refresh failed");
            }
        })
    }

    /// # Errors
    /// Returns [`BriefingError::NotFound`] when the handoff does not exist.
    pub async fn update_handoff_status(
        &self,
        handoff_id: HandoffId,
        status: HandoffStatus,
    ) -> Result<Handoff, BriefingError> {
        self.with_store(move |store| {
            store.update_handoff_status(handoff_id, status, OffsetDateTime::now_utc())
        })
        .await?
        .ok_or_else(|| BriefingError::not_found("handoff", handoff_id))
    }
}
