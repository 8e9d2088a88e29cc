use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::{Contact, ContextRecord, Interaction, InteractionDirection};
use crate::{ContactId, KernelError};

const TRUNCATION_SUFFIX: &str = "\n[truncated]";

/// Structured result expected from a briefing generation call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedBriefing {
    pub summary: String,
    pub key_facts: Vec<String>,
    pub current_status: String,
    pub recommended_tone: String,
    #[serde(default)]
    pub risk_score: Option<f32>,
    #[serde(default)]
    pub opportunity_score: Option<f32>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub opportunity_factors: Vec<String>,
}

impl GeneratedBriefing {
    #[must_use]
    pub fn into_record(
        self,
        contact_id: ContactId,
        interaction_count: u32,
        generated_at: OffsetDateTime,
        token_count: u32,
    ) -> ContextRecord {
        ContextRecord {
            contact_id,
            summary: self.summary,
            key_facts: self.key_facts,
            current_status: self.current_status,
            recommended_tone: self.recommended_tone,
            risk_score: clamp_score(self.risk_score),
            opportunity_score: clamp_score(self.opportunity_score),
            risk_factors: self.risk_factors,
            opportunity_factors: self.opportunity_factors,
            interaction_count,
            generated_at,
            expires_at: None,
            token_count,
        }
    }
}

fn clamp_score(score: Option<f32>) -> f32 {
    match score {
        Some(value) if value.is_finite() => value.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// Structured result expected from an interaction digest call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionDigest {
    pub summary: String,
    pub key_points: Vec<String>,
    pub sentiment: String,
    pub intent: String,
}

fn bounded(mut prompt: String, max_chars: usize) -> String {
    if prompt.chars().count() <= max_chars {
        return prompt;
    }
    let keep = max_chars.saturating_sub(TRUNCATION_SUFFIX.len());
    if let Some((byte_index, _)) = prompt.char_indices().nth(keep) {
        prompt.truncate(byte_index);
    }
    prompt.push_str(TRUNCATION_SUFFIX);
    prompt
}

/// Prompt for a contact briefing. `interactions` must be newest first.
#[must_use]
pub fn build_briefing_prompt(
    contact: &Contact,
    interactions: &[Interaction],
    max_chars: usize,
) -> String {
    let mut prompt = String::from(
        "Produce a briefing about this business contact for another agent.\n\
         Respond with a single JSON object with keys: summary (string), key_facts (array of strings), \
         current_status (string), recommended_tone (string), risk_score (0..1), opportunity_score (0..1), \
         risk_factors (array of strings), opportunity_factors (array of strings).\n\n",
    );
    prompt.push_str(&format!("Contact: {} <{}>\n", contact.name, contact.email));
    if let Some(company) = &contact.company {
        prompt.push_str(&format!("Company: {company}\n"));
    }
    if let Some(role) = &contact.role {
        prompt.push_str(&format!("Role: {role}\n"));
    }
    prompt.push_str(&format!("Status: {}\n", contact.status));
    if let Some(notes) = &contact.notes {
        prompt.push_str(&format!("Notes: {notes}\n"));
    }

    if interactions.is_empty() {
        prompt.push_str("\nNo interactions recorded yet.\n");
    } else {
        prompt.push_str(&format!("\nRecent interactions (newest first, {}):\n", interactions.len()));
        for interaction in interactions {
            let text = interaction
                .summary
                .as_deref()
                .or(interaction.raw_content.as_deref())
                .unwrap_or("(no content)");
            prompt.push_str(&format!(
                "- {} {} via {}: {}\n",
                interaction.occurred_at.date(),
                interaction.direction.as_str(),
                interaction.channel,
                text.trim()
            ));
        }
    }

    bounded(prompt, max_chars)
}

#[must_use]
pub fn build_digest_prompt(
    channel: &str,
    direction: InteractionDirection,
    raw_content: &str,
    max_chars: usize,
) -> String {
    let mut prompt = String::from(
        "Digest this interaction with a business contact.\n\
         Respond with a single JSON object with keys: summary (string), key_points (array of strings), \
         sentiment (string), intent (string).\n\n",
    );
    prompt.push_str(&format!("Channel: {channel}\n"));
    prompt.push_str(&format!("Direction: {}\n", direction.as_str()));
    prompt.push_str("Content:\n");
    prompt.push_str(raw_content.trim());
    prompt.push('\n');
    bounded(prompt, max_chars)
}

/// The first JSON object in `text`, tolerating code fences and prose around it.
fn extract_json_object(text: &str) -> Result<&str, KernelError> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&text[start..=end]),
        _ => Err(KernelError::Parse("summarizer output contains no JSON object".to_string())),
    }
}

/// # Errors
/// Returns [`KernelError::Parse`] when the output does not carry every
/// required briefing field.
pub fn parse_generated_briefing(text: &str) -> Result<GeneratedBriefing, KernelError> {
    let raw = extract_json_object(text)?;
    serde_json::from_str::<GeneratedBriefing>(raw)
        .map_err(|err| KernelError::Parse(format!("summarizer briefing output is malformed: {err}")))
}

/// # Errors
/// Returns [`KernelError::Parse`] when the output does not carry every
/// required digest field.
pub fn parse_interaction_digest(text: &str) -> Result<InteractionDigest, KernelError> {
    let raw = extract_json_object(text)?;
    serde_json::from_str::<InteractionDigest>(raw)
        .map_err(|err| KernelError::Parse(format!("summarizer digest output is malformed: {err}")))
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::InteractionId;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_800_000_000)
    }

    fn mk_contact() -> Contact {
        Contact {
            contact_id: ContactId::new(),
            email: "dana@example.com".to_string(),
            name: "Dana Reyes".to_string(),
            company: Some("Northwind".to_string()),
            role: Some("VP Operations".to_string()),
            status: "active".to_string(),
            notes: None,
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    // Test IDs: TPRM-001
    #[test]
    fn fenced_briefing_output_parses_and_clamps_scores() -> Result<(), KernelError> {
        let text = "```json\n{\"summary\":\"Evaluating renewal\",\"key_facts\":[\"Budget set\"],\
                    \"current_status\":\"negotiating\",\"recommended_tone\":\"direct\",\"risk_score\":1.7}\n```";
        let briefing = parse_generated_briefing(text)?;
        let record = briefing.into_record(ContactId::new(), 3, fixture_time(), 800);
        assert_eq!(record.summary, "Evaluating renewal");
        assert!((record.risk_score - 1.0).abs() < f32::EPSILON);
        assert!(record.opportunity_score.abs() < f32::EPSILON);
        assert_eq!(record.interaction_count, 3);
        Ok(())
    }

    // Test IDs: TPRM-002
    #[test]
    fn output_missing_required_fields_is_rejected() {
        assert!(parse_generated_briefing("{\"summary\":\"only\"}").is_err());
        assert!(parse_generated_briefing("I could not comply.").is_err());
        assert!(parse_interaction_digest("{\"summary\":\"s\",\"key_points\":[],\"sentiment\":\"neutral\"}").is_err());
    }

    // Test IDs: TPRM-003
    #[test]
    fn digest_output_parses() -> Result<(), KernelError> {
        let digest = parse_interaction_digest(
            "Here you go: {\"summary\":\"Asked for pricing\",\"key_points\":[\"50 seats\"],\"sentiment\":\"positive\",\"intent\":\"purchase\"}",
        )?;
        assert_eq!(digest.intent, "purchase");
        assert_eq!(digest.key_points, vec!["50 seats".to_string()]);
        Ok(())
    }

    // Test IDs: TPRM-004
    #[test]
    fn prompts_are_bounded_and_list_interactions_in_given_order() {
        let contact = mk_contact();
        let interactions = (0..3)
            .map(|i| Interaction {
                interaction_id: InteractionId::new(),
                contact_id: contact.contact_id,
                channel: "email".to_string(),
                direction: InteractionDirection::Inbound,
                raw_content: None,
                summary: Some(format!("message {i}")),
                key_points: vec![],
                sentiment: None,
                intent: None,
                occurred_at: fixture_time() - Duration::hours(i),
                created_at: fixture_time(),
            })
            .collect::<Vec<_>>();

        let prompt = build_briefing_prompt(&contact, &interactions, 10_000);
        let first = prompt.find("message 0");
        let last = prompt.find("message 2");
        assert!(first.is_some() && first < last);

        let small = build_briefing_prompt(&contact, &interactions, 120);
        assert!(small.chars().count() <= 120);
        assert!(small.ends_with("[truncated]"));

        let digest = build_digest_prompt("call", InteractionDirection::Outbound, &"x".repeat(5_000), 400);
        assert!(digest.chars().count() <= 400);
    }

    // Test IDs: TPRM-005
    #[test]
    fn prompt_lines_are_newline_terminated() {
        let contact = mk_contact();
        let prompt = build_briefing_prompt(&contact, &[], 10_000);
        assert!(prompt.contains("Contact: Dana Reyes <dana@example.com>\nCompany: Northwind\nRole: VP Operations\nStatus: active\n"));
        assert!(!prompt.contains("Notes:"));
        assert!(prompt.ends_with("\nNo interactions recorded yet.\n"));

        let digest = build_digest_prompt("call", InteractionDirection::Inbound, "  hello  ", 10_000);
        assert!(digest.ends_with("Channel: call\nDirection: inbound\nContent:\nhello\n"));
    }
}
