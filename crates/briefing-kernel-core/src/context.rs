use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{ContactId, HandoffId, InteractionId, KernelError, UsageEntryId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub contact_id: ContactId,
    pub email: String,
    pub name: String,
    pub company: Option<String>,
    pub role: Option<String>,
    pub status: String,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewContact {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewContact {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the email or name is blank or
    /// the email has no `@`.
    pub fn validate(&self) -> Result<(), KernelError> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(KernelError::Validation(
                "email MUST be a non-empty address".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(KernelError::Validation("name MUST be provided".to_string()));
        }
        Ok(())
    }
}

/// Partial update; `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ContactUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.company.is_none()
            && self.role.is_none()
            && self.status.is_none()
            && self.notes.is_none()
    }
}

/// Level-0 projection: contact identity only, never backed by the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactHeader {
    pub contact_id: ContactId,
    pub name: String,
    pub email: String,
    pub company: Option<String>,
    pub role: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_touch_at: Option<OffsetDateTime>,
}

impl ContactHeader {
    #[must_use]
    pub fn from_contact(contact: &Contact, last_touch_at: Option<OffsetDateTime>) -> Self {
        Self {
            contact_id: contact.contact_id,
            name: contact.name.clone(),
            email: contact.email.clone(),
            company: contact.company.clone(),
            role: contact.role.clone(),
            status: contact.status.clone(),
            last_touch_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionDirection {
    Inbound,
    Outbound,
    Internal,
}

impl InteractionDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub interaction_id: InteractionId,
    pub contact_id: ContactId,
    pub channel: String,
    pub direction: InteractionDirection,
    pub raw_content: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub sentiment: Option<String>,
    pub intent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The cached per-contact briefing. One per contact; replaced wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextRecord {
    pub contact_id: ContactId,
    pub summary: String,
    pub key_facts: Vec<String>,
    pub current_status: String,
    pub recommended_tone: String,
    pub risk_score: f32,
    pub opportunity_score: f32,
    pub risk_factors: Vec<String>,
    pub opportunity_factors: Vec<String>,
    pub interaction_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub token_count: u32,
}

impl ContextRecord {
    #[must_use]
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.generated_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    Header,
    Briefing,
    Recent,
    Full,
}

impl ContextLevel {
    /// # Errors
    /// Returns [`KernelError::Validation`] for levels outside `0..=3`.
    pub fn from_level(level: u8) -> Result<Self, KernelError> {
        match level {
            0 => Ok(Self::Header),
            1 => Ok(Self::Briefing),
            2 => Ok(Self::Recent),
            3 => Ok(Self::Full),
            other => Err(KernelError::Validation(format!(
                "context level MUST be in 0..=3, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Header => 0,
            Self::Briefing => 1,
            Self::Recent => 2,
            Self::Full => 3,
        }
    }

    #[must_use]
    pub fn uses_cache(self) -> bool {
        self != Self::Header
    }

    /// How many recent interactions the level attaches, if any.
    #[must_use]
    pub fn recent_interaction_limit(self) -> Option<usize> {
        match self {
            Self::Header | Self::Briefing => None,
            Self::Recent => Some(10),
            Self::Full => Some(50),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StalenessReason {
    Missing,
    Forced,
    InteractionDrift { stored: u32, live: u32 },
    Expired { age_seconds: i64 },
}

/// Decide whether a cached record may be served as-is.
///
/// Checks run in a fixed order so the reported reason is deterministic:
/// missing, forced, interaction-count drift, then age.
#[must_use]
pub fn assess_staleness(
    record: Option<&ContextRecord>,
    live_interaction_count: u32,
    force_refresh: bool,
    now: OffsetDateTime,
    max_age: Duration,
) -> Option<StalenessReason> {
    let Some(record) = record else {
        return Some(StalenessReason::Missing);
    };
    if force_refresh {
        return Some(StalenessReason::Forced);
    }
    if record.interaction_count != live_interaction_count {
        return Some(StalenessReason::InteractionDrift {
            stored: record.interaction_count,
            live: live_interaction_count,
        });
    }
    let age = record.age(now);
    if age > max_age {
        return Some(StalenessReason::Expired { age_seconds: age.whole_seconds() });
    }
    None
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl Urgency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_escalation(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    Completed,
    Cancelled,
}

impl HandoffStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handoff {
    pub handoff_id: HandoffId,
    pub contact_id: ContactId,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub urgency: Urgency,
    pub status: HandoffStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One row of the token-usage ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEntry {
    pub entry_id: UsageEntryId,
    pub agent: String,
    pub model: String,
    pub operation: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub contact_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UsageEntry {
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_800_000_000)
    }

    fn mk_record(interaction_count: u32, generated_at: OffsetDateTime) -> ContextRecord {
        ContextRecord {
            contact_id: ContactId::new(),
            summary: "Renewal conversation in progress".to_string(),
            key_facts: vec!["Budget approved for Q3".to_string()],
            current_status: "negotiating".to_string(),
            recommended_tone: "consultative".to_string(),
            risk_score: 0.2,
            opportunity_score: 0.7,
            risk_factors: vec![],
            opportunity_factors: vec![],
            interaction_count,
            generated_at,
            expires_at: None,
            token_count: 900,
        }
    }

    // Test IDs: TCTX-001
    #[test]
    fn fresh_record_with_matching_count_is_not_stale() {
        let now = fixture_time();
        let record = mk_record(4, now - Duration::hours(23));
        assert_eq!(assess_staleness(Some(&record), 4, false, now, Duration::hours(24)), None);
    }

    // Test IDs: TCTX-002
    #[test]
    fn count_drift_is_stale_even_at_age_zero() {
        let now = fixture_time();
        let record = mk_record(4, now);
        assert_eq!(
            assess_staleness(Some(&record), 5, false, now, Duration::hours(24)),
            Some(StalenessReason::InteractionDrift { stored: 4, live: 5 })
        );
    }

    // Test IDs: TCTX-003
    #[test]
    fn missing_forced_and_expired_records_are_stale() {
        let now = fixture_time();
        assert_eq!(
            assess_staleness(None, 0, false, now, Duration::hours(24)),
            Some(StalenessReason::Missing)
        );

        let record = mk_record(1, now);
        assert_eq!(
            assess_staleness(Some(&record), 1, true, now, Duration::hours(24)),
            Some(StalenessReason::Forced)
        );

        let old = mk_record(1, now - Duration::hours(25));
        assert_eq!(
            assess_staleness(Some(&old), 1, false, now, Duration::hours(24)),
            Some(StalenessReason::Expired { age_seconds: 25 * 3600 })
        );
    }

    // Test IDs: TCTX-004
    #[test]
    fn context_levels_map_to_interaction_limits() {
        assert_eq!(ContextLevel::Header.recent_interaction_limit(), None);
        assert_eq!(ContextLevel::Briefing.recent_interaction_limit(), None);
        assert_eq!(ContextLevel::Recent.recent_interaction_limit(), Some(10));
        assert_eq!(ContextLevel::Full.recent_interaction_limit(), Some(50));
        assert!(!ContextLevel::Header.uses_cache());
        assert!(ContextLevel::from_level(4).is_err());
    }

    // Test IDs: TCTX-005
    #[test]
    fn new_contact_validation_requires_address_and_name() {
        let mut contact = NewContact {
            email: "dana@example.com".to_string(),
            name: "Dana".to_string(),
            company: None,
            role: None,
            status: None,
            notes: None,
        };
        assert!(contact.validate().is_ok());

        contact.email = "no-at-sign".to_string();
        assert!(contact.validate().is_err());
    }
}
