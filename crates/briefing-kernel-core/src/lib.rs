//! Domain model for the contact briefing kernel.
//!
//! Everything in this crate is pure: identifiers, records, the staleness
//! decision, pattern grouping, the remediation table, audit sweeps over
//! in-memory rows, knowledge document edits and summarizer output parsing.
//! Persistence lives in `briefing-kernel-store-sqlite`; orchestration in
//! `briefing-kernel-api`.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod audit;
mod context;
mod journal;
mod knowledge;
mod prompt;
mod remediation;

pub use audit::{
    assess_cache_staleness, assess_handoff_backlog, assess_output_quality, ActiveContactSnapshot,
    HandoffBacklog, OutputQuality, StalenessSweep, AUDIT_SERVICE, EMPTY_SUMMARY_PATTERN,
    HANDOFF_ESCALATION_PATTERN, HANDOFF_STUCK_PATTERN, SHORT_SUMMARY_PATTERN,
    STALE_CONTEXT_PATTERN,
};
pub use context::{
    assess_staleness, Contact, ContactHeader, ContactUpdate, ContextLevel, ContextRecord, Handoff,
    HandoffStatus, Interaction, InteractionDirection, NewContact, StalenessReason, Urgency,
    UsageEntry,
};
pub use journal::{
    group_patterns, is_rate_limit_message, summarize_errors, ErrorClass, ErrorPattern,
    ErrorRecord, ErrorSummary, NewErrorRecord, PatternKey, ResolveScope, ESCALATION_THRESHOLD,
    RECURRING_THRESHOLD,
};
pub use knowledge::{
    append_learnings, existing_learning_keys, render_learning, KnowledgeAppend, Learning,
    DEFAULT_KNOWLEDGE_MARKER,
};
pub use prompt::{
    build_briefing_prompt, build_digest_prompt, parse_generated_briefing,
    parse_interaction_digest, GeneratedBriefing, InteractionDigest,
};
pub use remediation::{decide_remediation, Remediation, RemediationAction};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("parse error: {0}")]
    Parse(String),
}

macro_rules! ulid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical 26-character ULID form.
            ///
            /// # Errors
            /// Returns [`KernelError::Parse`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, KernelError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    KernelError::Parse(format!(
                        "invalid {} `{raw}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

ulid_identifier!(
    /// Identity of a business contact.
    ContactId
);
ulid_identifier!(InteractionId);
ulid_identifier!(ErrorId);
ulid_identifier!(
    /// Identity of a coordination record (handoff).
    HandoffId
);
ulid_identifier!(UsageEntryId);

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCORE-001
    #[test]
    fn identifiers_round_trip_through_display_and_parse() {
        let id = ContactId::new();
        let parsed = match ContactId::parse(&id.to_string()) {
            Ok(parsed) => parsed,
            Err(err) => panic!("failed to parse generated id: {err}"),
        };
        assert_eq!(parsed, id);
    }

    // Test IDs: TCORE-002
    #[test]
    fn identifier_parse_rejects_garbage() {
        let Err(err) = ErrorId::parse("not-a-ulid") else {
            panic!("expected parse failure for garbage identifier");
        };
        assert!(err.to_string().contains("invalid ErrorId"));
    }

    // Test IDs: TCORE-003
    #[test]
    fn identifiers_serialize_as_bare_strings() {
        let id = HandoffId::new();
        let value = match serde_json::to_value(id) {
            Ok(value) => value,
            Err(err) => panic!("failed to serialize id: {err}"),
        };
        assert_eq!(value, serde_json::Value::String(id.to_string()));
    }
}
