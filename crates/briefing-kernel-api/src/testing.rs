//! In-process fixtures shared by the api, service and cli test suites.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::BriefingConfig;
use crate::summarizer::{Completion, SummarizeRequest, Summarizer, SummarizerError};
use crate::BriefingKernelApi;

pub const CANNED_BRIEFING: &str = r#"{
  "summary": "Long-standing customer evaluating an expansion of their current plan this quarter.",
  "key_facts": ["Renewal due next month", "Prefers email"],
  "current_status": "Evaluating expansion",
  "recommended_tone": "Consultative",
  "risk_score": 0.2,
  "opportunity_score": 0.7,
  "risk_factors": [],
  "opportunity_factors": ["Budget approved"]
}"#;

pub const CANNED_DIGEST: &str = r#"{
  "summary": "Customer asked about pricing for additional seats.",
  "key_points": ["Wants 20 more seats"],
  "sentiment": "positive",
  "intent": "purchase"
}"#;

/// Summarizer that replays queued responses, then falls back to well-formed
/// output for the operation being called.
#[derive(Default)]
pub struct ScriptedSummarizer {
    queue: Mutex<VecDeque<Result<String, SummarizerError>>>,
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    pub fn push_text(&self, text: impl Into<String>) {
        self.lock().push_back(Ok(text.into()));
    }

    pub fn push_error(&self, error: SummarizerError) {
        self.lock().push_back(Err(error));
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, SummarizerError>>> {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn complete(&self, request: SummarizeRequest) -> Result<Completion, SummarizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lock().pop_front();
        let text = match next {
            Some(scripted) => scripted?,
            None if request.operation == "digest_interaction" => CANNED_DIGEST.to_string(),
            None => CANNED_BRIEFING.to_string(),
        };
        Ok(Completion { text, input_tokens: 400, output_tokens: 120, model: "scripted".to_string() })
    }
}

#[must_use]
pub fn unique_temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.{extension}", ulid::Ulid::new()))
}

/// Api over a fresh temporary database and knowledge document.
#[must_use]
pub fn test_api(summarizer: ScriptedSummarizer) -> (BriefingKernelApi, Arc<ScriptedSummarizer>) {
    test_api_with_config(BriefingConfig::default(), summarizer)
}

#[must_use]
pub fn test_api_with_config(
    mut config: BriefingConfig,
    summarizer: ScriptedSummarizer,
) -> (BriefingKernelApi, Arc<ScriptedSummarizer>) {
    config.knowledge.path = unique_temp_path("briefing-knowledge", "md");
    config.scheduler.nightly_batch_delay_secs = 0;
    let summarizer = Arc::new(summarizer);
    let api = BriefingKernelApi::new(
        unique_temp_path("briefing-kernel-api", "sqlite3"),
        config,
        summarizer.clone(),
    );
    (api, summarizer)
}
