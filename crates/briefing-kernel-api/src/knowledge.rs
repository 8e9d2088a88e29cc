use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use briefing_kernel_core::{append_learnings, Learning};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::BriefingError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeWrite {
    pub appended: usize,
    pub skipped: usize,
}

/// Shared knowledge document with one marker section for dated learnings.
///
/// Writers inside this process are serialized; the file is replaced through
/// a sibling temp file so readers never see a partial document.
#[derive(Debug)]
pub struct KnowledgeSink {
    path: PathBuf,
    marker: String,
    write_lock: Mutex<()>,
}

impl KnowledgeSink {
    #[must_use]
    pub fn new(path: PathBuf, marker: String) -> Self {
        Self { path, marker, write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append learnings dated today (UTC) under the marker, creating the
    /// document or the section when absent.
    ///
    /// # Errors
    /// Returns [`BriefingError::Store`] when the document cannot be read or replaced.
    pub async fn append(&self, learnings: &[Learning]) -> Result<KnowledgeWrite, BriefingError> {
        if learnings.is_empty() {
            return Ok(KnowledgeWrite::default());
        }
        let _guard = self.write_lock.lock().await;

        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(document) => document,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(BriefingError::Store(anyhow::Error::new(err).context(format!(
                    "failed to read knowledge document {}",
                    self.path.display()
                ))))
            }
        };

        let today = OffsetDateTime::now_utc().date();
        let edit = append_learnings(&current, &self.marker, today, learnings);
        if edit.appended > 0 {
            self.replace(&edit.document).await?;
        }
        tracing::info!(
            path = %self.path.display(),
            appended = edit.appended,
            skipped = edit.skipped,
            "knowledge document updated"
        );
        Ok(KnowledgeWrite { appended: edit.appended, skipped: edit.skipped })
    }

    async fn replace(&self, document: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, document)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use briefing_kernel_core::DEFAULT_KNOWLEDGE_MARKER;

    use super::*;
    use crate::testing::unique_temp_path;

    // Test IDs: TKS-001
    #[tokio::test]
    async fn creates_document_and_skips_repeated_keys() -> Result<()> {
        let dir = unique_temp_path("briefing-knowledge", "d");
        let sink = KnowledgeSink::new(dir.join("KNOWLEDGE.md"), DEFAULT_KNOWLEDGE_MARKER.to_string());
        let learnings = vec![
            Learning::keyed("budget_exceeded:regeneration_pipeline:generate_context", "Raise the budget."),
            Learning::unkeyed("Nightly refresh took longer than usual."),
        ];

        let first = sink.append(&learnings).await?;
        assert_eq!(first, KnowledgeWrite { appended: 2, skipped: 0 });
        let second = sink.append(&learnings).await?;
        assert_eq!(second, KnowledgeWrite { appended: 1, skipped: 1 });

        let document = tokio::fs::read_to_string(sink.path()).await?;
        assert!(document.contains(DEFAULT_KNOWLEDGE_MARKER));
        assert_eq!(document.matches("Raise the budget.").count(), 1);
        assert_eq!(document.matches("Nightly refresh took longer").count(), 2);
        Ok(())
    }

    // Test IDs: TKS-002
    #[tokio::test]
    async fn existing_content_is_preserved() -> Result<()> {
        let path = unique_temp_path("briefing-knowledge", "md");
        tokio::fs::write(&path, "# Team notes\n\nKeep replies short.\n").await?;
        let sink = KnowledgeSink::new(path.clone(), DEFAULT_KNOWLEDGE_MARKER.to_string());

        sink.append(&[Learning::unkeyed("Escalate churn risks early.")]).await?;
        let document = tokio::fs::read_to_string(&path).await?;
        assert!(document.starts_with("# Team notes\n\nKeep replies short.\n"));
        assert!(document.contains("Escalate churn risks early."));
        Ok(())
    }
}
