//! Application services for the contact briefing kernel.
//!
//! [`BriefingKernelApi`] owns the database path, the loaded configuration,
//! the summarizer client and the knowledge sink. Every store call runs on the
//! blocking pool against a freshly opened connection; migrations run on the
//! first call of each handle until one succeeds.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use briefing_kernel_core::{ErrorClass, NewErrorRecord};
use briefing_kernel_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

mod anneal;
mod audit;
mod cache;
pub mod config;
mod contacts;
mod error;
mod journal;
mod knowledge;
mod pipeline;
mod remediation;
pub mod scheduler;
pub mod summarizer;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use anneal::{AnnealingReport, PhaseOutcome, PhaseStatus, ANNEALING_SERVICE};
pub use audit::AuditReport;
pub use cache::{Briefing, NightlyRefreshReport, RefreshResult};
pub use config::BriefingConfig;
pub use contacts::{CreateHandoffRequest, LogInteractionRequest};
pub use error::BriefingError;
pub use journal::{ResolveRequest, ResolveResult, MAX_WINDOW_HOURS};
pub use knowledge::{KnowledgeSink, KnowledgeWrite};
pub use pipeline::{InteractionWindow, PIPELINE_SERVICE};
pub use remediation::RemediationOutcome;
pub use summarizer::{DisabledSummarizer, HttpSummarizer, Summarizer};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

struct Inner {
    db_path: PathBuf,
    config: BriefingConfig,
    summarizer: Arc<dyn Summarizer>,
    knowledge: KnowledgeSink,
    /// Set once migrations have been applied through this handle.
    schema_ready: Arc<AtomicBool>,
}

/// Cheap to clone; clones share configuration, summarizer and knowledge sink.
#[derive(Clone)]
pub struct BriefingKernelApi {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BriefingKernelApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BriefingKernelApi")
            .field("db_path", &self.inner.db_path)
            .field("knowledge", &self.inner.knowledge)
            .finish_non_exhaustive()
    }
}

impl BriefingKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: BriefingConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        let knowledge =
            KnowledgeSink::new(config.knowledge.path.clone(), config.knowledge.marker.clone());
        Self {
            inner: Arc::new(Inner {
                db_path,
                config,
                summarizer,
                knowledge,
                schema_ready: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BriefingConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn knowledge(&self) -> &KnowledgeSink {
        &self.inner.knowledge
    }

    pub(crate) fn summarizer(&self) -> &dyn Summarizer {
        self.inner.summarizer.as_ref()
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.inner.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        self.inner.schema_ready.store(true, Ordering::Release);
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run `quick_check` and `foreign_key_check`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the checks cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Run `f` against a migrated store on the blocking pool.
    ///
    /// Migrations run until the first success; later calls only open.
    pub(crate) async fn with_store<T, F>(&self, f: F) -> Result<T, BriefingError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T> + Send + 'static,
    {
        let db_path = self.inner.db_path.clone();
        let schema_ready = Arc::clone(&self.inner.schema_ready);
        let joined = tokio::task::spawn_blocking(move || {
            let mut store = SqliteStore::open(&db_path)?;
            if !schema_ready.load(Ordering::Acquire) {
                store.migrate()?;
                schema_ready.store(true, Ordering::Release);
            }
            f(&mut store)
        })
        .await;
        match joined {
            Ok(result) => result.map_err(BriefingError::Store),
            Err(err) => Err(BriefingError::Aborted(format!("store task failed: {err}"))),
        }
    }

    /// Run `task` on its own tokio task so a panic inside it is contained.
    ///
    /// A task that panics or is cancelled is journaled as an operational
    /// error under `service`/`operation`.
    pub(crate) async fn guarded<T, Fut>(
        &self,
        service: &'static str,
        operation: &'static str,
        task: Fut,
    ) -> Result<T, BriefingError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, BriefingError>> + Send + 'static,
    {
        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(err) => {
                let message = if err.is_panic() {
                    format!("{operation} panicked: {err}")
                } else {
                    format!("{operation} was cancelled: {err}")
                };
                tracing::error!(service, operation, error = %message, "task aborted");
                self.log_error(NewErrorRecord::new(
                    ErrorClass::Operational,
                    service,
                    operation,
                    message.clone(),
                ))
                .await;
                Err(BriefingError::Aborted(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{test_api, ScriptedSummarizer};

    use super::*;

    // Test IDs: TAPI-001
    #[test]
    fn migrate_dry_run_reports_pending_versions_then_applies() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1]);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let report = api.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }

    // Test IDs: TAPI-002
    #[tokio::test]
    async fn guarded_task_panic_is_journaled_as_operational() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());

        let result: Result<(), BriefingError> = api
            .guarded("self_annealing", "cycle", async {
                let fail = true;
                if fail {
                    panic!("boom");
                }
                Ok::<(), BriefingError>(())
            })
            .await;
        assert!(matches!(result, Err(BriefingError::Aborted(_))));

        let patterns = api.error_patterns(1).await?;
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_id, "operational:self_annealing:cycle");
        Ok(())
    }

    // Test IDs: TAPI-003
    #[tokio::test]
    async fn first_store_call_migrates_and_later_calls_skip_it() -> Result<()> {
        let (api, _summarizer) = test_api(ScriptedSummarizer::default());
        assert!(!api.inner.schema_ready.load(Ordering::Acquire));
        assert_eq!(api.schema_status()?.current_version, 0);

        assert_eq!(api.error_summary(1).await?.total, 0);
        assert!(api.inner.schema_ready.load(Ordering::Acquire));
        assert!(api.schema_status()?.pending_versions.is_empty());

        // Clones share the flag and keep working without re-migrating.
        let clone = api.clone();
        assert!(clone.inner.schema_ready.load(Ordering::Acquire));
        assert_eq!(clone.error_summary(1).await?.total, 0);
        Ok(())
    }
}
