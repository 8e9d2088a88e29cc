use briefing_kernel_core::{ErrorClass, KernelError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BriefingError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("summarizer failure ({classification}): {message}")]
    Summarizer { classification: ErrorClass, message: String },
    #[error("daily token budget exhausted for agent `{agent}`: used {used} of {budget}")]
    BudgetExceeded { agent: String, used: u64, budget: u64 },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("task aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl BriefingError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

impl From<KernelError> for BriefingError {
    fn from(err: KernelError) -> Self {
        Self::Validation(err.to_string())
    }
}
