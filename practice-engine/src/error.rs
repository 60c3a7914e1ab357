use practice_utils::Area;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected before any write.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("session {0} is already closed")]
    SessionClosed(Uuid),

    /// Every tier of the cascade, including the bank-only terminal tier, came up empty.
    #[error("no questions available for {area}")]
    ContentExhausted { area: Area },

    /// A progress upsert kept losing races after a fresh read each time.
    #[error("write conflict on {area} level {level} for user {user} after {attempts} attempts")]
    WriteConflict {
        user: Uuid,
        area: Area,
        level: u8,
        attempts: u32,
    },

    #[error("storage error")]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub(crate) fn not_found(resource: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::WriteConflict { .. } => true,
            EngineError::Storage(e) => crate::store::is_contention(e),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
