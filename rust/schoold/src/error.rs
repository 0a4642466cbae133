use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input, rejected before any computation.
    #[error("{0}")]
    Input(String),

    /// Nothing to aggregate. Never reported as a zero.
    #[error("{0}")]
    EmptyData(String),

    /// The cached fee aggregate disagrees with the ledger.
    #[error("{message}")]
    Consistency {
        message: String,
        details: serde_json::Value,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn input(message: impl Into<String>) -> Self {
        EngineError::Input(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Input(_) => "bad_input",
            EngineError::EmptyData(_) => "no_data",
            EngineError::Consistency { .. } => "reconciliation_inconsistent",
            EngineError::NotFound(_) => "not_found",
            EngineError::Db(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EngineError::Consistency { details, .. } => Some(details.clone()),
            EngineError::NotFound(what) => Some(json!({ "entity": what })),
            _ => None,
        }
    }
}
