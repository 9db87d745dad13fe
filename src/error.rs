//! Error taxonomy for the matching core.
//!
//! Four failure classes cross the component boundaries:
//! - [`MatchError::Validation`] — a malformed raw record or questionnaire
//!   item; recoverable, reported per item, never aborts a batch.
//! - [`MatchError::CapabilityUnavailable`] — the external embedding or
//!   text-understanding capability is down; callers degrade to
//!   structured-only behavior instead of failing the request.
//! - [`MatchError::Conflict`] — an optimistic revision check failed on a
//!   concurrent store write; the ingestion pipeline retries with a fresh
//!   read up to a bounded count.
//! - [`MatchError::StoreUnavailable`] — the knowledge base store cannot be
//!   read; fatal for a match request (no partial or guessed result).
//!
//! "No qualifying candidates" is deliberately *not* an error: it is a
//! first-class flag on [`MatchResponse`](crate::models::MatchResponse).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MatchError>;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("revision conflict on {dog_id}: expected {expected}, found {actual}")]
    Conflict {
        dog_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<sqlx::Error> for MatchError {
    fn from(e: sqlx::Error) -> Self {
        MatchError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for MatchError {
    fn from(e: serde_json::Error) -> Self {
        MatchError::Validation(e.to_string())
    }
}
